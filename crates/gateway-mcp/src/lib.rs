//! MCP tool client for the completion gateway.
//!
//! Connects to external tool servers over the Model Context Protocol,
//! discovers their callable tools, and presents any number of servers as one
//! name-disambiguated toolset.
//!
//! ## Modules
//!
//! - [`rpc`] -- JSON-RPC 2.0 and MCP wire types.
//! - [`transport`] -- Session transports (stdio child process, HTTP).
//! - [`registry`] -- One server session: state machine, discovery, calls.
//! - [`bridge`] -- The merged toolset and bounded parallel dispatch.
//! - [`error`] -- MCP error types.

pub mod bridge;
pub mod error;
pub mod registry;
pub mod rpc;
pub mod transport;

// Re-export the most commonly used types at the crate root.
pub use bridge::{BridgeCall, BridgedTool, ToolBridge, ToolDispatch, ToolsetSnapshot};
pub use error::{McpError, Result};
pub use registry::{
    ConnectionState, DEFAULT_CALL_TIMEOUT, ToolCallOutcome, ToolRegistry, ToolServerConfig,
};
pub use rpc::{McpTool, ServerInfo};
pub use transport::{HttpTransport, McpTransport, StdioTransport};
