//! MCP client error types.
//!
//! Failures the model is allowed to see (unknown tool, bad arguments,
//! transport trouble during a call) are folded into tool outcomes by the
//! bridge; the variants here let it classify them.  Only lifecycle misuse
//! and protocol-level faults propagate as hard errors.

/// Unified error type for the MCP client crate.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// An operation was invoked while the registry is not connected.
    #[error("tool server `{server}` is not connected")]
    NotConnected { server: String },

    /// The transport failed to deliver a request or response.
    #[error("mcp transport error: {reason}")]
    Transport { reason: String },

    /// A request exceeded its time limit.
    #[error("mcp request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The remote side sent data that violates the protocol.
    #[error("mcp protocol error: {reason}")]
    Protocol { reason: String },

    /// The server reported a JSON-RPC error.
    #[error("mcp server error {code}: {message}")]
    Server { code: i32, message: String },

    /// The requested tool is absent from the server's last listing.
    #[error("tool not found: `{tool_name}`")]
    ToolNotFound { tool_name: String },

    /// The arguments do not satisfy the tool's input schema.
    #[error("invalid arguments for tool `{tool_name}`: {reason}")]
    InvalidArguments { tool_name: String, reason: String },

    /// An I/O operation on the transport failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the MCP crate.
pub type Result<T> = std::result::Result<T, McpError>;
