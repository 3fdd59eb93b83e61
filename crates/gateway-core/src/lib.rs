//! Completion orchestrator for the conversational completion gateway.
//!
//! This crate ties the gateway together: it drives the multi-round
//! tool-calling loop against a [`gateway_provider::ProviderAdapter`] and a
//! [`gateway_mcp::ToolBridge`], streams deltas to the caller with mid-turn
//! cancellation, and hands concluded turns to the
//! [`gateway_ledger::UsageLedger`] for settlement.
//!
//! ```text
//! ┌──────────┐   stream()   ┌──────────────┐  invoke_all()  ┌────────────┐
//! │ Provider │─────────────>│ Orchestrator │───────────────>│ ToolBridge │
//! │ Adapter  │<─────────────│  (turn loop) │<───────────────│ (N MCP     │
//! └──────────┘  tool msgs   └──────┬───────┘   outcomes     │  servers)  │
//!                                  │ TurnEvent stream       └────────────┘
//!                                  v
//!                            caller / SSE layer ──> UsageLedger.settle()
//! ```
//!
//! ## Modules
//!
//! - [`orchestrator`] -- The turn state machine and caller-facing stream.
//! - [`config`] -- TOML + environment configuration for the whole gateway.
//! - [`error`] -- Gateway error types.

pub mod config;
pub mod error;
pub mod orchestrator;

// Re-export the most commonly used types at the crate root.
pub use config::{
    BillingSettings, GatewayConfig, Limits, ProviderKind, ProviderSettings, ToolServerSettings,
};
pub use error::{GatewayError, Result};
pub use orchestrator::{
    FailureReason, Orchestrator, OrchestratorConfig, ToolCallInfo, TurnEvent, TurnHandle,
    TurnOutcome, TurnStatus, TurnStream,
};
