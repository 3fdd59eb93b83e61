//! Gateway error types.
//!
//! The orchestrator surfaces failures through [`GatewayError`], wrapping the
//! leaf crates' errors.  Tool-level failures never appear here — they are
//! protocol data folded into tool messages by the bridge.

use gateway_ledger::LedgerError;
use gateway_mcp::McpError;
use gateway_provider::ProviderError;

/// Unified error type for the gateway core.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A provider adapter failed terminally (after any permitted retry).
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Toolset discovery failed.
    #[error(transparent)]
    Mcp(#[from] McpError),

    /// Settlement failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The model kept requesting tools past the configured ceiling.
    #[error("tool-calling loop exceeded {max_rounds} rounds")]
    ToolLoopExceeded { max_rounds: u32 },

    /// Gateway configuration is invalid.
    #[error("gateway config error: {reason}")]
    Config { reason: String },
}

/// Convenience alias used throughout the gateway core.
pub type Result<T> = std::result::Result<T, GatewayError>;
