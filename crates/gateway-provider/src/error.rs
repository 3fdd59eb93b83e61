//! Provider error types.
//!
//! All provider adapters surface errors through [`ProviderError`].  The
//! orchestrator relies on [`ProviderError::is_transient`] to decide whether a
//! failed round may be retried, so every variant must classify itself.

/// Unified error type for provider adapters.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Adapter construction or request preparation failed.  Raised before any
    /// network call is made; never retried.
    #[error("provider config error: {reason}")]
    Config { reason: String },

    /// An HTTP request to the provider failed (connect, send, or a non-2xx
    /// status).
    #[error("provider transport error: {reason}")]
    Transport { reason: String },

    /// The streaming connection was interrupted or produced invalid data
    /// mid-stream.
    #[error("provider stream error: {reason}")]
    Stream { reason: String },

    /// The provider's response could not be parsed into the expected format.
    #[error("provider response parse error: {reason}")]
    Parse { reason: String },

    /// The conversation violates an invariant the provider would reject
    /// (role alternation, dangling tool references).
    #[error("invalid conversation: {reason}")]
    InvalidConversation { reason: String },

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProviderError {
    /// Whether the failure is transient and the current round may be retried.
    ///
    /// Config, parse, and conversation errors are deterministic — retrying
    /// would fail identically.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Stream { .. })
    }
}

/// Convenience alias used throughout the provider crate.
pub type Result<T> = std::result::Result<T, ProviderError>;

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            reason: err.to_string(),
        }
    }
}
