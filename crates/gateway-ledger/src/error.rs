//! Error types for the gateway-ledger crate.
//!
//! All ledger operations return [`LedgerError`] via [`LedgerResult`].

use thiserror::Error;

/// Alias for `Result<T, LedgerError>`.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors that can occur in the usage ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// The account's balance is below the amount to deduct.  Raised by the
    /// atomic check-and-decrement, never by the advisory pre-check.
    #[error("insufficient balance for user `{user_id}`: need {required}, have {available}")]
    InsufficientBalance {
        user_id: String,
        required: i64,
        available: i64,
    },

    /// No account exists for the given user.
    #[error("account not found: {user_id}")]
    AccountNotFound { user_id: String },

    /// An invalid argument was provided to a ledger operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for LedgerError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
