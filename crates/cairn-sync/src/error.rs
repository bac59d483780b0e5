//! Error types for Cairn sync.

use cairn_ledger::RuleViolation;
use thiserror::Error;

/// Result type for Cairn sync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Cairn sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Voting on a drop that does not exist or was deleted
    #[error("Item unavailable: {0}")]
    ItemUnavailable(String),

    /// Optimistic transaction kept conflicting until the retry bound
    #[error("Transaction conflict after {attempts} attempts")]
    TransactionConflict { attempts: u32 },

    /// Transaction closure gave up without writing
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    /// Remote store could not be reached
    #[error("Remote unreachable: {0}")]
    RemoteUnreachable(String),

    /// The remote store refused a write
    #[error("Write rejected: {0}")]
    Rule(#[from] RuleViolation),

    /// Operation needs a signed-in user
    #[error("No signed-in user")]
    NotSignedIn,

    /// Redemption limit already reached
    #[error("Redemption limit reached for {item_id}: {count}/{limit}")]
    RedemptionLimitReached {
        item_id: String,
        count: u32,
        limit: u32,
    },

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransactionConflict { .. } | Error::RemoteUnreachable(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
