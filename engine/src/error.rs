//! Error types for the Tangle engine.

use crate::{DatabaseId, Etag, Key};
use thiserror::Error;

/// All possible errors from the Tangle engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Storage errors
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("concurrency conflict on '{key}': expected etag {expected}, found {actual}")]
    ConcurrencyConflict {
        key: Key,
        expected: Etag,
        actual: Etag,
    },

    #[error("item not found: {0}")]
    NotFound(Key),

    // Replication errors
    #[error("invalid replication batch: {0}")]
    InvalidBatch(String),

    #[error("database {0} cannot replicate to itself")]
    SelfReplication(DatabaseId),

    #[error("failed to record replication bookmark for '{from}': {reason}")]
    Bookmark { from: DatabaseId, reason: String },

    #[error("item is not in conflict: {0}")]
    NotConflicted(Key),

    #[error("'{holder}' is not a conflict holder of '{key}'")]
    UnknownConflictHolder { key: Key, holder: Key },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("serialization failure: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether the caller should re-fetch and try again.
    ///
    /// Only an optimistic-concurrency mismatch is retryable; it means another
    /// writer touched the same key at the storage layer, which is unrelated
    /// to replication conflicts between masters.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
