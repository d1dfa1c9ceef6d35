//! Storage error types.

use thiserror::Error;

/// Errors returned by [`Storage`](super::Storage) backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The message sequence is not exactly one past the last persisted one.
    ///
    /// Nothing was written. The publisher must resubmit with `expected`.
    #[error("sequence conflict: expected {expected}, got {got}")]
    SequenceConflict {
        /// Sequence the stream expects next
        expected: u64,
        /// Sequence that was submitted
        got: u64,
    },

    /// A stored record could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backend I/O failure (disk, transaction, or a failed blocking task).
    #[error("I/O error: {0}")]
    Io(String),
}

impl StorageError {
    /// Whether the error is a sequence conflict rather than a storage fault.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::SequenceConflict { .. })
    }
}
