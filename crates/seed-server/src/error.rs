//! Server error types.
//!
//! [`RequestError`] covers everything that can go wrong while handling one
//! client request. Every variant is answered with `status: false` and none of
//! them end the connection. [`ServerError`] is reserved for the runtime
//! boundary: startup, binding and accepting.

use seed_proto::ProtocolError;
use thiserror::Error;

use crate::storage::StorageError;

/// Failure of a single request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Undecodable JSON, wrong shape, or an unknown request type.
    #[error("malformed request: {0}")]
    Malformed(ProtocolError),

    /// A binary field has the wrong decoded length or is not base64.
    #[error("validation failed: {0}")]
    Validation(ProtocolError),

    /// The nonce is not exactly one past the stream's last persisted nonce.
    ///
    /// The message is discarded; the publisher must resubmit.
    #[error("sequence conflict: expected {expected}, got {got}")]
    SequenceConflict {
        /// Nonce the stream expects next
        expected: u64,
        /// Nonce that was submitted
        got: u64,
    },

    /// The persistence gateway failed. Logged, not retried.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// The stream's worker already holds a pending publish.
    #[error("stream queue is full")]
    QueueFull,

    /// The connection is not registered with the stream registry.
    #[error("connection is not registered")]
    NotRegistered,
}

impl From<ProtocolError> for RequestError {
    fn from(err: ProtocolError) -> Self {
        if err.is_validation() { Self::Validation(err) } else { Self::Malformed(err) }
    }
}

impl From<StorageError> for RequestError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::SequenceConflict { expected, got } => {
                Self::SequenceConflict { expected, got }
            },
            other => Self::Storage(other),
        }
    }
}

/// Errors that can occur in the server runtime.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, unusable path, etc.).
    ///
    /// Fatal: prevents startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport/network error (bind failure, accept failure, I/O error).
    #[error("transport error: {0}")]
    Transport(String),

    /// Storage backend could not be opened.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
