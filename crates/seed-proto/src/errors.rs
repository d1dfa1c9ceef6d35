//! Protocol error types.
//!
//! Two families of failure reach a client as `status: false`:
//! - malformed requests (not JSON, no `type`, unknown `type`, wrong shape)
//! - validation failures (bad base64, wrong decoded length)
//!
//! [`ProtocolError::is_validation`] tells them apart for logging.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while decoding or validating wire envelopes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input was not valid JSON, or did not match the expected shape.
    #[error("malformed json: {0}")]
    Json(String),

    /// Object had no string `type` discriminant.
    #[error("missing request type")]
    MissingType,

    /// `type` discriminant is not one the server understands.
    #[error("unknown request type: {0}")]
    UnknownType(String),

    /// A binary field was not valid standard base64.
    #[error("invalid base64 in {field}: {reason}")]
    InvalidBase64 {
        /// Wire name of the offending field
        field: &'static str,
        /// Decoder message
        reason: String,
    },

    /// A fixed-length binary field decoded to the wrong size.
    #[error("invalid {field} length: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// Wire name of the offending field
        field: &'static str,
        /// Required decoded length
        expected: usize,
        /// Actual decoded length
        got: usize,
    },

    /// Outbound envelope could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Returns true for field-level validation failures.
    ///
    /// Everything else is a malformed request (or an encode bug).
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidBase64 { .. } | Self::InvalidLength { .. })
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}
