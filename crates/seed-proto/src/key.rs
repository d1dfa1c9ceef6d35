//! Stream keys.
//!
//! A chat is identified by a 32-byte opaque key. On the wire it is the
//! standard base64 encoding of those bytes; in memory it is a `Copy` array so
//! it can key hash maps and storage tables without allocation.

use std::{fmt, str::FromStr};

use base64::{Engine, engine::general_purpose::STANDARD};

use crate::{
    STREAM_KEY_LEN,
    errors::{ProtocolError, Result},
};

/// Opaque fixed-length identifier of a chat stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey([u8; STREAM_KEY_LEN]);

impl StreamKey {
    /// Wrap raw key bytes.
    pub const fn from_bytes(bytes: [u8; STREAM_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Decode a key from its base64 wire form.
    ///
    /// `field` is the wire name used in error messages (`chatId` or
    /// `queueId` depending on the envelope).
    pub fn from_base64(field: &'static str, encoded: &str) -> Result<Self> {
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| ProtocolError::InvalidBase64 { field, reason: e.to_string() })?;

        let bytes: [u8; STREAM_KEY_LEN] =
            decoded.as_slice().try_into().map_err(|_| ProtocolError::InvalidLength {
                field,
                expected: STREAM_KEY_LEN,
                got: decoded.len(),
            })?;

        Ok(Self(bytes))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; STREAM_KEY_LEN] {
        &self.0
    }

    /// Base64 wire form.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl FromStr for StreamKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_base64("chatId", s)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamKey({})", self.to_base64())
    }
}
