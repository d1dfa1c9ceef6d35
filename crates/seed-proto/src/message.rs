//! Chat messages.
//!
//! [`WireMessage`] is what clients send and receive: every binary field is a
//! base64 string. [`Message`] is the validated form the server persists and
//! fans out.
//!
//! Validation (see [`Message::try_from`]) checks that the chat id, signature
//! and content IV decode to their fixed lengths. Content must be valid base64
//! but its length is not checked.

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    CONTENT_IV_LEN, SIGNATURE_LEN, StreamKey,
    errors::{ProtocolError, Result},
};

/// Message as it appears in JSON envelopes.
///
/// The chat id is serialized as `queueId`; `chatId` is accepted on input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Per-chat sequence number assigned by the publisher.
    pub nonce: u64,
    /// Base64 chat id.
    #[serde(rename = "queueId", alias = "chatId")]
    pub queue_id: String,
    /// Base64 signature.
    pub signature: String,
    /// Base64 (opaque, typically encrypted) content.
    pub content: String,
    /// Base64 content IV.
    #[serde(rename = "contentIV")]
    pub content_iv: String,
}

/// Validated chat message.
///
/// # Invariants
///
/// - `sequence` is unique per `stream_key` once persisted, and persisted
///   sequences for a key form the gap-free range `0..=last`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Per-chat sequence number (the wire `nonce`).
    pub sequence: u64,
    /// Chat this message belongs to.
    pub stream_key: StreamKey,
    /// Publisher signature.
    pub signature: [u8; SIGNATURE_LEN],
    /// Opaque content bytes.
    pub content: Bytes,
    /// IV used to encrypt `content`.
    pub content_iv: [u8; CONTENT_IV_LEN],
}

impl Message {
    /// Wire representation of this message.
    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            nonce: self.sequence,
            queue_id: self.stream_key.to_base64(),
            signature: STANDARD.encode(self.signature),
            content: STANDARD.encode(&self.content),
            content_iv: STANDARD.encode(self.content_iv),
        }
    }
}

impl TryFrom<&WireMessage> for Message {
    type Error = ProtocolError;

    fn try_from(wire: &WireMessage) -> Result<Self> {
        let stream_key = StreamKey::from_base64("queueId", &wire.queue_id)?;
        let signature = decode_fixed::<SIGNATURE_LEN>("signature", &wire.signature)?;
        let content_iv = decode_fixed::<CONTENT_IV_LEN>("contentIV", &wire.content_iv)?;
        let content = decode("content", &wire.content)?;

        Ok(Self {
            sequence: wire.nonce,
            stream_key,
            signature,
            content: Bytes::from(content),
            content_iv,
        })
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = ProtocolError;

    fn try_from(wire: WireMessage) -> Result<Self> {
        Self::try_from(&wire)
    }
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        message.to_wire()
    }
}

fn decode(field: &'static str, encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .map_err(|e| ProtocolError::InvalidBase64 { field, reason: e.to_string() })
}

fn decode_fixed<const N: usize>(field: &'static str, encoded: &str) -> Result<[u8; N]> {
    let bytes = decode(field, encoded)?;
    bytes.as_slice().try_into().map_err(|_| ProtocolError::InvalidLength {
        field,
        expected: N,
        got: bytes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::STREAM_KEY_LEN;

    fn wire(signature_len: usize, iv_len: usize) -> WireMessage {
        WireMessage {
            nonce: 3,
            queue_id: STANDARD.encode([9u8; STREAM_KEY_LEN]),
            signature: STANDARD.encode(vec![1u8; signature_len]),
            content: STANDARD.encode(b"ciphertext"),
            content_iv: STANDARD.encode(vec![2u8; iv_len]),
        }
    }

    #[test]
    fn valid_message_decodes() {
        let message = Message::try_from(&wire(32, 12)).unwrap();
        assert_eq!(message.sequence, 3);
        assert_eq!(message.stream_key.as_bytes(), &[9u8; STREAM_KEY_LEN]);
        assert_eq!(message.content.as_ref(), b"ciphertext");
        assert_eq!(message.to_wire(), wire(32, 12));
    }

    #[test]
    fn wrong_signature_length_rejected() {
        let err = Message::try_from(&wire(31, 12)).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InvalidLength { field: "signature", expected: 32, got: 31 }
        );
    }

    #[test]
    fn wrong_iv_length_rejected() {
        let err = Message::try_from(&wire(32, 16)).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidLength { field: "contentIV", .. }));
    }

    #[test]
    fn content_length_is_not_validated() {
        let mut w = wire(32, 12);
        w.content = String::new();
        let message = Message::try_from(&w).unwrap();
        assert!(message.content.is_empty());
    }

    #[test]
    fn chat_id_alias_accepted() {
        let json = format!(
            r#"{{"nonce":0,"chatId":"{}","signature":"","content":"","contentIV":""}}"#,
            STANDARD.encode([0u8; STREAM_KEY_LEN])
        );
        let w: WireMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(w.queue_id, STANDARD.encode([0u8; STREAM_KEY_LEN]));
    }
}
