//! Inbound requests.
//!
//! Decoding is two-phase: the frame is parsed once into a JSON value, the
//! `type` discriminant is read, and only then is the variant-specific body
//! decoded. Unknown discriminants fail closed with
//! [`ProtocolError::UnknownType`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    StreamKey, WireMessage,
    errors::{ProtocolError, Result},
};

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Request {
    /// Liveness check, answered with `status: true`.
    Ping,
    /// Publish a message to a chat.
    Send(SendRequest),
    /// Subscribe to a chat and catch up from a nonce.
    Subscribe(SubscribeRequest),
    /// Stop receiving events for a chat.
    Unsubscribe(UnsubscribeRequest),
    /// Fetch recent history for a chat, newest first.
    History(HistoryRequest),
}

/// Body of a `send` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Message to publish.
    pub message: WireMessage,
}

/// Body of a `subscribe` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Base64 chat id.
    #[serde(rename = "chatId", alias = "queueId")]
    pub chat_id: String,
    /// First nonce to replay during catch-up.
    #[serde(default)]
    pub nonce: u64,
}

/// Body of an `unsubscribe` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    /// Base64 chat id.
    #[serde(rename = "chatId", alias = "queueId")]
    pub chat_id: String,
}

/// Body of a `history` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    /// Base64 chat id.
    #[serde(rename = "chatId", alias = "queueId")]
    pub chat_id: String,
    /// Newest nonce to include. `None` means the latest message.
    #[serde(default)]
    pub nonce: Option<u64>,
    /// Maximum number of messages to return.
    pub amount: usize,
}

impl Request {
    /// Decode a request from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(ProtocolError::MissingType)?;

        match kind.as_str() {
            "ping" => Ok(Self::Ping),
            "send" => Ok(Self::Send(serde_json::from_value(value)?)),
            "subscribe" => Ok(Self::Subscribe(serde_json::from_value(value)?)),
            "unsubscribe" => Ok(Self::Unsubscribe(serde_json::from_value(value)?)),
            "history" => Ok(Self::History(serde_json::from_value(value)?)),
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }

    /// Encode this request as a JSON text frame.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Wire name of the request type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Send(_) => "send",
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::History(_) => "history",
        }
    }
}

impl SubscribeRequest {
    /// Validated chat key.
    pub fn stream_key(&self) -> Result<StreamKey> {
        StreamKey::from_base64("chatId", &self.chat_id)
    }
}

impl UnsubscribeRequest {
    /// Validated chat key.
    pub fn stream_key(&self) -> Result<StreamKey> {
        StreamKey::from_base64("chatId", &self.chat_id)
    }
}

impl HistoryRequest {
    /// Validated chat key.
    pub fn stream_key(&self) -> Result<StreamKey> {
        StreamKey::from_base64("chatId", &self.chat_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_ping() {
        assert_eq!(Request::decode(r#"{"type":"ping"}"#).unwrap(), Request::Ping);
    }

    #[test]
    fn subscribe_nonce_defaults_to_zero() {
        let req = Request::decode(r#"{"type":"subscribe","chatId":"AAAA"}"#).unwrap();
        assert_eq!(
            req,
            Request::Subscribe(SubscribeRequest { chat_id: "AAAA".to_string(), nonce: 0 })
        );
    }

    #[test]
    fn history_nonce_may_be_null() {
        let req =
            Request::decode(r#"{"type":"history","chatId":"AAAA","nonce":null,"amount":5}"#)
                .unwrap();
        match req {
            Request::History(h) => {
                assert_eq!(h.nonce, None);
                assert_eq!(h.amount, 5);
            },
            other => panic!("expected history, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_closed() {
        let err = Request::decode(r#"{"type":"delete","chatId":"AAAA"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("delete".to_string()));
    }

    #[test]
    fn missing_type_rejected() {
        assert_eq!(Request::decode(r#"{"chatId":"AAAA"}"#), Err(ProtocolError::MissingType));
        assert_eq!(Request::decode(r#"{"type":7}"#), Err(ProtocolError::MissingType));
    }

    #[test]
    fn wrong_shape_is_malformed() {
        let err = Request::decode(r#"{"type":"send","message":{"nonce":-1}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));

        let err = Request::decode("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn encode_produces_decodable_frame() {
        let req = Request::Unsubscribe(UnsubscribeRequest { chat_id: "AAAA".to_string() });
        let text = req.encode().unwrap();
        assert_eq!(text, r#"{"type":"unsubscribe","chatId":"AAAA"}"#);
        assert_eq!(Request::decode(&text).unwrap(), req);
    }
}
