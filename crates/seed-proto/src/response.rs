//! Outbound envelopes.
//!
//! ```text
//! {"type":"response","status":true}
//! {"type":"response","messages":[...]}
//! {"type":"event","event":{"type":"new","message":{...}}}
//! {"type":"event","event":{"type":"wait","queueId":"..."}}
//! ```

use serde::{Deserialize, Serialize};

use crate::{
    Message, StreamKey, WireMessage,
    errors::{ProtocolError, Result},
};

/// Anything the server writes to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Reply to a request: either a status or a history page.
    Response {
        /// Outcome of the request.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<bool>,
        /// History page, newest first.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        messages: Option<Vec<WireMessage>>,
    },
    /// Unsolicited push.
    Event {
        /// Event body.
        event: Event,
    },
}

/// Push events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    /// A message was persisted (or replayed during catch-up).
    New {
        /// The message.
        message: WireMessage,
    },
    /// Catch-up for a chat is complete; live events follow.
    Wait {
        /// Base64 chat id.
        #[serde(rename = "queueId")]
        queue_id: String,
    },
}

impl ServerMessage {
    /// `{"type":"response","status":…}`.
    pub fn status(ok: bool) -> Self {
        Self::Response { status: Some(ok), messages: None }
    }

    /// History page response.
    pub fn history(messages: &[Message]) -> Self {
        Self::Response { status: None, messages: Some(messages.iter().map(Message::to_wire).collect()) }
    }

    /// New-message event.
    pub fn new_message(message: &Message) -> Self {
        Self::Event { event: Event::New { message: message.to_wire() } }
    }

    /// Catch-up complete marker.
    pub fn wait(key: &StreamKey) -> Self {
        Self::Event { event: Event::Wait { queue_id: key.to_base64() } }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parse a JSON text frame written by the server.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
