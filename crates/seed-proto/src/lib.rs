//! Seed wire protocol.
//!
//! Clients talk to the server with JSON text frames. Every inbound frame is a
//! [`Request`] discriminated by its `type` field; every outbound frame is a
//! [`ServerMessage`] (a status/history response or an event).
//!
//! Binary fields (chat id, signature, content, content IV) travel as standard
//! base64 strings. [`WireMessage`] is the on-the-wire shape, [`Message`] is the
//! validated domain value with fixed-length fields decoded.
//!
//! # Invariants
//!
//! - A [`StreamKey`] is always exactly [`STREAM_KEY_LEN`] bytes.
//! - A [`Message`] always carries a [`SIGNATURE_LEN`]-byte signature and a
//!   [`CONTENT_IV_LEN`]-byte content IV. Content length is unconstrained.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod key;
pub mod message;
pub mod request;
pub mod response;

pub use errors::{ProtocolError, Result};
pub use key::StreamKey;
pub use message::{Message, WireMessage};
pub use request::{HistoryRequest, Request, SendRequest, SubscribeRequest, UnsubscribeRequest};
pub use response::{Event, ServerMessage};

/// Decoded length of a chat id.
pub const STREAM_KEY_LEN: usize = 32;

/// Decoded length of a message signature.
pub const SIGNATURE_LEN: usize = 32;

/// Decoded length of a content IV.
pub const CONTENT_IV_LEN: usize = 12;
