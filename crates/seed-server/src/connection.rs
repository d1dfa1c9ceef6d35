//! Connection handles.
//!
//! A [`ConnectionHandle`] is how the engine refers to a live connection. It
//! carries the process-local id, the sending half of the connection's bounded
//! outbound queue (drained by the connection's writer task), and a close
//! signal the session loop listens on.
//!
//! Handles are cheap to clone. The registry, stream workers and the session
//! all hold clones; none of them own the connection itself.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use seed_proto::ServerMessage;
use tokio::sync::{
    Notify,
    mpsc::{self, error::TrySendError},
};

/// Process-local connection identifier.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Reference to a live connection's outbound queue and close signal.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<String>,
    close: Arc<Notify>,
}

impl ConnectionHandle {
    /// Create a handle with a freshly allocated id and its outbound queue.
    ///
    /// The receiver must be drained by whoever writes to the transport.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        Self::with_id(id, capacity)
    }

    /// Same as [`channel`](Self::channel) with an explicit id.
    pub fn with_id(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        (Self { id, outbound, close: Arc::new(Notify::new()) }, rx)
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an encoded frame without waiting.
    ///
    /// Fails when the queue is full or the writer is gone. Callers outside
    /// the connection's own session treat either case as a dead connection.
    pub fn try_send(&self, frame: String) -> Result<(), TrySendError<String>> {
        self.outbound.try_send(frame)
    }

    /// Queue an encoded frame, waiting for space.
    ///
    /// Only the connection's own session awaits on its queue.
    pub async fn send(&self, frame: String) -> bool {
        self.outbound.send(frame).await.is_ok()
    }

    /// Encode and queue a server message without waiting.
    pub fn try_reply(&self, message: &ServerMessage) -> bool {
        match message.encode() {
            Ok(frame) => self.try_send(frame).is_ok(),
            Err(e) => {
                tracing::error!(connection = self.id, "failed to encode reply: {}", e);
                false
            },
        }
    }

    /// Encode and queue a server message, waiting for space.
    pub async fn reply(&self, message: &ServerMessage) -> bool {
        match message.encode() {
            Ok(frame) => self.send(frame).await,
            Err(e) => {
                tracing::error!(connection = self.id, "failed to encode reply: {}", e);
                false
            },
        }
    }

    /// Ask the session owning this connection to shut down.
    ///
    /// The signal is latched, so a session that is busy processing a request
    /// sees it on its next wait.
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.close.notified().await;
    }

    /// Whether the writer side of the outbound queue is gone.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let (a, _rx_a) = ConnectionHandle::channel(1);
        let (b, _rx_b) = ConnectionHandle::channel(1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn try_send_fails_when_full_or_closed() {
        let (handle, mut rx) = ConnectionHandle::with_id(1, 1);

        assert!(handle.try_send("a".to_string()).is_ok());
        assert!(matches!(handle.try_send("b".to_string()), Err(TrySendError::Full(_))));

        assert_eq!(rx.try_recv().unwrap(), "a");
        drop(rx);
        assert!(handle.is_closed());
        assert!(matches!(handle.try_send("c".to_string()), Err(TrySendError::Closed(_))));
    }

    #[tokio::test]
    async fn close_signal_is_latched() {
        let (handle, _rx) = ConnectionHandle::with_id(1, 1);
        handle.close();
        // Resolves even though nobody was waiting when close was called
        handle.closed().await;
    }

    #[tokio::test]
    async fn reply_encodes_json() {
        let (handle, mut rx) = ConnectionHandle::with_id(1, 4);
        assert!(handle.reply(&ServerMessage::status(true)).await);
        assert!(handle.try_reply(&ServerMessage::status(false)));

        assert_eq!(rx.recv().await.unwrap(), r#"{"type":"response","status":true}"#);
        assert_eq!(rx.recv().await.unwrap(), r#"{"type":"response","status":false}"#);
    }
}
