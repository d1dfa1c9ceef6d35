//! Fan-out of persisted messages to live subscribers.
//!
//! Delivery is best-effort and at-most-once. The event is encoded once and
//! offered to every live subscriber's outbound queue without waiting. A
//! subscriber whose queue is closed or full is treated as dead: it is
//! disconnected through the registry and its session is told to close. There
//! is no retry; a reconnecting client catches up through `subscribe`.
//!
//! A subscriber may be handed more than one event for a single call when the
//! message closes a gap left by a publish that was still being persisted.

use seed_proto::{Message, ServerMessage};
use tokio::sync::mpsc::error::TrySendError;

use crate::{
    connection::ConnectionHandle,
    registry::{DeliveryTarget, StreamRegistry},
    storage::Storage,
};

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Subscribers that had the event queued.
    pub delivered: usize,
    /// Subscribers dropped because the event could not be queued.
    pub pruned: usize,
}

/// Push a `new` event for `message` to every live subscriber of its stream.
///
/// Must be called after the message is durable.
pub fn deliver<S: Storage>(registry: &StreamRegistry<S>, message: &Message) -> DeliveryReport {
    let targets = registry.delivery_targets(message);
    let mut report = DeliveryReport::default();
    if targets.is_empty() {
        return report;
    }

    let Some(frame) = encode(message) else {
        return report;
    };

    for DeliveryTarget { handle, messages } in targets {
        let mut failure = None;
        for ready in &messages {
            let ready_frame = if ready.sequence == message.sequence {
                frame.clone()
            } else {
                match encode(ready) {
                    Some(encoded) => encoded,
                    None => continue,
                }
            };

            if let Err(err) = handle.try_send(ready_frame) {
                failure = Some(err);
                break;
            }
        }

        match failure {
            None => report.delivered += 1,
            Some(err) => {
                let reason = match err {
                    TrySendError::Full(_) => "outbound queue full",
                    TrySendError::Closed(_) => "connection closed",
                };
                prune(registry, &handle, reason);
                report.pruned += 1;
            },
        }
    }

    report
}

/// Disconnect a connection that can no longer keep up and tell its session
/// to close.
pub(crate) fn prune<S: Storage>(
    registry: &StreamRegistry<S>,
    handle: &ConnectionHandle,
    reason: &'static str,
) {
    tracing::debug!(connection = handle.id(), reason, "dropping connection");
    registry.disconnect(handle.id());
    handle.close();
}

fn encode(message: &Message) -> Option<String> {
    match ServerMessage::new_message(message).encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!(stream = %message.stream_key, "failed to encode event: {}", e);
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use seed_proto::StreamKey;

    use super::*;
    use crate::{registry::Resume, storage::MemoryStorage};

    fn key() -> StreamKey {
        StreamKey::from_bytes([8u8; 32])
    }

    fn message(sequence: u64) -> Message {
        Message {
            sequence,
            stream_key: key(),
            signature: [0u8; 32],
            content: Bytes::from_static(b"payload"),
            content_iv: [0u8; 12],
        }
    }

    fn live_subscriber(
        registry: &std::sync::Arc<StreamRegistry<MemoryStorage>>,
        id: u64,
        capacity: usize,
    ) -> (ConnectionHandle, tokio::sync::mpsc::Receiver<String>) {
        let (handle, mut rx) = ConnectionHandle::with_id(id, capacity);
        registry.register(handle.clone());
        registry.subscribe(id, key());
        assert!(registry.finish_catch_up(
            &handle,
            &key(),
            Resume::Exact(0),
            &ServerMessage::wait(&key())
        ));
        // Discard the wait event
        rx.try_recv().unwrap();
        (handle, rx)
    }

    #[tokio::test]
    async fn delivers_to_every_live_subscriber() {
        let registry = StreamRegistry::new(MemoryStorage::new());
        let (_a, mut rx_a) = live_subscriber(&registry, 1, 4);
        let (_b, mut rx_b) = live_subscriber(&registry, 2, 4);

        let report = deliver(&registry, &message(0));
        assert_eq!(report, DeliveryReport { delivered: 2, pruned: 0 });

        let expected = ServerMessage::new_message(&message(0)).encode().unwrap();
        assert_eq!(rx_a.try_recv().unwrap(), expected);
        assert_eq!(rx_b.try_recv().unwrap(), expected);
    }

    #[tokio::test]
    async fn no_subscribers_is_a_no_op() {
        let registry = StreamRegistry::new(MemoryStorage::new());
        assert_eq!(deliver(&registry, &message(0)), DeliveryReport::default());
    }

    #[tokio::test]
    async fn closed_subscriber_is_pruned() {
        let registry = StreamRegistry::new(MemoryStorage::new());
        let (_a, rx_a) = live_subscriber(&registry, 1, 4);
        let (_b, mut rx_b) = live_subscriber(&registry, 2, 4);
        drop(rx_a);

        let report = deliver(&registry, &message(0));
        assert_eq!(report, DeliveryReport { delivered: 1, pruned: 1 });

        assert!(!registry.is_registered(1));
        assert!(!registry.is_subscribed(1, &key()));
        assert!(registry.is_subscribed(2, &key()));
        assert!(rx_b.try_recv().is_ok());
        assert!(registry.is_consistent());
    }

    #[tokio::test]
    async fn full_subscriber_is_pruned_and_told_to_close() {
        let registry = StreamRegistry::new(MemoryStorage::new());
        let (slow, _rx) = live_subscriber(&registry, 1, 1);

        assert_eq!(deliver(&registry, &message(0)).delivered, 1);
        assert_eq!(deliver(&registry, &message(1)).pruned, 1);

        assert!(!registry.is_registered(1));
        // Close signal is latched for the session
        slow.closed().await;
    }

    #[tokio::test]
    async fn late_message_releases_held_successors() {
        let registry = StreamRegistry::new(MemoryStorage::new());
        let (_a, mut rx) = live_subscriber(&registry, 1, 4);

        // 1 is persisted before 0 is delivered
        assert_eq!(deliver(&registry, &message(1)), DeliveryReport::default());
        assert!(rx.try_recv().is_err());

        assert_eq!(deliver(&registry, &message(0)).delivered, 1);
        assert!(rx.try_recv().unwrap().contains("\"nonce\":0"));
        assert!(rx.try_recv().unwrap().contains("\"nonce\":1"));

        // Already delivered
        assert_eq!(deliver(&registry, &message(1)), DeliveryReport::default());
    }
}
