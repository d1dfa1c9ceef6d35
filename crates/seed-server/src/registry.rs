//! Stream registry: connection/stream subscriptions and worker lifecycle.
//!
//! The registry maintains bidirectional mappings: stream → connections (for
//! delivery) and connection → streams (for cleanup on disconnect). Both live
//! in one [`RegistryState`] behind a single mutex and are updated inside the
//! same critical section, so no reader ever sees a half-updated mirror.
//!
//! The registry also owns the per-stream worker table. A worker is started
//! when a stream's connection set goes from empty to non-empty and stopped
//! when it goes back to empty. Publishes are admitted to a worker under the
//! same lock, which is what guarantees nothing is enqueued after a stop.
//!
//! The mutex is a `std::sync::Mutex`: every operation here is synchronous and
//! the lock is never held across an `.await`.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use seed_proto::{Message, ServerMessage, StreamKey};
use tokio::{
    sync::{mpsc::error::TrySendError, oneshot},
    task::JoinHandle,
};

use crate::{
    connection::{ConnectionHandle, ConnectionId},
    storage::Storage,
    worker::{PendingPublish, PublishOutcome, WorkerCommand, WorkerHandle},
};

/// Outcome of offering a publish to a stream's worker.
#[derive(Debug)]
pub enum Admission {
    /// The worker accepted the publish. Its completion arrives on the
    /// receiver; the caller answers the request from it.
    Queued(PublishOutcome),
    /// The worker's single slot is occupied. The publish is rejected.
    Busy,
    /// No live worker for the stream. The caller persists and delivers
    /// directly.
    Unrouted(Message),
}

/// Where live delivery picks up once catch-up has ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Catch-up replayed everything before this sequence. Live messages are
    /// forwarded strictly in sequence from here, holding any that arrive
    /// ahead of a gap.
    Exact(u64),
    /// Catch-up was cut short after replaying everything before this
    /// sequence. Later messages are forwarded as they arrive.
    Partial(u64),
}

/// Delivery phase of one subscription.
#[derive(Debug)]
enum Phase {
    /// Catch-up is running; live messages are parked here until the session
    /// hands over.
    CatchingUp(Vec<Message>),
    /// Live messages go to the connection through the cursor.
    Live(LiveCursor),
}

/// Per-subscription position in the stream.
///
/// A publish persisted outside a worker can reach fan-out after its
/// successor. The cursor holds messages that arrive ahead of a gap and drops
/// any it has already passed.
#[derive(Debug)]
struct LiveCursor {
    next: u64,
    strict: bool,
    held: BTreeMap<u64, Message>,
}

impl LiveCursor {
    fn new(resume: Resume) -> Self {
        let (next, strict) = match resume {
            Resume::Exact(next) => (next, true),
            Resume::Partial(next) => (next, false),
        };
        Self { next, strict, held: BTreeMap::new() }
    }

    /// Take a persisted message and return what can be forwarded now, in
    /// sequence order.
    fn accept(&mut self, message: Message) -> Vec<Message> {
        if message.sequence < self.next {
            return Vec::new();
        }

        if !self.strict {
            self.next = message.sequence.saturating_add(1);
            return vec![message];
        }

        self.held.insert(message.sequence, message);
        let mut ready = Vec::new();
        while let Some(message) = self.held.remove(&self.next) {
            self.next = message.sequence.saturating_add(1);
            ready.push(message);
        }
        ready
    }
}

/// A subscriber and the events it should be sent, in order.
#[derive(Debug)]
pub(crate) struct DeliveryTarget {
    pub(crate) handle: ConnectionHandle,
    pub(crate) messages: Vec<Message>,
}

#[derive(Default)]
struct RegistryState {
    /// Connection ID → handle
    connections: HashMap<ConnectionId, ConnectionHandle>,
    /// Stream → subscribed connections and their delivery phase
    stream_connections: HashMap<StreamKey, HashMap<ConnectionId, Phase>>,
    /// Connection ID → subscribed streams
    connection_streams: HashMap<ConnectionId, HashSet<StreamKey>>,
    /// Stream → running worker
    workers: HashMap<StreamKey, WorkerHandle>,
    /// Stream → stopped worker that may still be finishing its last publish
    draining: HashMap<StreamKey, JoinHandle<()>>,
}

/// Registry of connections, subscriptions and stream workers.
///
/// Shared by sessions and workers as `Arc<StreamRegistry<S>>`.
pub struct StreamRegistry<S: Storage> {
    state: Mutex<RegistryState>,
    storage: S,
}

impl<S: Storage> StreamRegistry<S> {
    /// Create an empty registry persisting through `storage`.
    pub fn new(storage: S) -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(RegistryState::default()), storage })
    }

    /// Persistence gateway used by this registry's workers.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection.
    ///
    /// Returns `false` if a connection with the same id already exists.
    pub fn register(&self, handle: ConnectionHandle) -> bool {
        let mut state = self.lock();
        if state.connections.contains_key(&handle.id()) {
            return false;
        }

        state.connection_streams.insert(handle.id(), HashSet::new());
        state.connections.insert(handle.id(), handle);
        true
    }

    /// Subscribe a connection to a stream, starting the stream's worker if
    /// this is its first subscriber.
    ///
    /// The subscription starts in catch-up: messages persisted from now on
    /// are held back until [`finish_catch_up`](Self::finish_catch_up).
    /// Subscribing again restarts catch-up. Returns `false` if the connection
    /// is not registered.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(self: &Arc<Self>, id: ConnectionId, key: StreamKey) -> bool {
        let mut state = self.lock();
        if !state.connections.contains_key(&id) {
            return false;
        }

        state.connection_streams.entry(id).or_default().insert(key);
        let subscribers = state.stream_connections.entry(key).or_default();
        let first = subscribers.is_empty();
        subscribers.insert(id, Phase::CatchingUp(Vec::new()));

        if first {
            self.start_worker(&mut state, key);
        }

        debug_assert!(state.workers.contains_key(&key));
        true
    }

    /// End catch-up for a subscription and switch it to live delivery.
    ///
    /// Parked messages the replay did not cover are queued to the connection
    /// in sequence order, followed by `wait`. This happens under the lock, so
    /// no live message can overtake them.
    ///
    /// Returns `false` if the subscription no longer exists or the connection
    /// could not take the frames.
    pub fn finish_catch_up(
        &self,
        handle: &ConnectionHandle,
        key: &StreamKey,
        resume: Resume,
        wait: &ServerMessage,
    ) -> bool {
        let mut state = self.lock();
        let Some(phase) =
            state.stream_connections.get_mut(key).and_then(|subs| subs.get_mut(&handle.id()))
        else {
            return false;
        };

        let mut cursor = LiveCursor::new(resume);
        let mut parked = match std::mem::replace(phase, Phase::CatchingUp(Vec::new())) {
            Phase::CatchingUp(parked) => parked,
            Phase::Live(_) => Vec::new(),
        };
        parked.sort_by_key(|message| message.sequence);

        let ready: Vec<Message> =
            parked.into_iter().flat_map(|message| cursor.accept(message)).collect();
        *phase = Phase::Live(cursor);

        ready.iter().all(|message| handle.try_reply(&ServerMessage::new_message(message)))
            && handle.try_reply(wait)
    }

    /// Unsubscribe a connection from a stream, stopping the stream's worker
    /// if it was the last subscriber.
    ///
    /// Returns `true` if the connection was subscribed.
    pub fn unsubscribe(&self, id: ConnectionId, key: &StreamKey) -> bool {
        let mut state = self.lock();

        let removed = state.connection_streams.get_mut(&id).is_some_and(|s| s.remove(key));
        if removed {
            Self::detach(&mut state, id, key);
        }
        removed
    }

    /// Remove a connection and every subscription it holds.
    ///
    /// Idempotent: the second call returns `None`.
    pub fn disconnect(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let mut state = self.lock();

        let handle = state.connections.remove(&id)?;
        let streams = state.connection_streams.remove(&id).unwrap_or_default();

        for key in &streams {
            Self::detach(&mut state, id, key);
        }

        Some(handle)
    }

    /// Offer a publish to the stream's worker.
    ///
    /// Never waits: a full queue is [`Admission::Busy`]. A missing or
    /// stopped worker hands the message back as [`Admission::Unrouted`].
    pub fn publish(&self, source: &ConnectionHandle, message: Message) -> Admission {
        let state = self.lock();

        let Some(worker) = state.workers.get(&message.stream_key) else {
            return Admission::Unrouted(message);
        };

        let (done, outcome) = oneshot::channel();
        match worker.try_publish(PendingPublish { source: source.clone(), message, done }) {
            Ok(()) => Admission::Queued(outcome),
            Err(TrySendError::Full(_)) => Admission::Busy,
            Err(TrySendError::Closed(WorkerCommand::Publish(pending))) => {
                Admission::Unrouted(pending.message)
            },
            // Only publishes are offered here
            Err(TrySendError::Closed(WorkerCommand::Stop)) => Admission::Busy,
        }
    }

    /// Live subscribers that should be sent events now, and which ones.
    ///
    /// Subscribers still catching up get the message parked instead.
    pub(crate) fn delivery_targets(&self, message: &Message) -> Vec<DeliveryTarget> {
        let mut state = self.lock();
        let RegistryState { connections, stream_connections, .. } = &mut *state;

        let Some(subscribers) = stream_connections.get_mut(&message.stream_key) else {
            return Vec::new();
        };

        let mut targets = Vec::with_capacity(subscribers.len());
        for (id, phase) in subscribers.iter_mut() {
            match phase {
                Phase::Live(cursor) => {
                    let messages = cursor.accept(message.clone());
                    if messages.is_empty() {
                        continue;
                    }
                    if let Some(handle) = connections.get(id) {
                        targets.push(DeliveryTarget { handle: handle.clone(), messages });
                    }
                },
                Phase::CatchingUp(parked) => parked.push(message.clone()),
            }
        }
        targets
    }

    /// Check if a connection is subscribed to a stream.
    pub fn is_subscribed(&self, id: ConnectionId, key: &StreamKey) -> bool {
        self.lock().stream_connections.get(key).is_some_and(|s| s.contains_key(&id))
    }

    /// Check if a connection is registered.
    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.lock().connections.contains_key(&id)
    }

    /// IDs of all connections subscribed to a stream.
    pub fn subscribers(&self, key: &StreamKey) -> Vec<ConnectionId> {
        self.lock().stream_connections.get(key).map(|s| s.keys().copied().collect()).unwrap_or_default()
    }

    /// Number of connections subscribed to a stream.
    pub fn subscriber_count(&self, key: &StreamKey) -> usize {
        self.lock().stream_connections.get(key).map_or(0, HashMap::len)
    }

    /// All streams a connection is subscribed to.
    pub fn streams_for_connection(&self, id: ConnectionId) -> Vec<StreamKey> {
        self.lock().connection_streams.get(&id).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    /// Total number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Number of streams with a running worker.
    pub fn active_workers(&self) -> usize {
        self.lock().workers.len()
    }

    /// Whether a stream has a running worker.
    pub fn has_worker(&self, key: &StreamKey) -> bool {
        self.lock().workers.contains_key(key)
    }

    /// Check the structural invariants: the two indexes mirror each other,
    /// every subscribed connection is registered, and exactly the streams
    /// with subscribers have a worker.
    pub fn is_consistent(&self) -> bool {
        let state = self.lock();

        let forward = state.stream_connections.iter().all(|(key, subs)| {
            !subs.is_empty()
                && subs.keys().all(|id| {
                    state.connections.contains_key(id)
                        && state.connection_streams.get(id).is_some_and(|s| s.contains(key))
                })
        });

        let backward = state.connection_streams.iter().all(|(id, keys)| {
            keys.iter().all(|key| {
                state.stream_connections.get(key).is_some_and(|s| s.contains_key(id))
            })
        });

        let workers = state.workers.len() == state.stream_connections.len()
            && state.workers.keys().all(|key| state.stream_connections.contains_key(key));

        forward && backward && workers
    }

    /// Remove `id` from a stream's connection set, stopping the worker when
    /// the set empties. The caller has already updated `connection_streams`.
    fn detach(state: &mut RegistryState, id: ConnectionId, key: &StreamKey) {
        let emptied = state.stream_connections.get_mut(key).is_some_and(|subs| {
            subs.remove(&id);
            subs.is_empty()
        });

        if emptied {
            state.stream_connections.remove(key);
            Self::stop_worker(state, key);
        }
    }

    fn start_worker(self: &Arc<Self>, state: &mut RegistryState, key: StreamKey) {
        let predecessor = state.draining.remove(&key).filter(|task| !task.is_finished());
        if predecessor.is_some() {
            tracing::debug!(stream = %key, "new worker waits for draining predecessor");
        }

        let worker = WorkerHandle::spawn(Arc::clone(self), key, predecessor);
        state.workers.insert(key, worker);
    }

    fn stop_worker(state: &mut RegistryState, key: &StreamKey) {
        state.draining.retain(|_, task| !task.is_finished());

        if let Some(worker) = state.workers.remove(key) {
            state.draining.insert(*key, worker.stop());
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::storage::MemoryStorage;

    fn key(byte: u8) -> StreamKey {
        StreamKey::from_bytes([byte; 32])
    }

    fn message(stream: u8, sequence: u64) -> Message {
        Message {
            sequence,
            stream_key: key(stream),
            signature: [0u8; 32],
            content: Bytes::from_static(b"m"),
            content_iv: [0u8; 12],
        }
    }

    fn wait(stream: u8) -> ServerMessage {
        ServerMessage::wait(&key(stream))
    }

    fn connect(
        registry: &StreamRegistry<MemoryStorage>,
        id: ConnectionId,
    ) -> (ConnectionHandle, mpsc::Receiver<String>) {
        let (handle, rx) = ConnectionHandle::with_id(id, 16);
        assert!(registry.register(handle.clone()));
        (handle, rx)
    }

    #[tokio::test]
    async fn register_duplicate_fails() {
        let registry = StreamRegistry::new(MemoryStorage::new());
        let _conn = connect(&registry, 1);

        let (dup, _rx) = ConnectionHandle::with_id(1, 1);
        assert!(!registry.register(dup));
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn subscribe_requires_registration() {
        let registry = StreamRegistry::new(MemoryStorage::new());
        assert!(!registry.subscribe(7, key(1)));
        assert_eq!(registry.active_workers(), 0);
        assert!(registry.is_consistent());
    }

    #[tokio::test]
    async fn first_subscriber_starts_worker() {
        let registry = StreamRegistry::new(MemoryStorage::new());
        let _a = connect(&registry, 1);
        let _b = connect(&registry, 2);

        assert!(registry.subscribe(1, key(1)));
        assert!(registry.has_worker(&key(1)));
        assert!(registry.subscribe(2, key(1)));
        assert_eq!(registry.active_workers(), 1);
        assert_eq!(registry.subscriber_count(&key(1)), 2);
        assert!(registry.is_consistent());
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let registry = StreamRegistry::new(MemoryStorage::new());
        let _a = connect(&registry, 1);

        assert!(registry.subscribe(1, key(1)));
        assert!(registry.subscribe(1, key(1)));
        assert_eq!(registry.subscriber_count(&key(1)), 1);
        assert_eq!(registry.streams_for_connection(1), vec![key(1)]);
        assert!(registry.is_consistent());
    }

    #[tokio::test]
    async fn last_unsubscribe_stops_worker() {
        let registry = StreamRegistry::new(MemoryStorage::new());
        let _a = connect(&registry, 1);
        let _b = connect(&registry, 2);
        registry.subscribe(1, key(1));
        registry.subscribe(2, key(1));

        assert!(registry.unsubscribe(1, &key(1)));
        assert!(registry.has_worker(&key(1)));

        assert!(registry.unsubscribe(2, &key(1)));
        assert!(!registry.has_worker(&key(1)));
        assert_eq!(registry.subscriber_count(&key(1)), 0);
        assert!(!registry.unsubscribe(2, &key(1)));
        assert!(registry.is_consistent());
    }

    #[tokio::test]
    async fn disconnect_removes_all_subscriptions() {
        let registry = StreamRegistry::new(MemoryStorage::new());
        let _a = connect(&registry, 1);
        let _b = connect(&registry, 2);
        registry.subscribe(1, key(1));
        registry.subscribe(1, key(2));
        registry.subscribe(2, key(2));

        let handle = registry.disconnect(1).unwrap();
        assert_eq!(handle.id(), 1);

        assert!(!registry.is_registered(1));
        assert!(!registry.is_subscribed(1, &key(1)));
        assert!(!registry.is_subscribed(1, &key(2)));
        assert!(!registry.has_worker(&key(1)));
        assert!(registry.has_worker(&key(2)));
        assert_eq!(registry.subscribers(&key(2)), vec![2]);
        assert!(registry.is_consistent());

        // Second disconnect is a no-op
        assert!(registry.disconnect(1).is_none());
        assert!(!registry.subscribe(1, key(1)));
    }

    #[tokio::test]
    async fn publish_without_worker_is_unrouted() {
        let registry = StreamRegistry::new(MemoryStorage::new());
        let (source, _rx) = connect(&registry, 1);

        match registry.publish(&source, message(1, 0)) {
            Admission::Unrouted(message) => assert_eq!(message.sequence, 0),
            other => panic!("expected Unrouted, got {other:?}"),
        }
    }

    #[test]
    fn publish_to_busy_worker_is_rejected() {
        // Current-thread runtime that is never driven, so the worker never
        // drains its slot
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let _guard = rt.enter();

        let registry = StreamRegistry::new(MemoryStorage::new());
        let (source, _rx) = connect(&registry, 1);
        registry.subscribe(1, key(1));

        assert!(matches!(registry.publish(&source, message(1, 0)), Admission::Queued(_)));
        assert!(matches!(registry.publish(&source, message(1, 1)), Admission::Busy));
    }

    #[tokio::test]
    async fn catching_up_subscribers_get_messages_parked() {
        let registry = StreamRegistry::new(MemoryStorage::new());
        let (a, mut rx_a) = connect(&registry, 1);
        let (_b, _rx_b) = connect(&registry, 2);
        registry.subscribe(1, key(1));
        registry.subscribe(2, key(1));
        assert!(registry.finish_catch_up(&a, &key(1), Resume::Exact(0), &wait(1)));
        assert!(rx_a.try_recv().unwrap().contains("\"wait\""));

        // Only the live subscriber is a target
        let targets = registry.delivery_targets(&message(1, 0));
        assert_eq!(targets.iter().map(|t| t.handle.id()).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn finish_catch_up_flushes_parked_in_order() {
        let registry = StreamRegistry::new(MemoryStorage::new());
        let (a, mut rx) = connect(&registry, 1);
        registry.subscribe(1, key(1));

        // Parked out of order
        for sequence in [0, 3, 1, 2] {
            assert!(registry.delivery_targets(&message(1, sequence)).is_empty());
        }

        // Catch-up already sent 0 and 1
        assert!(registry.finish_catch_up(&a, &key(1), Resume::Exact(2), &wait(1)));

        let frames: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].contains("\"nonce\":2"));
        assert!(frames[1].contains("\"nonce\":3"));
        assert!(frames[2].contains("\"wait\""));

        assert_eq!(registry.delivery_targets(&message(1, 4)).len(), 1);
    }

    #[tokio::test]
    async fn finish_catch_up_after_disconnect_fails() {
        let registry = StreamRegistry::new(MemoryStorage::new());
        let (a, _rx) = connect(&registry, 1);
        registry.subscribe(1, key(1));
        registry.disconnect(1);

        assert!(!registry.finish_catch_up(&a, &key(1), Resume::Exact(0), &wait(1)));
    }

    #[tokio::test]
    async fn live_cursor_holds_messages_behind_a_gap() {
        let registry = StreamRegistry::new(MemoryStorage::new());
        let (a, mut rx) = connect(&registry, 1);
        registry.subscribe(1, key(1));
        assert!(registry.finish_catch_up(&a, &key(1), Resume::Exact(5), &wait(1)));
        rx.try_recv().unwrap();

        assert!(registry.delivery_targets(&message(1, 6)).is_empty());
        assert!(registry.delivery_targets(&message(1, 7)).is_empty());

        let targets = registry.delivery_targets(&message(1, 5));
        assert_eq!(targets.len(), 1);
        let released: Vec<u64> = targets[0].messages.iter().map(|m| m.sequence).collect();
        assert_eq!(released, vec![5, 6, 7]);

        // Replays and messages before the resume point are dropped
        assert!(registry.delivery_targets(&message(1, 6)).is_empty());
        assert!(registry.delivery_targets(&message(1, 2)).is_empty());
    }

    #[tokio::test]
    async fn partial_resume_forwards_without_holding() {
        let registry = StreamRegistry::new(MemoryStorage::new());
        let (a, mut rx) = connect(&registry, 1);
        registry.subscribe(1, key(1));
        assert!(registry.delivery_targets(&message(1, 1)).is_empty());
        assert!(registry.delivery_targets(&message(1, 4)).is_empty());

        assert!(registry.finish_catch_up(&a, &key(1), Resume::Partial(2), &wait(1)));
        assert!(rx.try_recv().unwrap().contains("\"nonce\":4"));
        assert!(rx.try_recv().unwrap().contains("\"wait\""));

        assert_eq!(registry.delivery_targets(&message(1, 9)).len(), 1);
        assert!(registry.delivery_targets(&message(1, 8)).is_empty());
    }

    #[tokio::test]
    async fn resubscribe_after_stop_replaces_worker() {
        let registry = StreamRegistry::new(MemoryStorage::new());
        let _a = connect(&registry, 1);

        registry.subscribe(1, key(1));
        registry.unsubscribe(1, &key(1));
        registry.subscribe(1, key(1));

        assert_eq!(registry.active_workers(), 1);
        assert!(registry.is_consistent());
    }
}
