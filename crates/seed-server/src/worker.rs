//! Per-stream workers.
//!
//! One worker task runs for each stream that has subscribers. It owns a
//! bounded queue of depth one and processes publishes strictly in dequeue
//! order: persist, hand the result back to the publishing session, wait for
//! that session to queue its status, then fan out. Being the only consumer of
//! its stream's queue makes it the single writer for that key.
//!
//! A worker exits on [`WorkerCommand::Stop`] or when its queue is closed.
//! When the registry replaces a stopped worker before it has drained, the new
//! worker first waits for its predecessor so two workers never persist the
//! same stream concurrently.

use std::{sync::Arc, time::Duration};

use seed_proto::{Message, StreamKey};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};

use crate::{
    connection::ConnectionHandle,
    delivery,
    error::RequestError,
    registry::StreamRegistry,
    storage::{Storage, blocking},
};

/// Queue depth of a stream worker. A second publish while one is pending is
/// rejected rather than buffered.
pub const WORKER_QUEUE_DEPTH: usize = 1;

/// How long fan-out waits for a publisher to take its status before the
/// publisher is dropped as unresponsive.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// A publish waiting for its stream's worker.
#[derive(Debug)]
pub struct PendingPublish {
    /// Connection that sent the message.
    pub source: ConnectionHandle,
    /// Validated message.
    pub message: Message,
    /// Receives the outcome once the message is persisted or rejected.
    pub done: oneshot::Sender<Completion>,
}

/// Receiving half of [`PendingPublish::done`], held by the publishing session.
pub type PublishOutcome = oneshot::Receiver<Completion>;

/// Outcome of a publish, handed back to the session that sent it.
///
/// The session answers the request with [`result`](Self::result) and then
/// calls [`acknowledge`](Self::acknowledge). The worker holds fan-out until
/// then, so the publisher's status is queued ahead of its own event.
#[derive(Debug)]
pub struct Completion {
    result: Result<(), RequestError>,
    replied: oneshot::Sender<()>,
}

impl Completion {
    /// Whether the message was persisted, or why it was not.
    pub fn result(&self) -> &Result<(), RequestError> {
        &self.result
    }

    /// Release fan-out for this message.
    pub fn acknowledge(self) {
        // The worker waits on the channel resolving, sent or dropped
        drop(self.replied);
    }
}

/// Commands consumed by a worker loop.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Persist and deliver a message.
    Publish(PendingPublish),
    /// Exit the loop.
    Stop,
}

/// Registry-side handle to a running worker.
pub(crate) struct WorkerHandle {
    queue: mpsc::Sender<WorkerCommand>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn a worker for `key`.
    ///
    /// If `predecessor` is given, the worker waits for it before taking its
    /// first command.
    pub(crate) fn spawn<S: Storage>(
        registry: Arc<StreamRegistry<S>>,
        key: StreamKey,
        predecessor: Option<JoinHandle<()>>,
    ) -> Self {
        let (queue, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
        let task = tokio::spawn(run(registry, key, rx, predecessor));

        tracing::debug!(stream = %key, "stream worker started");
        Self { queue, task }
    }

    /// Offer a publish without waiting.
    pub(crate) fn try_publish(
        &self,
        pending: PendingPublish,
    ) -> Result<(), TrySendError<WorkerCommand>> {
        self.queue.try_send(WorkerCommand::Publish(pending))
    }

    /// Signal the worker to stop and give back its task handle.
    ///
    /// The stop command is best-effort: if the slot is occupied, dropping the
    /// sender closes the queue and the worker exits after the pending publish.
    pub(crate) fn stop(self) -> JoinHandle<()> {
        let _ = self.queue.try_send(WorkerCommand::Stop);
        self.task
    }
}

async fn run<S: Storage>(
    registry: Arc<StreamRegistry<S>>,
    key: StreamKey,
    mut queue: mpsc::Receiver<WorkerCommand>,
    predecessor: Option<JoinHandle<()>>,
) {
    if let Some(predecessor) = predecessor {
        if let Err(e) = predecessor.await {
            tracing::warn!(stream = %key, "previous stream worker failed: {}", e);
        }
    }

    while let Some(command) = queue.recv().await {
        match command {
            WorkerCommand::Publish(pending) => process(&registry, pending).await,
            WorkerCommand::Stop => break,
        }
    }

    tracing::debug!(stream = %key, "stream worker stopped");
}

async fn process<S: Storage>(registry: &StreamRegistry<S>, pending: PendingPublish) {
    let PendingPublish { source, message, done } = pending;
    let sequence = message.sequence;
    let stream = message.stream_key;

    let persisted = persist(registry.storage(), message).await;
    if let Err(err) = &persisted {
        log_rejection(source.id(), &stream, sequence, err);
    }

    let (replied, acknowledged) = oneshot::channel();
    let result = persisted.as_ref().map(|_| ()).map_err(Clone::clone);
    if done.send(Completion { result, replied }).is_err() {
        tracing::debug!(connection = source.id(), "publisher gone before completion");
    } else if persisted.is_ok() {
        await_acknowledgement(registry, &source, acknowledged).await;
    }

    let Ok(message) = persisted else { return };
    let report = delivery::deliver(registry, &message);
    tracing::debug!(
        %stream,
        sequence,
        delivered = report.delivered,
        pruned = report.pruned,
        "message published"
    );
}

/// Wait for the publishing session to queue its status.
///
/// A publisher that does not drain its queue within [`ACK_TIMEOUT`] is
/// dropped the same way a stalled subscriber is.
async fn await_acknowledgement<S: Storage>(
    registry: &StreamRegistry<S>,
    source: &ConnectionHandle,
    acknowledged: oneshot::Receiver<()>,
) {
    if tokio::time::timeout(ACK_TIMEOUT, acknowledged).await.is_err() {
        delivery::prune(registry, source, "publisher not taking its status");
    }
}

/// Persist a message on the blocking pool.
///
/// Returns the message back on success so callers can deliver it.
pub async fn persist<S: Storage>(storage: &S, message: Message) -> Result<Message, RequestError> {
    blocking(storage, move |storage| storage.insert(&message).map(|()| message))
        .await
        .map_err(RequestError::from)
}

/// Log a failed publish at a level matching its cause.
pub(crate) fn log_rejection(
    connection: u64,
    stream: &StreamKey,
    sequence: u64,
    err: &RequestError,
) {
    match err {
        RequestError::Storage(_) => {
            tracing::error!(connection, %stream, sequence, "publish failed: {}", err);
        },
        _ => tracing::debug!(connection, %stream, sequence, "publish rejected: {}", err),
    }
}
