//! Connection session: per-connection request loop.
//!
//! A session owns one connection's inbound frames and handles them strictly
//! one at a time:
//!
//! ```text
//! Open ──register──▶ Idle ◀──────▶ Processing
//!   │                  │
//!   └──────────────────┴──read end / close signal──▶ Closed
//! ```
//!
//! Every request gets a reply on the connection's own outbound queue. No
//! request failure ends the session; only the end of the inbound stream, the
//! close signal raised when delivery prunes the connection, or losing the
//! outbound queue does. On the way out the connection is disconnected from
//! the registry.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use seed_proto::{
    HistoryRequest, Message, Request, SendRequest, ServerMessage, StreamKey, SubscribeRequest,
    UnsubscribeRequest,
};

use crate::{
    connection::ConnectionHandle,
    delivery,
    error::RequestError,
    registry::{Admission, Resume, StreamRegistry},
    storage::{Storage, blocking},
    worker::{self, persist},
};

/// Default catch-up page size, also the cap on history requests.
pub const DEFAULT_CATCH_UP_PAGE: usize = 100;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet registered.
    Open,
    /// Waiting for the next request.
    Idle,
    /// Handling a request.
    Processing,
    /// Terminal; the connection has been disconnected.
    Closed,
}

/// Per-connection request loop.
pub struct Session<S: Storage> {
    registry: Arc<StreamRegistry<S>>,
    handle: ConnectionHandle,
    state: SessionState,
    catch_up_page: usize,
}

impl<S: Storage> Session<S> {
    /// Create a session for a connection. Call [`open`](Self::open) or
    /// [`run`](Self::run) to register it.
    pub fn new(registry: Arc<StreamRegistry<S>>, handle: ConnectionHandle) -> Self {
        Self { registry, handle, state: SessionState::Open, catch_up_page: DEFAULT_CATCH_UP_PAGE }
    }

    /// Set the catch-up page size (minimum 1).
    pub fn with_catch_up_page(mut self, page: usize) -> Self {
        self.catch_up_page = page.max(1);
        self
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// This session's connection handle.
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Register the connection with the registry: `Open → Idle`.
    ///
    /// A duplicate connection id moves straight to `Closed`.
    pub fn open(&mut self) -> bool {
        if self.state != SessionState::Open {
            return self.state == SessionState::Idle;
        }

        if self.registry.register(self.handle.clone()) {
            self.state = SessionState::Idle;
            tracing::debug!(connection = self.handle.id(), "session opened");
            true
        } else {
            tracing::warn!(connection = self.handle.id(), "duplicate connection id");
            self.state = SessionState::Closed;
            false
        }
    }

    /// Drive the session until the inbound stream ends or the connection is
    /// told to close, then disconnect.
    pub async fn run<R>(mut self, mut inbound: R)
    where
        R: Stream<Item = String> + Unpin + Send,
    {
        if !self.open() {
            return;
        }

        loop {
            let frame = tokio::select! {
                frame = inbound.next() => frame,
                () = self.handle.closed() => {
                    tracing::debug!(connection = self.handle.id(), "session closed by server");
                    None
                },
            };

            let Some(frame) = frame else { break };

            if !self.handle_frame(&frame).await {
                tracing::debug!(connection = self.handle.id(), "outbound queue gone");
                break;
            }
        }

        self.close();
    }

    /// Handle one inbound frame: `Idle → Processing → Idle`.
    ///
    /// Returns `false` if the connection can no longer be written to.
    pub async fn handle_frame(&mut self, frame: &str) -> bool {
        if self.state != SessionState::Idle {
            return false;
        }
        self.state = SessionState::Processing;

        let alive = match Request::decode(frame) {
            Ok(request) => {
                tracing::trace!(connection = self.handle.id(), kind = request.kind(), "request");
                self.dispatch(request).await
            },
            Err(e) => {
                tracing::debug!(connection = self.handle.id(), "malformed request: {}", e);
                self.status(false).await
            },
        };

        if self.state == SessionState::Processing {
            self.state = SessionState::Idle;
        }
        alive
    }

    /// Disconnect from the registry: any state `→ Closed`. Idempotent.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;

        if self.registry.disconnect(self.handle.id()).is_some() {
            tracing::debug!(connection = self.handle.id(), "session closed");
        }
    }

    async fn dispatch(&mut self, request: Request) -> bool {
        match request {
            Request::Ping => self.status(true).await,
            Request::Send(send) => self.handle_send(send).await,
            Request::Subscribe(subscribe) => self.handle_subscribe(subscribe).await,
            Request::Unsubscribe(unsubscribe) => self.handle_unsubscribe(&unsubscribe).await,
            Request::History(history) => self.handle_history(&history).await,
        }
    }

    async fn handle_send(&mut self, send: SendRequest) -> bool {
        let message = match Message::try_from(send.message) {
            Ok(message) => message,
            Err(e) => return self.reject(&RequestError::from(e)).await,
        };

        let stream = message.stream_key;
        let sequence = message.sequence;

        match self.registry.publish(&self.handle, message) {
            Admission::Queued(outcome) => match outcome.await {
                Ok(completion) => {
                    let alive = self.status(completion.result().is_ok()).await;
                    completion.acknowledge();
                    alive
                },
                Err(_) => {
                    tracing::warn!(
                        connection = self.handle.id(),
                        %stream,
                        sequence,
                        "stream worker dropped a publish"
                    );
                    self.status(false).await
                },
            },
            Admission::Busy => {
                worker::log_rejection(self.handle.id(), &stream, sequence, &RequestError::QueueFull);
                self.status(false).await
            },
            Admission::Unrouted(message) => {
                match persist(self.registry.storage(), message).await {
                    Ok(message) => {
                        // A subscriber may have arrived while the insert ran
                        let report = delivery::deliver(&self.registry, &message);
                        tracing::debug!(
                            %stream,
                            sequence,
                            delivered = report.delivered,
                            "persisted outside a worker"
                        );
                        self.status(true).await
                    },
                    Err(err) => {
                        worker::log_rejection(self.handle.id(), &stream, sequence, &err);
                        self.status(false).await
                    },
                }
            },
        }
    }

    async fn handle_subscribe(&mut self, subscribe: SubscribeRequest) -> bool {
        let key = match subscribe.stream_key() {
            Ok(key) => key,
            Err(e) => return self.reject(&RequestError::from(e)).await,
        };

        if !self.registry.subscribe(self.handle.id(), key) {
            return self.reject(&RequestError::NotRegistered).await;
        }

        if !self.status(true).await {
            return false;
        }

        let Some(resume) = self.catch_up(key, subscribe.nonce).await else {
            return false;
        };

        self.registry.finish_catch_up(&self.handle, &key, resume, &ServerMessage::wait(&key))
    }

    /// Replay persisted messages from `from` page by page.
    ///
    /// Returns where live delivery resumes, or `None` if the connection
    /// stopped accepting frames. A storage failure ends the replay early; the
    /// subscription stays and goes live from wherever the replay got to.
    async fn catch_up(&self, key: StreamKey, from: u64) -> Option<Resume> {
        // Live delivery covers everything persisted after this read
        let stored = match blocking(self.registry.storage(), move |s| s.last_sequence(&key)).await
        {
            Ok(last) => last.map_or(0, |last| last.saturating_add(1)),
            Err(e) => {
                self.log_catch_up_failure(&key, &RequestError::from(e));
                return Some(Resume::Partial(from));
            },
        };

        let mut next = from;
        loop {
            let page_size = self.catch_up_page;
            let page = match blocking(self.registry.storage(), move |s| {
                s.fetch_range(&key, next, page_size)
            })
            .await
            {
                Ok(page) => page,
                Err(e) => {
                    self.log_catch_up_failure(&key, &RequestError::from(e));
                    return Some(Resume::Partial(next));
                },
            };

            for message in &page {
                if !self.handle.reply(&ServerMessage::new_message(message)).await {
                    return None;
                }
                next = message.sequence.saturating_add(1);
            }

            if page.len() < page_size {
                // Nothing replayed: resume no later than the end of the log
                let next = if next == from { next.min(stored) } else { next };
                return Some(Resume::Exact(next));
            }
        }
    }

    fn log_catch_up_failure(&self, key: &StreamKey, err: &RequestError) {
        tracing::error!(connection = self.handle.id(), stream = %key, "catch-up failed: {}", err);
    }

    async fn handle_unsubscribe(&mut self, unsubscribe: &UnsubscribeRequest) -> bool {
        let key = match unsubscribe.stream_key() {
            Ok(key) => key,
            Err(e) => return self.reject(&RequestError::from(e)).await,
        };

        self.registry.unsubscribe(self.handle.id(), &key);
        self.status(true).await
    }

    async fn handle_history(&mut self, history: &HistoryRequest) -> bool {
        let key = match history.stream_key() {
            Ok(key) => key,
            Err(e) => return self.reject(&RequestError::from(e)).await,
        };

        let amount = history.amount.min(self.catch_up_page);
        let up_to = history.nonce;

        match blocking(self.registry.storage(), move |s| s.fetch_history(&key, up_to, amount)).await
        {
            Ok(messages) => self.handle.reply(&ServerMessage::history(&messages)).await,
            Err(e) => self.reject(&RequestError::from(e)).await,
        }
    }

    async fn reject(&self, err: &RequestError) -> bool {
        match err {
            RequestError::Storage(_) => {
                tracing::error!(connection = self.handle.id(), "request failed: {}", err);
            },
            _ => tracing::debug!(connection = self.handle.id(), "request rejected: {}", err),
        }
        self.status(false).await
    }

    async fn status(&self, ok: bool) -> bool {
        self.handle.reply(&ServerMessage::status(ok)).await
    }
}
