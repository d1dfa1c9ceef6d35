//! Seed fan-out server.
//!
//! Clients connect over WebSocket, subscribe to chats (streams identified by
//! a 32-byte key) and publish messages with a per-chat nonce. The server
//! persists each message exactly once, in nonce order, before acknowledging
//! it, then pushes it to every current subscriber of the chat.
//!
//! # Architecture
//!
//! ```text
//! Session ──subscribe──▶ StreamRegistry ──starts──▶ stream worker
//!    │                        ▲                        │
//!    └──publish (depth-1 queue)────────────────────────┤
//!                             │                     Storage
//!                             └──live subscribers── deliver
//! ```
//!
//! # Components
//!
//! - [`StreamRegistry`]: connection ↔ stream index and worker lifecycle
//! - [`worker`]: one sequential loop per active stream
//! - [`delivery`]: best-effort fan-out with dead-subscriber pruning
//! - [`Session`]: per-connection request dispatch
//! - [`Storage`]: persistence gateway ([`MemoryStorage`], [`RedbStorage`])
//! - [`WebSocketTransport`]: listener and handshake
//! - [`Server`]: runtime gluing the above together

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod connection;
pub mod delivery;
mod error;
mod registry;
mod session;
pub mod storage;
pub mod transport;
pub mod worker;

use std::{net::SocketAddr, sync::Arc};

pub use connection::{ConnectionHandle, ConnectionId};
pub use error::{RequestError, ServerError};
pub use registry::{Admission, Resume, StreamRegistry};
pub use session::{DEFAULT_CATCH_UP_PAGE, Session, SessionState};
pub use storage::{ChaoticStorage, MemoryStorage, RedbStorage, Storage, StorageError};
pub use transport::WebSocketTransport;
pub use worker::{ACK_TIMEOUT, Completion, PendingPublish, PublishOutcome, WORKER_QUEUE_DEPTH};

/// Default per-connection outbound queue capacity.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Server configuration for the production runtime.
///
/// Storage is chosen by the caller and passed to [`Server::bind`].
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:8080")
    pub bind_address: String,
    /// Path accepted for WebSocket upgrades
    pub ws_path: String,
    /// Frames a connection may have queued before it counts as dead
    pub outbound_capacity: usize,
    /// Messages per catch-up page; also the cap on history requests
    pub catch_up_page: usize,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            ws_path: "/ws".to_string(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            catch_up_page: DEFAULT_CATCH_UP_PAGE,
        }
    }
}

/// Production Seed server.
///
/// Generic over the persistence gateway so tests can run against
/// [`MemoryStorage`] or [`ChaoticStorage`].
pub struct Server<S: Storage> {
    transport: WebSocketTransport,
    registry: Arc<StreamRegistry<S>>,
    config: ServerRuntimeConfig,
}

impl<S: Storage> Server<S> {
    /// Create and bind a new server persisting through `storage`.
    pub async fn bind(config: ServerRuntimeConfig, storage: S) -> Result<Self, ServerError> {
        if config.outbound_capacity == 0 {
            return Err(ServerError::Config("outbound capacity must be at least 1".to_string()));
        }
        if config.catch_up_page == 0 {
            return Err(ServerError::Config("catch-up page must be at least 1".to_string()));
        }

        let transport = WebSocketTransport::bind(&config.bind_address, &config.ws_path).await?;
        let registry = StreamRegistry::new(storage);

        Ok(Self { transport, registry, config })
    }

    /// Run the server, accepting connections until the task is dropped.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Server starting on {}", self.transport.local_addr()?);

        let path = self.transport.path();

        loop {
            match self.transport.accept().await {
                Ok((stream, peer)) => {
                    let registry = Arc::clone(&self.registry);
                    let path = Arc::clone(&path);
                    let config = self.config.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, &path, registry, &config).await
                        {
                            tracing::debug!(%peer, "connection error: {}", e);
                        }
                    });
                },
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                },
            }
        }
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// Registry shared by all sessions.
    pub fn registry(&self) -> Arc<StreamRegistry<S>> {
        Arc::clone(&self.registry)
    }
}

/// Upgrade one TCP connection and run its session to completion.
async fn handle_connection<S: Storage>(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    path: &str,
    registry: Arc<StreamRegistry<S>>,
    config: &ServerRuntimeConfig,
) -> Result<(), ServerError> {
    let socket = transport::upgrade(stream, path).await?;
    let (handle, inbound) = transport::split(socket, config.outbound_capacity);

    tracing::debug!(connection = handle.id(), %peer, "connection accepted");

    Session::new(registry, handle).with_catch_up_page(config.catch_up_page).run(inbound).await;

    Ok(())
}
