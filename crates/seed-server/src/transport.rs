//! WebSocket transport over TCP.
//!
//! The listener accepts TCP connections; each one is upgraded with a
//! WebSocket handshake that is only accepted on the configured path (any
//! other path gets an HTTP 404). After the upgrade the socket is split:
//!
//! - a writer task drains the connection's bounded outbound queue into the
//!   sink and closes the socket once every handle to the queue is gone
//! - the read half becomes a stream of text frames for the session; binary
//!   frames are read as UTF-8 text, control frames are handled by the
//!   library, and a close frame or read error ends the stream

use std::{future, net::SocketAddr, sync::Arc};

use futures::{SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        Message,
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
    },
};

use crate::{connection::ConnectionHandle, error::ServerError};

/// TCP listener that upgrades connections to WebSocket on one path.
pub struct WebSocketTransport {
    listener: TcpListener,
    path: Arc<str>,
}

impl WebSocketTransport {
    /// Bind a listener. `path` is the only path accepted for upgrades.
    pub async fn bind(address: &str, path: &str) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address '{address}': {e}")))?;

        if !path.starts_with('/') {
            return Err(ServerError::Config(format!("websocket path must start with '/': {path}")));
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Transport(format!("failed to bind {addr}: {e}")))?;

        tracing::info!("WebSocket transport bound to {} on {}", listener.local_addr()?, path);

        Ok(Self { listener, path: Arc::from(path) })
    }

    /// Accept the next TCP connection. The handshake happens in
    /// [`upgrade`], off the accept loop.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ServerError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| ServerError::Transport(format!("accept failed: {e}")))?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, "failed to set TCP_NODELAY: {}", e);
        }

        Ok((stream, peer))
    }

    /// Path accepted for upgrades.
    pub fn path(&self) -> Arc<str> {
        Arc::clone(&self.path)
    }

    /// Local address the transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("failed to get local address: {e}")))
    }
}

/// Perform the WebSocket handshake, rejecting other paths with 404.
pub async fn upgrade(
    stream: TcpStream,
    path: &str,
) -> Result<WebSocketStream<TcpStream>, ServerError> {
    let check_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if request.uri().path() == path {
            return Ok(response);
        }

        let mut rejection = ErrorResponse::new(Some("not found".to_string()));
        *rejection.status_mut() = StatusCode::NOT_FOUND;
        Err(rejection)
    };

    tokio_tungstenite::accept_hdr_async(stream, check_path)
        .await
        .map_err(|e| ServerError::Transport(format!("websocket handshake failed: {e}")))
}

/// Split an upgraded socket into a connection handle (backed by a writer
/// task) and a stream of inbound text frames.
pub fn split(
    socket: WebSocketStream<TcpStream>,
    outbound_capacity: usize,
) -> (ConnectionHandle, impl Stream<Item = String> + Unpin + Send) {
    let (mut sink, stream) = socket.split();
    let (handle, mut outbound) = ConnectionHandle::channel(outbound_capacity);
    let id = handle.id();

    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = sink.send(Message::text(frame)).await {
                tracing::debug!(connection = id, "write failed: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
        tracing::trace!(connection = id, "writer finished");
    });

    let inbound = stream
        .take_while(move |frame| {
            future::ready(match frame {
                Ok(Message::Close(_)) => false,
                Ok(_) => true,
                Err(e) => {
                    tracing::debug!(connection = id, "read failed: {}", e);
                    false
                },
            })
        })
        .filter_map(|frame| future::ready(frame.ok().and_then(text_of)));

    (handle, inbound)
}

/// Text payload of a data frame. Control frames carry none.
///
/// A binary frame that is not valid UTF-8 comes through as an empty frame,
/// which the session answers as malformed.
fn text_of(message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text.as_str().to_owned()),
        Message::Binary(data) => {
            Some(std::str::from_utf8(&data).map_or_else(|_| String::new(), str::to_owned))
        },
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => None,
    }
}
