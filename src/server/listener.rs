//! Live-view server listener
//!
//! Handles the TCP accept loop and one task per viewer. A viewer picks its
//! channel with the last segment of the upgrade request path
//! (`ws://host:8082/front` watches `front`); unknown channels are refused
//! with 404 before the upgrade completes.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Error, Result};
use crate::registry::SubscriberRegistry;
use crate::server::config::ServerConfig;

/// How long open connections get to close before they are aborted
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Live-view WebSocket server
pub struct LiveViewServer {
    config: ServerConfig,
    listener: TcpListener,
    registry: Arc<SubscriberRegistry>,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl LiveViewServer {
    /// Bind the listening socket. Viewers subscribe through `registry`.
    pub async fn bind(config: ServerConfig, registry: Arc<SubscriberRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        tracing::info!(addr = %listener.local_addr()?, "Live-view server listening");

        Ok(Self {
            config,
            listener,
            registry,
            connection_semaphore,
        })
    }

    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the server on its own task
    pub fn spawn(self) -> Result<ServerHandle> {
        let local_addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.run_until(async move {
            // A dropped handle also stops the server
            let _ = shutdown_rx.await;
        }));

        Ok(ServerHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }

    /// Run the server with graceful shutdown
    ///
    /// When `shutdown` completes the listener is closed, every viewer is sent
    /// a close frame, and the call returns once all connection tasks ended.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (close_tx, close_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        self.handle_connection(socket, peer_addr, &mut connections, &close_rx);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(self.listener);
        let _ = close_tx.send(true);

        let open = connections.len();
        let drained = tokio::time::timeout(CLOSE_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(open = connections.len(), "Aborting connections that did not close");
            connections.shutdown().await;
        }

        tracing::info!(closed = open, "Live-view server stopped");
        Ok(())
    }

    fn handle_connection(
        &self,
        socket: TcpStream,
        peer_addr: SocketAddr,
        connections: &mut JoinSet<()>,
        close_rx: &watch::Receiver<bool>,
    ) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        let registry = Arc::clone(&self.registry);
        let close_rx = close_rx.clone();

        connections.spawn(async move {
            let _permit = permit;
            if let Err(e) = serve_viewer(socket, peer_addr, registry, close_rx).await {
                tracing::debug!(peer = %peer_addr, error = %e, "Connection error");
            }
            tracing::debug!(peer = %peer_addr, "Connection closed");
        });
    }
}

/// Handle on a spawned server
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close all connections, stop accepting and wait for the server task
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.task.await.map_err(|e| Error::Io(io::Error::other(e)))?
    }
}

/// Channel named by the last segment of a request path
pub fn channel_from_path(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

async fn serve_viewer(
    socket: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<SubscriberRegistry>,
    mut close_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut requested = None;
    let ws = tokio_tungstenite::accept_hdr_async(socket, |request: &Request, response: Response| {
        let channel = channel_from_path(request.uri().path());
        if !registry.contains(channel) {
            tracing::debug!(peer = %peer_addr, channel = %channel, "Refusing unknown channel");
            let mut refusal = ErrorResponse::new(Some(format!("unknown channel: {}", channel)));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            return Err(refusal);
        }
        requested = Some(channel.to_string());
        Ok(response)
    })
    .await?;

    let Some(channel) = requested else {
        return Ok(());
    };
    if *close_rx.borrow() {
        return Ok(());
    }

    let mut subscription = registry.subscribe(&channel).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let result = loop {
        tokio::select! {
            chunk = subscription.rx.recv() => match chunk {
                Some(chunk) => {
                    if let Err(e) = ws_tx.send(Message::Binary(chunk)).await {
                        break Err(e.into());
                    }
                }
                None => {
                    // Dropped by the registry as too slow
                    let _ = ws_tx.send(close_message(CloseCode::Again, "viewer too slow")).await;
                    break Ok(());
                }
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e.into()),
            },
            _ = close_rx.changed() => {
                let _ = ws_tx.send(close_message(CloseCode::Away, "server shutting down")).await;
                break Ok(());
            }
        }
    };

    registry.unsubscribe(&channel, subscription.id).await;
    result
}

fn close_message(code: CloseCode, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}
