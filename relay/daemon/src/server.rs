//! Daemon Server Implementation
//!
//! The accept loop of the relay daemon:
//! - Binds the Unix socket (owner-only, peer UID checked by the transport)
//! - Spawns one handler task per surface connection
//! - Feeds every inbound message to the shared [`Gateway`]
//! - Shuts down on a [`CancellationToken`], stopping every open stream
//!
//! ```text
//!                     DaemonServer
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!        popup       options page     content script
//!       (conn-1)       (conn-2)         (conn-3)
//!          │               │               │
//!          └───────────────┴───────────────┘
//!                          │
//!                       Gateway
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use relay_core::transport::{SurfaceConnection, TransportError, UnixSocketServer};
use relay_core::{ConnectionId, Gateway, RelayConfig};

/// Connection bookkeeping, separate from the transport's own tasks
struct ConnectionState {
    connected_at: Instant,
}

/// The daemon accept loop
pub struct DaemonServer {
    socket_path: PathBuf,
    max_connections: usize,
    gateway: Gateway,
    connections: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl DaemonServer {
    /// Create a server for the configured socket
    pub fn new(config: &RelayConfig, gateway: Gateway) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            max_connections: config.max_connections,
            gateway,
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Bind and serve until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener, shutdown).await
    }

    /// Bind the socket
    pub fn bind(&self) -> Result<UnixSocketServer> {
        let mut listener = UnixSocketServer::new(self.socket_path.clone());
        listener
            .listen()
            .with_context(|| format!("Failed to bind to {}", self.socket_path.display()))?;
        Ok(listener)
    }

    /// Accept surfaces on `listener` until `shutdown` is cancelled
    pub async fn serve(
        &self,
        mut listener: UnixSocketServer,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut handlers = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
                Some(_) = handlers.join_next(), if !handlers.is_empty() => continue,
                accepted = listener.accept() => accepted,
            };

            let conn = match accepted {
                Ok(conn) => conn,
                Err(TransportError::AuthenticationFailed(reason)) => {
                    warn!(%reason, "Rejected surface");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
            };

            if self.connections.len() >= self.max_connections {
                warn!(
                    conn_id = %conn.id,
                    max_connections = self.max_connections,
                    "Connection limit reached, rejecting new connection"
                );
                conn.abort();
                continue;
            }

            self.connections.insert(
                conn.id.clone(),
                ConnectionState {
                    connected_at: Instant::now(),
                },
            );
            info!(
                conn_id = %conn.id,
                active_connections = self.connections.len(),
                "New connection accepted"
            );

            let span = tracing::info_span!("connection", conn_id = %conn.id);
            handlers.spawn(
                handle_connection(
                    conn,
                    self.gateway.clone(),
                    Arc::clone(&self.connections),
                    shutdown.clone(),
                )
                .instrument(span),
            );
        }

        self.shutdown(listener, handlers).await
    }

    async fn shutdown(
        &self,
        mut listener: UnixSocketServer,
        mut handlers: JoinSet<()>,
    ) -> Result<()> {
        info!(
            active_connections = self.connection_count(),
            oldest_connection_secs = self.oldest_connection_age().map(|age| age.as_secs()),
            "Initiating graceful shutdown"
        );
        self.gateway.streams().stop_all();

        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Connection handler failed");
            }
        }

        listener
            .shutdown()
            .with_context(|| format!("Failed to remove socket: {}", self.socket_path.display()))?;
        info!("Shutdown complete");
        Ok(())
    }

    /// Number of connected surfaces
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Age of the oldest connection, if any
    pub fn oldest_connection_age(&self) -> Option<std::time::Duration> {
        self.connections
            .iter()
            .map(|c| c.connected_at.elapsed())
            .max()
    }
}

/// Pump one surface's messages into the gateway until it disconnects
async fn handle_connection(
    mut conn: SurfaceConnection,
    gateway: Gateway,
    connections: Arc<DashMap<ConnectionId, ConnectionState>>,
    shutdown: CancellationToken,
) {
    debug!("Connection handler started");

    loop {
        let msg = tokio::select! {
            () = shutdown.cancelled() => break,
            msg = conn.inbound.recv() => msg,
        };
        let Some(msg) = msg else {
            info!("Surface disconnected");
            break;
        };
        gateway.dispatch(&conn.id, msg, &conn.outbound).await;
    }

    // Streams still bound to this surface end with `stopped`; the writer
    // drains them before the socket closes.
    gateway.disconnect(&conn.id);
    let connected_for = connections
        .remove(&conn.id)
        .map(|(_, state)| state.connected_at.elapsed());

    info!(
        active_connections = connections.len(),
        connected_ms = connected_for.map(relay_core::config::duration_ms),
        "Connection handler finished"
    );
}
