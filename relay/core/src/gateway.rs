//! Message Gateway
//!
//! Routes surface messages to the executor and the stream session manager,
//! and routes results back to the surface that asked.
//!
//! # Routing
//!
//! ```text
//!  request{id}        ──► RequestExecutor::execute ──► reply{id}         (same connection)
//!  open_stream{ch}    ──► StreamSessionManager::open ─► stream{ch, …}    (same connection)
//!  stop_stream{ch}    ──► routes[(conn, ch)].stop()
//!  set/clear/status   ──► CredentialStore           ──► reply{id}
//! ```
//!
//! The only state kept here is the routing table from
//! `(connection, channel)` to the live session on that channel. A reopened
//! channel forwards nothing until the replaced session's terminal event has
//! been sent, so a surface always sees the old `done` before the new data.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, RelayConfig};
use crate::credentials::{
    CredentialStore, FileCredentialStore, MemoryCredentialStore, StoreError,
};
use crate::executor::RequestExecutor;
use crate::http::{HttpClient, HttpError, ReqwestClient};
use crate::messages::{
    AuthStatus, FailureKind, GatewayMessage, Reply, RequestPayload, StreamErrorKind, StreamEvent,
    StreamPayload, SurfaceMessage,
};
use crate::refresh::RefreshCoordinator;
use crate::streaming::{StopHandle, StreamSessionManager};
use crate::transport::ConnectionId;

/// A live session bound to a channel
#[derive(Clone, Debug)]
struct Route {
    stop: StopHandle,
    /// Cancelled once the forwarder has sent its last event
    forwarded: CancellationToken,
}

/// Identity of a stream channel: the surface connection plus its channel name
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    /// Connection the channel belongs to
    pub connection: ConnectionId,
    /// Surface-chosen channel name
    pub channel: String,
}

impl ChannelKey {
    /// Create a key
    pub fn new(connection: ConnectionId, channel: impl Into<String>) -> Self {
        Self {
            connection,
            channel: channel.into(),
        }
    }
}

/// Errors building a gateway from configuration
#[derive(Debug, Error)]
pub enum SetupError {
    /// The configuration is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The HTTP client could not be created
    #[error("failed to create HTTP client: {0}")]
    Http(#[from] HttpError),

    /// The credential file could not be opened
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Routes surface messages; cheap to clone
#[derive(Clone)]
pub struct Gateway {
    store: Arc<dyn CredentialStore>,
    executor: Arc<RequestExecutor>,
    streams: StreamSessionManager,
    refresh: Arc<RefreshCoordinator>,
    routes: Arc<DashMap<ChannelKey, Route>>,
}

impl Gateway {
    /// Wire every component around one credential store and HTTP client
    pub fn new(
        store: Arc<dyn CredentialStore>,
        client: Arc<dyn HttpClient>,
        config: &RelayConfig,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        let endpoints = config.auth_endpoints()?;

        let refresh = Arc::new(RefreshCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&client),
            endpoints.clone(),
        ));
        let executor = Arc::new(RequestExecutor::new(
            Arc::clone(&store),
            Arc::clone(&client),
            Arc::clone(&refresh),
            endpoints.clone(),
        ));
        let streams = StreamSessionManager::new(
            Arc::clone(&store),
            client,
            Arc::clone(&refresh),
            endpoints,
            config.stream_settings(),
        );

        Ok(Self {
            store,
            executor,
            streams,
            refresh,
            routes: Arc::new(DashMap::new()),
        })
    }

    /// Build the production gateway: reqwest client plus the configured store
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] for invalid configuration, a client that cannot
    /// be built, or an unreadable credential file.
    pub fn from_config(config: &RelayConfig) -> Result<Self, SetupError> {
        config.validate()?;
        let client = ReqwestClient::new(
            config.base_url.clone(),
            config.request_timeout,
            &config.user_agent,
        )?;
        let store: Arc<dyn CredentialStore> = match &config.credentials_path {
            Some(path) => Arc::new(FileCredentialStore::open(path)?),
            None => Arc::new(MemoryCredentialStore::new()),
        };

        tracing::info!(
            base_url = %config.base_url,
            persistent_credentials = config.credentials_path.is_some(),
            "Gateway ready"
        );
        Self::new(store, Arc::new(client), config)
    }

    /// The stream session manager
    #[must_use]
    pub fn streams(&self) -> &StreamSessionManager {
        &self.streams
    }

    /// The refresh coordinator
    #[must_use]
    pub fn refresh(&self) -> &RefreshCoordinator {
        &self.refresh
    }

    /// Number of channels with a live stream
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Handle one surface message
    ///
    /// Replies and stream events are sent on `outbound`. Requests run on
    /// their own task so a slow request never holds up the connection.
    pub async fn dispatch(
        &self,
        connection: &ConnectionId,
        msg: SurfaceMessage,
        outbound: &mpsc::Sender<GatewayMessage>,
    ) {
        match msg {
            SurfaceMessage::Request { id, payload } => {
                tracing::debug!(conn_id = %connection, id, path = %payload.path, "Request");
                let gateway = self.clone();
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let reply = gateway.handle_request(payload).await;
                    let _ = outbound.send(GatewayMessage::Reply { id, reply }).await;
                });
            }
            SurfaceMessage::OpenStream { channel, payload } => {
                let key = ChannelKey::new(connection.clone(), channel);
                self.open_stream(key, payload, outbound.clone()).await;
            }
            SurfaceMessage::StopStream { channel } => {
                self.stop(&ChannelKey::new(connection.clone(), channel));
            }
            SurfaceMessage::SetCredentials { id, credentials } => {
                let reply = match self.store.set(credentials) {
                    Ok(()) => {
                        tracing::info!(conn_id = %connection, "Credentials replaced");
                        self.auth_status_reply()
                    }
                    Err(e) => Reply::failure(FailureKind::Storage, None, e.to_string()),
                };
                let _ = outbound.send(GatewayMessage::Reply { id, reply }).await;
            }
            SurfaceMessage::ClearCredentials { id } => {
                let reply = match self.store.clear() {
                    Ok(()) => {
                        tracing::info!(conn_id = %connection, "Credentials cleared");
                        self.auth_status_reply()
                    }
                    Err(e) => Reply::failure(FailureKind::Storage, None, e.to_string()),
                };
                let _ = outbound.send(GatewayMessage::Reply { id, reply }).await;
            }
            SurfaceMessage::AuthStatus { id } => {
                let reply = self.auth_status_reply();
                let _ = outbound.send(GatewayMessage::Reply { id, reply }).await;
            }
        }
    }

    /// Execute a one-shot request
    pub async fn handle_request(&self, payload: RequestPayload) -> Reply {
        match payload.into_descriptor() {
            Ok(descriptor) => self.executor.execute(&descriptor).await,
            Err(e) => Reply::failure(FailureKind::InvalidRequest, None, e.to_string()),
        }
    }

    /// Open a stream on `key`, forwarding its events to `outbound`
    ///
    /// A live stream already bound to `key` is stopped first.
    pub async fn open_stream(
        &self,
        key: ChannelKey,
        payload: StreamPayload,
        outbound: mpsc::Sender<GatewayMessage>,
    ) {
        let descriptor = match payload.into_descriptor() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                let event = StreamEvent::error(StreamErrorKind::InvalidRequest, e.to_string());
                let _ = outbound
                    .send(GatewayMessage::Stream {
                        channel: key.channel,
                        event,
                    })
                    .await;
                return;
            }
        };

        let handle = self.streams.open(descriptor);
        let session_id = handle.id();
        let (mut events, stop) = handle.into_parts();

        let forwarded = CancellationToken::new();
        let route = Route {
            stop: stop.clone(),
            forwarded: forwarded.clone(),
        };
        let previous = self.routes.insert(key.clone(), route);
        if let Some(previous) = &previous {
            tracing::debug!(
                conn_id = %key.connection,
                channel = %key.channel,
                replaced = %previous.stop.id(),
                "Channel reopened, stopping previous stream"
            );
            previous.stop.stop();
        }
        tracing::debug!(conn_id = %key.connection, channel = %key.channel, %session_id, "Stream bound");

        let routes = Arc::clone(&self.routes);
        tokio::spawn(async move {
            let _forwarded = forwarded.drop_guard();
            if let Some(previous) = previous {
                previous.forwarded.cancelled().await;
            }

            while let Some(event) = events.recv().await {
                let terminal = event.is_terminal();
                let msg = GatewayMessage::Stream {
                    channel: key.channel.clone(),
                    event,
                };
                if outbound.send(msg).await.is_err() {
                    stop.stop();
                    break;
                }
                if terminal {
                    break;
                }
            }
            routes.remove_if(&key, |_, bound| bound.stop.id() == session_id);
        });
    }

    /// Stop the stream bound to `key`; unknown keys are ignored
    pub fn stop(&self, key: &ChannelKey) -> bool {
        match self.routes.get(key) {
            Some(bound) => {
                tracing::debug!(conn_id = %key.connection, channel = %key.channel, "Stop requested");
                bound.stop.stop();
                true
            }
            None => {
                tracing::debug!(conn_id = %key.connection, channel = %key.channel, "Stop for unknown channel");
                false
            }
        }
    }

    /// Stop every stream bound to `connection`
    pub fn disconnect(&self, connection: &ConnectionId) {
        let mut stopped = 0usize;
        for entry in self.routes.iter() {
            if &entry.key().connection == connection {
                entry.value().stop.stop();
                stopped += 1;
            }
        }
        if stopped > 0 {
            tracing::info!(conn_id = %connection, stopped, "Stopped streams of closed connection");
        }
    }

    fn auth_status_reply(&self) -> Reply {
        let status = AuthStatus::of(self.store.get().as_ref());
        match serde_json::to_value(status) {
            Ok(data) => Reply::success(None, data),
            Err(e) => Reply::failure(FailureKind::InvalidRequest, None, e.to_string()),
        }
    }
}
