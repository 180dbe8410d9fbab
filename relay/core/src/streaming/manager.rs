//! Stream Session Manager
//!
//! Opens stream sessions, each on its own task, and keeps a registry of the
//! live ones so they can be stopped by id or all at once on shutdown.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::Instrument;

use super::session::{
    SessionId, SessionShared, SessionState, StopHandle, StreamHandle, StreamSession,
};
use crate::config::duration_ms;
use crate::credentials::CredentialStore;
use crate::descriptor::{AuthEndpoints, RequestDescriptor};
use crate::http::HttpClient;
use crate::refresh::RefreshCoordinator;

/// Stream tuning
#[derive(Clone, Debug)]
pub struct StreamSettings {
    /// Idle timeout for descriptors that carry none
    pub default_idle_timeout: Duration,
    /// Capacity of each session's event channel
    pub channel_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            default_idle_timeout: Duration::from_secs(30),
            channel_capacity: 256,
        }
    }
}

/// Point-in-time view of a live session
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    /// Session id
    pub id: SessionId,
    /// Current state
    pub state: SessionState,
    /// Idle timeout in force
    pub idle_timeout: Duration,
    /// When the last chunk (or the open) happened
    pub last_activity_at: Instant,
}

/// Opens and tracks stream sessions
///
/// Cloning is cheap; clones share the registry.
#[derive(Clone)]
pub struct StreamSessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    store: Arc<dyn CredentialStore>,
    client: Arc<dyn HttpClient>,
    refresh: Arc<RefreshCoordinator>,
    endpoints: AuthEndpoints,
    settings: StreamSettings,
    sessions: DashMap<SessionId, Arc<SessionShared>>,
}

impl StreamSessionManager {
    /// Create a manager
    pub fn new(
        store: Arc<dyn CredentialStore>,
        client: Arc<dyn HttpClient>,
        refresh: Arc<RefreshCoordinator>,
        endpoints: AuthEndpoints,
        settings: StreamSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                client,
                refresh,
                endpoints,
                settings,
                sessions: DashMap::new(),
            }),
        }
    }

    /// Stream settings
    #[must_use]
    pub fn settings(&self) -> &StreamSettings {
        &self.inner.settings
    }

    /// Open a stream session
    ///
    /// Must be called from within a tokio runtime. The returned handle yields
    /// zero or more `data` events followed by exactly one terminal event.
    pub fn open(&self, descriptor: RequestDescriptor) -> StreamHandle {
        let id = SessionId::new();
        let idle_timeout = descriptor
            .idle_timeout
            .unwrap_or(self.inner.settings.default_idle_timeout);
        let shared = Arc::new(SessionShared::new(id, idle_timeout));
        let (tx, rx) = mpsc::channel(self.inner.settings.channel_capacity.max(1));

        let span = tracing::info_span!(
            "stream",
            session_id = %id,
            method = %descriptor.method,
            path = %descriptor.route()
        );
        span.in_scope(|| {
            tracing::info!(idle_timeout_ms = duration_ms(idle_timeout), "Opening stream");
        });

        let session = StreamSession::new(
            Arc::clone(&shared),
            descriptor,
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.client),
            Arc::clone(&self.inner.refresh),
            self.inner.endpoints.clone(),
            tx,
        );

        let stop = StopHandle {
            id,
            token: shared.abort.clone(),
        };
        self.inner.sessions.insert(id, shared);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(
            async move {
                session.run().await;
                inner.sessions.remove(&id);
            }
            .instrument(span),
        );

        StreamHandle { events: rx, stop }
    }

    /// Number of sessions that have not reached a terminal event yet
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// State of a live session
    #[must_use]
    pub fn state(&self, id: &SessionId) -> Option<SessionState> {
        self.inner.sessions.get(id).map(|s| s.state())
    }

    /// Snapshot of a live session
    #[must_use]
    pub fn session(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.inner.sessions.get(id).map(|s| SessionSnapshot {
            id: s.id,
            state: s.state(),
            idle_timeout: s.idle_timeout,
            last_activity_at: s.last_activity_at(),
        })
    }

    /// Stop one session; returns whether it was live
    pub fn stop(&self, id: &SessionId) -> bool {
        match self.inner.sessions.get(id) {
            Some(session) => {
                session.abort.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop every live session
    pub fn stop_all(&self) {
        let count = self.inner.sessions.len();
        for session in self.inner.sessions.iter() {
            session.abort.cancel();
        }
        if count > 0 {
            tracing::info!(count, "Stopped all streams");
        }
    }
}
