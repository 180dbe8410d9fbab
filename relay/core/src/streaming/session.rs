//! Stream Session
//!
//! One streaming request from open to its single terminal event. Each session
//! runs on its own task and owns its connection, decoder and event sink.
//!
//! # Lifecycle
//!
//! ```text
//! Opening ──2xx──► Streaming ──[DONE] / EOF──► Completed
//!    │                 │
//!    │                 ├── error event / body failure ──► Errored
//!    │                 ├── idle timeout ────────────────► Aborted (error event)
//!    └─────────────────┴── stop / receiver dropped ─────► Aborted
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::sse::{self, SseError, SseEvent};
use crate::credentials::{CredentialSet, CredentialStore};
use crate::descriptor::{AuthEndpoints, RequestDescriptor};
use crate::executor::error_message;
use crate::http::{ByteStream, HttpClient, StreamResponse};
use crate::messages::{StreamErrorKind, StreamEvent};
use crate::refresh::RefreshCoordinator;

/// Unique identifier of a stream session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new session id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0.simple())
    }
}

/// Session lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for response headers
    Opening,
    /// Receiving chunks
    Streaming,
    /// Ended naturally
    Completed,
    /// Ended by a failure
    Errored,
    /// Ended by stop, idle timeout or a closed receiver
    Aborted,
}

impl SessionState {
    /// Whether the session has ended
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Aborted)
    }
}

/// State shared between a running session and the manager's registry
#[derive(Debug)]
pub(crate) struct SessionShared {
    pub(crate) id: SessionId,
    pub(crate) abort: CancellationToken,
    pub(crate) idle_timeout: Duration,
    state: Mutex<SessionState>,
    last_activity_at: Mutex<Instant>,
}

impl SessionShared {
    pub(crate) fn new(id: SessionId, idle_timeout: Duration) -> Self {
        Self {
            id,
            abort: CancellationToken::new(),
            idle_timeout,
            state: Mutex::new(SessionState::Opening),
            last_activity_at: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub(crate) fn last_activity_at(&self) -> Instant {
        *self.last_activity_at.lock()
    }

    /// Move to `next` unless a terminal state was already reached
    fn transition(&self, next: SessionState) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = next;
        }
    }

    fn touch(&self) {
        *self.last_activity_at.lock() = Instant::now();
    }
}

/// Delivers events to the caller's channel, at most one terminal
struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    terminated: bool,
    forwarded: u64,
}

/// The caller dropped its receiver
struct ReceiverGone;

impl EventSink {
    fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            terminated: false,
            forwarded: 0,
        }
    }

    async fn data(&mut self, payload: serde_json::Value) -> Result<(), ReceiverGone> {
        if self.terminated {
            return Ok(());
        }
        self.tx
            .send(StreamEvent::Data { payload })
            .await
            .map_err(|_| ReceiverGone)?;
        self.forwarded += 1;
        Ok(())
    }

    /// Send the terminal event; later calls are ignored
    async fn terminate(&mut self, event: StreamEvent) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        // A closed receiver has nobody left to tell.
        let _ = self.tx.send(event).await;
    }
}

/// How a session ended
#[derive(Debug, PartialEq)]
enum Outcome {
    Completed,
    Stopped,
    IdleTimeout,
    Failed(StreamErrorKind, String),
    ReceiverGone,
}

/// Result of pumping one accepted response
enum Pump {
    Finished(Outcome),
    /// 401 arrived as an error event before any data was forwarded
    Unauthorized(String),
}

enum Step {
    Continue,
    Finish(Pump),
}

/// Everything a session task needs
pub(crate) struct StreamSession {
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) descriptor: RequestDescriptor,
    pub(crate) store: Arc<dyn CredentialStore>,
    pub(crate) client: Arc<dyn HttpClient>,
    pub(crate) refresh: Arc<RefreshCoordinator>,
    pub(crate) endpoints: AuthEndpoints,
    sink: EventSink,
}

impl StreamSession {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        descriptor: RequestDescriptor,
        store: Arc<dyn CredentialStore>,
        client: Arc<dyn HttpClient>,
        refresh: Arc<RefreshCoordinator>,
        endpoints: AuthEndpoints,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Self {
        Self {
            shared,
            descriptor,
            store,
            client,
            refresh,
            endpoints,
            sink: EventSink::new(tx),
        }
    }

    /// Drive the session to its terminal event
    pub(crate) async fn run(mut self) -> SessionState {
        let outcome = self.drive().await;
        let idle_ms = self.shared.idle_timeout.as_millis();

        let (state, terminal) = match outcome {
            Outcome::Completed => (SessionState::Completed, Some(StreamEvent::done())),
            Outcome::Stopped => (SessionState::Aborted, Some(StreamEvent::stopped())),
            Outcome::IdleTimeout => (
                SessionState::Aborted,
                Some(StreamEvent::error(
                    StreamErrorKind::IdleTimeout,
                    format!("no data received for {idle_ms} ms"),
                )),
            ),
            Outcome::Failed(kind, reason) => {
                (SessionState::Errored, Some(StreamEvent::error(kind, reason)))
            }
            Outcome::ReceiverGone => (SessionState::Aborted, None),
        };

        match &terminal {
            Some(StreamEvent::Error { reason, kind }) => {
                tracing::warn!(?kind, %reason, forwarded = self.sink.forwarded, "Stream failed");
            }
            _ => tracing::info!(?state, forwarded = self.sink.forwarded, "Stream ended"),
        }

        if let Some(event) = terminal {
            self.sink.terminate(event).await;
        }
        self.shared.transition(state);
        state
    }

    async fn drive(&mut self) -> Outcome {
        let bootstrap = self.endpoints.is_bootstrap(&self.descriptor.path);
        let mut credentials = if bootstrap { None } else { self.store.get() };
        let mut retried = false;

        loop {
            let request = self.endpoints.prepare(&self.descriptor, credentials.as_ref());
            let token = self.shared.abort.clone();
            let idle = self.shared.idle_timeout;

            let opened = tokio::select! {
                biased;
                () = token.cancelled() => return Outcome::Stopped,
                opened = timeout(idle, self.client.open_stream(request)) => opened,
            };

            let unauthorized = match opened {
                Err(_) => return Outcome::IdleTimeout,
                Ok(Err(e)) => return Outcome::Failed(StreamErrorKind::Transport, e.to_string()),
                Ok(Ok(StreamResponse::Rejected(response))) => {
                    let data = serde_json::from_slice(&response.body).ok();
                    let message = error_message(&response, data.as_ref());
                    if response.status != StatusCode::UNAUTHORIZED.as_u16() {
                        return Outcome::Failed(StreamErrorKind::Http, message);
                    }
                    message
                }
                Ok(Ok(StreamResponse::Accepted { status, body })) => {
                    tracing::debug!(status, "Stream accepted");
                    self.shared.touch();
                    self.shared.transition(SessionState::Streaming);
                    match self.pump(body).await {
                        Pump::Finished(outcome) => return outcome,
                        Pump::Unauthorized(message) => message,
                    }
                }
            };

            if bootstrap || retried {
                return Outcome::Failed(StreamErrorKind::Authentication, unauthorized);
            }
            retried = true;

            tracing::info!("Stream rejected with 401 before data, refreshing credentials");
            let rejected = credentials.as_ref().map(|c| c.access_token.clone());
            let refreshed = tokio::select! {
                biased;
                () = token.cancelled() => return Outcome::Stopped,
                refreshed = self.refresh.refresh_rejected(rejected.as_deref()) => refreshed,
            };
            match refreshed {
                Ok(set) => credentials = Some(set),
                Err(e) => return Outcome::Failed(StreamErrorKind::Authentication, e.to_string()),
            }
        }
    }

    async fn pump(&mut self, body: ByteStream) -> Pump {
        let token = self.shared.abort.clone();
        let idle = self.shared.idle_timeout;

        // Every chunk counts as activity, even one that completes no event.
        let shared = Arc::clone(&self.shared);
        let mut events = sse::decode(body.inspect(move |_| shared.touch()).boxed());

        loop {
            let deadline = self.shared.last_activity_at() + idle;
            let waited = tokio::select! {
                biased;
                () = token.cancelled() => return Pump::Finished(Outcome::Stopped),
                waited = timeout_at(deadline, events.next()) => waited,
            };

            let event = match waited {
                Err(_) if self.shared.last_activity_at() + idle > Instant::now() => continue,
                Err(_) => return Pump::Finished(Outcome::IdleTimeout),
                Ok(None) => return Pump::Finished(Outcome::Completed),
                Ok(Some(Err(SseError::Body(e)))) => {
                    return Pump::Finished(Outcome::Failed(StreamErrorKind::Transport, e.to_string()))
                }
                Ok(Some(Err(e))) => {
                    return Pump::Finished(Outcome::Failed(StreamErrorKind::Decode, e.to_string()))
                }
                Ok(Some(Ok(event))) => event,
            };

            if let Step::Finish(pump) = self.forward(event, &token).await {
                return pump;
            }
        }
    }

    async fn forward(&mut self, event: SseEvent, token: &CancellationToken) -> Step {
        if event.is_done_sentinel() {
            return Step::Finish(Pump::Finished(Outcome::Completed));
        }

        if event.event_type() == "error" {
            let (status, message) = error_event(&event);
            if status == Some(StatusCode::UNAUTHORIZED.as_u16()) {
                if self.sink.forwarded == 0 {
                    return Step::Finish(Pump::Unauthorized(message));
                }
                // Partially delivered output is never replayed.
                return Step::Finish(Pump::Finished(Outcome::Failed(
                    StreamErrorKind::Authentication,
                    format!("credentials expired mid-stream: {message}"),
                )));
            }
            return Step::Finish(Pump::Finished(Outcome::Failed(StreamErrorKind::Http, message)));
        }

        let sent = tokio::select! {
            biased;
            () = token.cancelled() => return Step::Finish(Pump::Finished(Outcome::Stopped)),
            sent = self.sink.data(event.payload()) => sent,
        };
        match sent {
            Ok(()) => Step::Continue,
            Err(ReceiverGone) => {
                tracing::debug!("Receiver dropped, aborting stream");
                Step::Finish(Pump::Finished(Outcome::ReceiverGone))
            }
        }
    }
}

/// Status and message carried by an `event: error` frame
fn error_event(event: &SseEvent) -> (Option<u16>, String) {
    let payload = event.payload();
    let status = ["status", "code"]
        .iter()
        .find_map(|field| payload.get(*field)?.as_u64())
        .and_then(|s| u16::try_from(s).ok());

    let message = ["message", "error", "detail"]
        .iter()
        .find_map(|field| payload.get(*field)?.as_str().map(str::to_string))
        .or_else(|| payload.as_str().map(str::to_string))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "server reported an error".to_string());

    (status, message)
}

/// Cheap handle that stops one session
#[derive(Clone, Debug)]
pub struct StopHandle {
    pub(crate) id: SessionId,
    pub(crate) token: CancellationToken,
}

impl StopHandle {
    /// Session this handle stops
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Abort the session; it emits `done` with `stopped` set
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Whether a stop was requested
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Caller side of an open stream
#[derive(Debug)]
pub struct StreamHandle {
    pub(crate) events: mpsc::Receiver<StreamEvent>,
    pub(crate) stop: StopHandle,
}

impl StreamHandle {
    /// Session id
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.stop.id
    }

    /// Handle that can stop the session from elsewhere
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stop the session
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Next event; `None` after the terminal event
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Split into the event receiver and the stop handle
    #[must_use]
    pub fn into_parts(self) -> (mpsc::Receiver<StreamEvent>, StopHandle) {
        (self.events, self.stop)
    }

    /// Collect every remaining event
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        events
    }
}
