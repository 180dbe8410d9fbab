//! Refresh Coordinator
//!
//! Performs the token-refresh exchange with at most one exchange in flight
//! process-wide.
//!
//! # Single-Flight
//!
//! ```text
//!   request A ──401──┐
//!   request B ──401──┼──► start_or_attach() ──► Shared<refresh future> ──► POST /refresh
//!   stream  C ──401──┘          │                       │
//!                               │            own task: replace_if_current()
//!                               ▼                       │
//!                       all three await the same result ◄┘
//! ```
//!
//! The exchange runs on its own task, so it completes and stores its result
//! even when every waiter has gone away (a stopped stream, say). Waiters hold
//! a [`Shared`] handle to the task's result, kept in a mutex-guarded slot:
//! the first caller installs it, later callers clone it. The task clears the
//! slot before its result becomes visible, so a caller that has seen the
//! result never attaches to the finished exchange.
//!
//! A refresh never overwrites an explicit re-authentication. The new set is
//! stored only if the store still holds the set the exchange started from;
//! otherwise waiters receive whatever is stored now.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use reqwest::Method;
use serde::Deserialize;
use thiserror::Error;

use crate::credentials::{CredentialSet, CredentialStore};
use crate::descriptor::AuthEndpoints;
use crate::http::{HttpClient, OutboundRequest};
use crate::redact::redact_text;

/// Why a refresh did not produce new credentials
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RefreshError {
    /// There is no credential set at all
    #[error("not authenticated")]
    NotAuthenticated,

    /// The credential set cannot be refreshed (static key, or no refresh token)
    #[error("no refresh token available")]
    NoRefreshToken,

    /// The refresh endpoint refused the refresh token
    #[error("refresh rejected with status {status}: {message}")]
    Rejected {
        /// Status returned by the refresh endpoint
        status: u16,
        /// Redacted response body
        message: String,
    },

    /// The refresh endpoint could not be reached
    #[error("refresh transport failure: {0}")]
    Transport(String),

    /// The refresh endpoint answered 2xx without a usable token
    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),

    /// The new credentials could not be stored
    #[error("failed to store refreshed credentials: {0}")]
    Store(String),
}

/// Outcome of a refresh: the rotated credential set or why it failed
pub type RefreshResult = Result<CredentialSet, RefreshError>;
type InFlight = Shared<BoxFuture<'static, RefreshResult>>;

#[derive(Default)]
struct Slot {
    generation: u64,
    current: Option<(u64, InFlight)>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(alias = "accessToken", alias = "token")]
    access_token: Option<String>,
    #[serde(default, alias = "refreshToken")]
    refresh_token: Option<String>,
}

/// Coordinates token refresh across every request and stream
pub struct RefreshCoordinator {
    store: Arc<dyn CredentialStore>,
    client: Arc<dyn HttpClient>,
    endpoints: AuthEndpoints,
    in_flight: Arc<Mutex<Slot>>,
    refresh_calls: Arc<AtomicU64>,
}

impl RefreshCoordinator {
    /// Create a coordinator
    pub fn new(
        store: Arc<dyn CredentialStore>,
        client: Arc<dyn HttpClient>,
        endpoints: AuthEndpoints,
    ) -> Self {
        Self {
            store,
            client,
            endpoints,
            in_flight: Arc::new(Mutex::new(Slot::default())),
            refresh_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of refresh exchanges sent to the server so far
    #[must_use]
    pub fn refresh_calls(&self) -> u64 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Whether a refresh is currently in flight
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.in_flight.lock().current.is_some()
    }

    /// Refresh the credential set, attaching to an in-flight refresh if any
    ///
    /// # Errors
    ///
    /// Returns the shared [`RefreshError`] when the exchange fails; the stored
    /// credentials are left untouched in that case.
    pub async fn refresh(&self) -> RefreshResult {
        self.start_or_attach().await
    }

    /// Refresh after the server rejected `rejected_access_token`
    ///
    /// If the stored token already differs from the rejected one, another
    /// caller refreshed in the meantime and the current set is returned
    /// without contacting the server.
    ///
    /// # Errors
    ///
    /// Same as [`RefreshCoordinator::refresh`].
    pub async fn refresh_rejected(&self, rejected_access_token: Option<&str>) -> RefreshResult {
        if let (Some(rejected), Some(current)) = (rejected_access_token, self.store.get()) {
            if current.access_token != rejected && !self.is_refreshing() {
                tracing::debug!("Credentials rotated since rejection, reusing current set");
                return Ok(current);
            }
        }
        self.refresh().await
    }

    fn start_or_attach(&self) -> InFlight {
        let mut slot = self.in_flight.lock();
        if let Some((_, existing)) = slot.current.as_ref() {
            tracing::debug!(
                waiters = existing.strong_count().unwrap_or(0),
                "Attaching to in-flight refresh"
            );
            return existing.clone();
        }

        slot.generation += 1;
        let generation = slot.generation;
        let run = exchange(
            Arc::clone(&self.store),
            Arc::clone(&self.client),
            self.endpoints.clone(),
            Arc::clone(&self.refresh_calls),
        );
        let in_flight = Arc::clone(&self.in_flight);
        let task = tokio::spawn(async move {
            let result = run.await;
            let mut slot = in_flight.lock();
            if slot.current.as_ref().is_some_and(|(g, _)| *g == generation) {
                slot.current = None;
            }
            result
        });

        let shared = async move {
            task.await.unwrap_or_else(|e| {
                Err(RefreshError::Transport(format!("refresh task failed: {e}")))
            })
        }
        .boxed()
        .shared();
        slot.current = Some((generation, shared.clone()));
        shared
    }
}

async fn exchange(
    store: Arc<dyn CredentialStore>,
    client: Arc<dyn HttpClient>,
    endpoints: AuthEndpoints,
    refresh_calls: Arc<AtomicU64>,
) -> RefreshResult {
    let current = store.get().ok_or(RefreshError::NotAuthenticated)?;
    if !current.can_refresh() {
        return Err(RefreshError::NoRefreshToken);
    }
    let refresh_token = current.refresh_token.clone().unwrap_or_default();

    // Refresh token only: never the access token, never a stale Authorization.
    let request = OutboundRequest::new(Method::POST, endpoints.refresh_path())
        .with_body(serde_json::json!({ "refresh_token": refresh_token }));

    refresh_calls.fetch_add(1, Ordering::SeqCst);
    tracing::info!(path = %endpoints.refresh_path(), "Refreshing credentials");

    let response = client
        .send(request)
        .await
        .map_err(|e| RefreshError::Transport(e.to_string()))?;

    if !response.is_success() {
        let message = redact_text(&response.text()).into_owned();
        tracing::warn!(status = response.status, "Refresh rejected");
        return Err(RefreshError::Rejected {
            status: response.status,
            message,
        });
    }

    let parsed: RefreshResponse = serde_json::from_slice(&response.body)
        .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
    let access_token = parsed
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| RefreshError::InvalidResponse("missing access_token".to_string()))?;

    let refreshed = CredentialSet {
        access_token,
        refresh_token: parsed.refresh_token.or_else(|| current.refresh_token.clone()),
        auth_mode: current.auth_mode,
        api_key: current.api_key.clone(),
        obtained_at: None,
    };

    let stored = store
        .replace_if_current(&current, refreshed)
        .map_err(|e| RefreshError::Store(e.to_string()))?;

    if stored {
        tracing::info!("Credentials refreshed");
    } else {
        tracing::info!("Credentials replaced during refresh, keeping the new set");
    }
    store.get().ok_or(RefreshError::NotAuthenticated)
}
