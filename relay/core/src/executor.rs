//! Request Executor
//!
//! Sends one-shot requests with the current credentials and turns the result
//! into a [`Reply`].
//!
//! ```text
//! descriptor ─► bootstrap? ──yes──► send without auth ──────────────► reply
//!                  │no
//!                  ▼
//!            send with current set ─► 401? ──no──────────────────────► reply
//!                                      │yes
//!                                      ▼
//!                              refresh_rejected() ──err──► authentication reply
//!                                      │ok
//!                                      ▼
//!                              send once with new set ───────────────► reply
//! ```
//!
//! The retry is never repeated: a second 401 is returned as-is.

use std::sync::Arc;

use reqwest::StatusCode;
use tracing::Instrument;

use crate::credentials::CredentialStore;
use crate::descriptor::{AuthEndpoints, RequestDescriptor};
use crate::http::{HttpClient, HttpResponse};
use crate::messages::{FailureKind, Reply};
use crate::redact::redact_text;
use crate::refresh::RefreshCoordinator;

/// Executes non-streaming requests
pub struct RequestExecutor {
    store: Arc<dyn CredentialStore>,
    client: Arc<dyn HttpClient>,
    refresh: Arc<RefreshCoordinator>,
    endpoints: AuthEndpoints,
}

impl RequestExecutor {
    /// Create an executor
    pub fn new(
        store: Arc<dyn CredentialStore>,
        client: Arc<dyn HttpClient>,
        refresh: Arc<RefreshCoordinator>,
        endpoints: AuthEndpoints,
    ) -> Self {
        Self {
            store,
            client,
            refresh,
            endpoints,
        }
    }

    /// Execute a request, refreshing and retrying once on 401
    pub async fn execute(&self, descriptor: &RequestDescriptor) -> Reply {
        let span = tracing::info_span!(
            "request",
            method = %descriptor.method,
            path = %descriptor.route()
        );
        self.execute_inner(descriptor).instrument(span).await
    }

    async fn execute_inner(&self, descriptor: &RequestDescriptor) -> Reply {
        if self.endpoints.is_bootstrap(&descriptor.path) {
            tracing::debug!("Bootstrap endpoint, sending without credentials");
            let request = self.endpoints.prepare(descriptor, None);
            return match self.client.send(request).await {
                Ok(response) => shape_response(&response),
                Err(e) => Reply::failure(FailureKind::Transport, None, e.to_string()),
            };
        }

        let credentials = self.store.get();
        let request = self.endpoints.prepare(descriptor, credentials.as_ref());
        let response = match self.client.send(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Request failed");
                return Reply::failure(FailureKind::Transport, None, e.to_string());
            }
        };

        if response.status != StatusCode::UNAUTHORIZED.as_u16() {
            return shape_response(&response);
        }

        tracing::info!("Received 401, refreshing credentials");
        let rejected = credentials.as_ref().map(|c| c.access_token.as_str());
        let refreshed = match self.refresh.refresh_rejected(rejected).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                tracing::warn!(error = %e, "Refresh failed, not retrying");
                return Reply::failure(FailureKind::Authentication, Some(response.status), e.to_string());
            }
        };

        let retry = self.endpoints.prepare(descriptor, Some(&refreshed));
        match self.client.send(retry).await {
            Ok(response) => {
                tracing::debug!(status = response.status, "Retry completed");
                shape_response(&response)
            }
            Err(e) => Reply::failure(FailureKind::Transport, None, e.to_string()),
        }
    }
}

/// Turn a buffered response into a reply
pub(crate) fn shape_response(response: &HttpResponse) -> Reply {
    let data = body_value(response);

    if response.is_success() {
        return Reply::success(Some(response.status), data.unwrap_or(serde_json::Value::Null));
    }

    let error = error_message(response, data.as_ref());
    Reply::failure(FailureKind::Http, Some(response.status), error).with_data(data)
}

fn body_value(response: &HttpResponse) -> Option<serde_json::Value> {
    if response.body.is_empty() {
        return None;
    }
    match serde_json::from_slice(&response.body) {
        Ok(value) => Some(value),
        Err(_) => Some(serde_json::Value::String(response.text())),
    }
}

/// Best human-readable message for a failed response
pub(crate) fn error_message(response: &HttpResponse, data: Option<&serde_json::Value>) -> String {
    let from_json = data.and_then(|value| {
        ["detail", "error", "message"]
            .iter()
            .find_map(|field| match value.get(*field)? {
                serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            })
    });
    if let Some(message) = from_json {
        return redact_text(&message).into_owned();
    }

    let text = response.text();
    let text = text.trim();
    if !text.is_empty() && !text.starts_with('{') {
        return redact_text(text).into_owned();
    }

    StatusCode::from_u16(response.status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .map_or_else(|| format!("HTTP {}", response.status), str::to_string)
}
