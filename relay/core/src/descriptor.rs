//! Request Descriptors and Auth Header Policy
//!
//! A [`RequestDescriptor`] is what a UI surface submits. It is immutable once
//! submitted; the proxy derives a fresh [`OutboundRequest`] from it for every
//! attempt, always resolving auth from the credential set:
//!
//! - caller-supplied `Authorization` and API-key headers are discarded
//! - bootstrap endpoints (login, signup, token) get no auth header at all
//! - every other endpoint gets exactly the header derived from the current set

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::Method;

use crate::credentials::CredentialSet;
use crate::http::OutboundRequest;

/// Default header carrying static API keys
pub const DEFAULT_API_KEY_HEADER: &str = "x-api-key";

/// A request as submitted by a UI surface
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    /// Path relative to the API base URL (may include a query string)
    pub path: String,
    /// HTTP method
    pub method: Method,
    /// Caller headers (auth headers are ignored)
    pub headers: HashMap<String, String>,
    /// JSON body
    pub body: Option<serde_json::Value>,
    /// Whether the response is consumed as an event stream
    pub streaming: bool,
    /// Idle timeout for streaming responses
    pub idle_timeout: Option<Duration>,
}

impl RequestDescriptor {
    /// Non-streaming request
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method,
            headers: HashMap::new(),
            body: None,
            streaming: false,
            idle_timeout: None,
        }
    }

    /// Streaming request
    pub fn streaming(method: Method, path: impl Into<String>) -> Self {
        Self {
            streaming: true,
            ..Self::new(method, path)
        }
    }

    /// Add a caller header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set a JSON body
    #[must_use]
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Set the stream idle timeout
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Path without query string or fragment
    #[must_use]
    pub fn route(&self) -> &str {
        route_of(&self.path)
    }
}

fn route_of(path: &str) -> &str {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    &path[..end]
}

/// Which endpoints bootstrap authentication and how keys are sent
#[derive(Clone, Debug)]
pub struct AuthEndpoints {
    bootstrap_paths: Vec<String>,
    refresh_path: String,
    api_key_header: HeaderName,
}

impl AuthEndpoints {
    /// Create the endpoint policy
    ///
    /// The refresh path is always treated as a bootstrap endpoint.
    pub fn new(
        bootstrap_paths: impl IntoIterator<Item = String>,
        refresh_path: impl Into<String>,
        api_key_header: HeaderName,
    ) -> Self {
        let refresh_path = refresh_path.into();
        let mut bootstrap_paths: Vec<String> = bootstrap_paths
            .into_iter()
            .map(|p| normalize(&p))
            .collect();
        let normalized_refresh = normalize(&refresh_path);
        if !bootstrap_paths.contains(&normalized_refresh) {
            bootstrap_paths.push(normalized_refresh);
        }

        Self {
            bootstrap_paths,
            refresh_path,
            api_key_header,
        }
    }

    /// Path of the refresh endpoint
    #[must_use]
    pub fn refresh_path(&self) -> &str {
        &self.refresh_path
    }

    /// Header name used in api-key mode
    #[must_use]
    pub fn api_key_header(&self) -> &HeaderName {
        &self.api_key_header
    }

    /// Whether `path` is a login/token endpoint that must not carry credentials
    #[must_use]
    pub fn is_bootstrap(&self, path: &str) -> bool {
        let route = normalize(route_of(path));
        self.bootstrap_paths.iter().any(|p| *p == route)
    }

    /// Build the outbound request for one attempt
    ///
    /// Auth headers from the caller are dropped. When `credentials` is `Some`,
    /// its header is injected; bootstrap calls pass `None`.
    #[must_use]
    pub fn prepare(
        &self,
        descriptor: &RequestDescriptor,
        credentials: Option<&CredentialSet>,
    ) -> OutboundRequest {
        let mut headers = HeaderMap::new();
        for (name, value) in &descriptor.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                tracing::debug!(header = %name, "Dropping invalid caller header name");
                continue;
            };
            if self.is_auth_header(&name) {
                continue;
            }
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.insert(name, value);
                }
                Err(_) => tracing::debug!(header = %name, "Dropping invalid caller header value"),
            }
        }

        if let Some((name, value)) =
            credentials.and_then(|c| c.auth_header(&self.api_key_header))
        {
            headers.insert(name, value);
        }

        OutboundRequest {
            method: descriptor.method.clone(),
            path: descriptor.path.clone(),
            headers,
            body: descriptor.body.clone(),
        }
    }

    fn is_auth_header(&self, name: &HeaderName) -> bool {
        *name == AUTHORIZATION || *name == self.api_key_header
    }
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self::new(
            [
                "/api/v1/auths/signin".to_string(),
                "/api/v1/auths/signup".to_string(),
            ],
            "/api/v1/auths/refresh",
            HeaderName::from_static(DEFAULT_API_KEY_HEADER),
        )
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim();
    let with_slash = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };
    if with_slash.len() > 1 {
        with_slash.trim_end_matches('/').to_string()
    } else {
        with_slash
    }
}
