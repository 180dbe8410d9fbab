//! Gateway Messages
//!
//! The JSON contract between UI surfaces and the proxy. Surfaces send
//! [`SurfaceMessage`]s; the proxy answers with [`GatewayMessage`]s.
//!
//! Every message is internally tagged by `type`:
//!
//! ```json
//! {"type":"request","id":7,"payload":{"path":"/api/models","method":"GET"}}
//! {"type":"reply","id":7,"reply":{"ok":true,"status":200,"data":[]}}
//!
//! {"type":"open_stream","channel":"chat-1","payload":{"path":"/api/chat","method":"POST","body":{}}}
//! {"type":"stream","channel":"chat-1","event":{"event":"data","payload":{"delta":"Hi"}}}
//! {"type":"stream","channel":"chat-1","event":{"event":"done"}}
//! ```
//!
//! Surfaces never see transport types; failures are flattened into [`Reply`]
//! and [`StreamEvent`] with a machine-readable kind.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::{AuthMode, CredentialSet};
use crate::descriptor::RequestDescriptor;

// ============================================
// Inbound (surface -> proxy)
// ============================================

/// Messages from a UI surface to the proxy
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SurfaceMessage {
    /// One-shot request; answered by exactly one `reply` with the same id
    Request {
        /// Correlation id chosen by the surface
        id: u64,
        /// What to send
        payload: RequestPayload,
    },

    /// Open a streaming request bound to `channel`
    OpenStream {
        /// Surface-chosen channel identity
        channel: String,
        /// What to send
        payload: StreamPayload,
    },

    /// Stop the stream bound to `channel`
    StopStream {
        /// Channel to stop
        channel: String,
    },

    /// Replace the active credential set (login or options page)
    SetCredentials {
        /// Correlation id
        id: u64,
        /// New credentials
        credentials: CredentialSet,
    },

    /// Forget the active credential set (logout)
    ClearCredentials {
        /// Correlation id
        id: u64,
    },

    /// Ask whether credentials are configured
    AuthStatus {
        /// Correlation id
        id: u64,
    },
}

/// Request description as sent by a surface
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    /// Path relative to the API base URL
    pub path: String,
    /// HTTP method name
    #[serde(default = "default_method")]
    pub method: String,
    /// Caller headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// JSON body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl RequestPayload {
    /// Payload with the default method and no headers
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: default_method(),
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Convert into a descriptor
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError`] when the method name or path is unusable.
    pub fn into_descriptor(self) -> Result<RequestDescriptor, PayloadError> {
        if self.path.trim().is_empty() {
            return Err(PayloadError::EmptyPath);
        }
        let method = Method::from_bytes(self.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| PayloadError::InvalidMethod(self.method.clone()))?;

        Ok(RequestDescriptor {
            path: self.path,
            method,
            headers: self.headers,
            body: self.body,
            streaming: false,
            idle_timeout: None,
        })
    }
}

/// Why a surface payload cannot be turned into a request
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    /// The path is blank
    #[error("request path is empty")]
    EmptyPath,

    /// The method is not a valid HTTP method name
    #[error("invalid method: {0}")]
    InvalidMethod(String),

    /// A stream asked for a zero idle timeout
    #[error("streamIdleTimeoutMs must be greater than zero")]
    ZeroIdleTimeout,
}

/// Stream-open description as sent by a surface
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamPayload {
    /// The request to stream
    #[serde(flatten)]
    pub request: RequestPayload,
    /// Idle timeout override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_idle_timeout_ms: Option<u64>,
}

impl StreamPayload {
    /// Convert into a streaming descriptor
    ///
    /// # Errors
    ///
    /// Same as [`RequestPayload::into_descriptor`]; a zero idle timeout is
    /// also rejected.
    pub fn into_descriptor(self) -> Result<RequestDescriptor, PayloadError> {
        let idle_timeout = match self.stream_idle_timeout_ms {
            Some(0) => return Err(PayloadError::ZeroIdleTimeout),
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        };
        let mut descriptor = self.request.into_descriptor()?;
        descriptor.streaming = true;
        descriptor.idle_timeout = idle_timeout;
        Ok(descriptor)
    }
}

// ============================================
// Outbound (proxy -> surface)
// ============================================

/// Messages from the proxy to a UI surface
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    /// Answer to a request or credential message
    Reply {
        /// Correlation id from the surface
        id: u64,
        /// Outcome
        reply: Reply,
    },

    /// One event of a stream
    Stream {
        /// Channel the stream is bound to
        channel: String,
        /// The event
        event: StreamEvent,
    },
}

/// Category of a failed reply
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No response was obtained
    Transport,
    /// The server answered with a non-2xx status
    Http,
    /// The credential could not be refreshed
    Authentication,
    /// The surface sent something the proxy cannot send
    InvalidRequest,
    /// The credential store could not be written
    Storage,
}

/// Outcome of a one-shot request
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Whether the request succeeded (2xx)
    pub ok: bool,
    /// HTTP status, absent when no response was obtained
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Response body (JSON, or a string when not JSON)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Human-readable failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure category
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
}

impl Reply {
    /// Successful reply
    #[must_use]
    pub fn success(status: Option<u16>, data: serde_json::Value) -> Self {
        Self {
            ok: true,
            status,
            data: Some(data),
            ..Self::default()
        }
    }

    /// Failed reply
    #[must_use]
    pub fn failure(kind: FailureKind, status: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            status,
            error: Some(error.into()),
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// Attach the response body to a failed reply
    #[must_use]
    pub fn with_data(mut self, data: Option<serde_json::Value>) -> Self {
        self.data = data;
        self
    }
}

/// Why a stream ended in error
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorKind {
    /// No chunk arrived within the idle timeout
    IdleTimeout,
    /// The connection failed or dropped
    Transport,
    /// The server rejected the stream or sent an error event
    Http,
    /// The credential could not be refreshed, or expired mid-stream
    Authentication,
    /// The event stream was malformed
    Decode,
    /// The surface sent something the proxy cannot send
    InvalidRequest,
}

/// One event delivered on a stream channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A decoded chunk
    Data {
        /// Event payload (JSON, or a string when not JSON)
        payload: serde_json::Value,
    },

    /// Terminal: the stream completed, or was stopped on request
    Done {
        /// Set when the stream ended because of an explicit stop
        #[serde(default, skip_serializing_if = "is_false")]
        stopped: bool,
    },

    /// Terminal: the stream failed
    Error {
        /// Human-readable reason
        reason: String,
        /// Failure category
        kind: StreamErrorKind,
    },
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl StreamEvent {
    /// Natural completion
    #[must_use]
    pub fn done() -> Self {
        Self::Done { stopped: false }
    }

    /// Completion after an explicit stop
    #[must_use]
    pub fn stopped() -> Self {
        Self::Done { stopped: true }
    }

    /// Failure
    pub fn error(kind: StreamErrorKind, reason: impl Into<String>) -> Self {
        Self::Error {
            reason: reason.into(),
            kind,
        }
    }

    /// Whether this event ends the stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Data { .. })
    }
}

/// Credential presence report; never carries secrets
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    /// Whether a credential set is configured
    pub authenticated: bool,
    /// Mode of the configured set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<AuthMode>,
    /// Whether the set can be refreshed
    pub can_refresh: bool,
}

impl AuthStatus {
    /// Describe an optional credential set
    #[must_use]
    pub fn of(credentials: Option<&CredentialSet>) -> Self {
        Self {
            authenticated: credentials.is_some(),
            mode: credentials.map(|c| c.auth_mode),
            can_refresh: credentials.is_some_and(CredentialSet::can_refresh),
        }
    }
}
