//! HTTP Client Traits
//!
//! The seam between the proxy logic and the network. The executor, the
//! refresh coordinator and the stream sessions only see [`HttpClient`], so
//! tests can script responses (including 401s and silent streams) without a
//! server.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use reqwest::header::HeaderMap;
use reqwest::Method;
use thiserror::Error;

/// Errors from the HTTP layer (no response was obtained)
#[derive(Clone, Debug, Error)]
pub enum HttpError {
    /// Could not connect or the connection dropped
    #[error("network error: {0}")]
    Network(String),

    /// The request timed out before a response arrived
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// The request could not be built (bad URL, bad header)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The response body failed mid-transfer
    #[error("body error: {0}")]
    Body(String),
}

/// A fully-resolved outbound request
///
/// Built by the proxy after credential injection; the path is still relative
/// to the configured base URL.
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    /// HTTP method
    pub method: Method,
    /// Path (and query) relative to the API base URL
    pub path: String,
    /// Final headers, auth already resolved
    pub headers: HeaderMap,
    /// JSON body
    pub body: Option<serde_json::Value>,
}

impl OutboundRequest {
    /// Create a request with no headers and no body
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Set a JSON body
    #[must_use]
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// A buffered (non-streaming) response
#[derive(Clone, Debug)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Response headers
    pub headers: HeaderMap,
    /// Raw body
    pub body: Bytes,
}

impl HttpResponse {
    /// Whether the status is 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as UTF-8 text (lossy)
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Byte stream of an accepted streaming response
pub type ByteStream = BoxStream<'static, Result<Bytes, HttpError>>;

/// Result of opening a streaming request
pub enum StreamResponse {
    /// 2xx: the body streams in as chunks arrive
    Accepted {
        /// Status code
        status: u16,
        /// Chunked body
        body: ByteStream,
    },
    /// Non-2xx: the (small) error body was read in full
    Rejected(HttpResponse),
}

impl std::fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted { status, .. } => f
                .debug_struct("Accepted")
                .field("status", status)
                .finish_non_exhaustive(),
            Self::Rejected(response) => f.debug_tuple("Rejected").field(response).finish(),
        }
    }
}

/// Transport used to reach the remote API
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Send a request and buffer the whole response
    async fn send(&self, request: OutboundRequest) -> Result<HttpResponse, HttpError>;

    /// Send a request whose response body is consumed incrementally
    async fn open_stream(&self, request: OutboundRequest) -> Result<StreamResponse, HttpError>;
}
