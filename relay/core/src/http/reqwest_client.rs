//! Reqwest HTTP Client
//!
//! Production [`HttpClient`] talking to the remote API over `reqwest`.
//!
//! Non-streaming calls carry a per-request timeout. Streaming calls carry
//! none: their liveness is governed by the per-session idle timeout instead,
//! so a slow-but-steady completion is never cut off.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderValue, ACCEPT};

use crate::config::duration_ms;

use super::traits::{HttpClient, HttpError, HttpResponse, OutboundRequest, StreamResponse};

/// HTTP client bound to one API base URL
#[derive(Clone, Debug)]
pub struct ReqwestClient {
    /// Base URL without trailing slash
    base_url: String,
    /// Timeout for buffered requests
    request_timeout: Duration,
    /// HTTP client
    http_client: reqwest::Client,
}

impl ReqwestClient {
    /// Create a client for `base_url`
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::InvalidRequest`] if the underlying client cannot be
    /// built (for example when the TLS backend fails to initialise).
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, HttpError> {
        let http_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
            http_client,
        })
    }

    /// Get the base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for a request path
    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn build(&self, request: OutboundRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .http_client
            .request(request.method, self.url_for(&request.path))
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.json(&body);
        }
        builder
    }

    fn map_error(&self, e: &reqwest::Error) -> HttpError {
        if e.is_timeout() {
            HttpError::Timeout(duration_ms(self.request_timeout))
        } else if e.is_builder() {
            HttpError::InvalidRequest(e.to_string())
        } else if e.is_body() || e.is_decode() {
            HttpError::Body(e.to_string())
        } else {
            HttpError::Network(e.to_string())
        }
    }

    async fn buffer(&self, response: reqwest::Response) -> Result<HttpResponse, HttpError> {
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| self.map_error(&e))?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: OutboundRequest) -> Result<HttpResponse, HttpError> {
        let response = self
            .build(request)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.map_error(&e))?;

        self.buffer(response).await
    }

    async fn open_stream(&self, mut request: OutboundRequest) -> Result<StreamResponse, HttpError> {
        request
            .headers
            .entry(ACCEPT)
            .or_insert(HeaderValue::from_static("text/event-stream"));

        let response = self
            .build(request)
            .send()
            .await
            .map_err(|e| self.map_error(&e))?;

        if !response.status().is_success() {
            return Ok(StreamResponse::Rejected(self.buffer(response).await?));
        }

        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| HttpError::Body(e.to_string())))
            .boxed();

        Ok(StreamResponse::Accepted { status, body })
    }
}
