//! Remote API Access
//!
//! Abstracted access to the remote HTTP/SSE server through a common trait,
//! mirroring how the proxy talks to exactly one backend.
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::http::{HttpClient, OutboundRequest, ReqwestClient};
//!
//! let client = ReqwestClient::new("http://localhost:8080", timeout, "relay/0.1")?;
//! let response = client.send(OutboundRequest::new(Method::GET, "/api/models")).await?;
//! ```

mod reqwest_client;
mod traits;

pub use reqwest_client::ReqwestClient;
pub use traits::{
    ByteStream, HttpClient, HttpError, HttpResponse, OutboundRequest, StreamResponse,
};
