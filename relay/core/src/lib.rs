//! Relay Core - Background Request and Stream Proxy
//!
//! Every UI surface (popup, options page, content scripts, CLI) sends its
//! remote API traffic through one long-lived relay instead of talking to the
//! server directly. The relay owns the credentials, attaches auth headers,
//! recovers from expired tokens and relays streaming responses.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           UI Surfaces                            │
//! │      popup     options page     content script     CLI           │
//! │         │            │                │             │            │
//! │         └────────────┴───── SurfaceMessage (up) ────┘            │
//! │                           GatewayMessage (down)                  │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ Unix socket, framed JSON
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                          RELAY CORE                              │
//! │                        ┌──────┴──────┐                           │
//! │                        │   Gateway   │                           │
//! │                        └──┬───────┬──┘                           │
//! │               ┌───────────┘       └───────────┐                  │
//! │      ┌────────┴────────┐           ┌──────────┴──────────┐       │
//! │      │ RequestExecutor │           │ StreamSessionManager│       │
//! │      └────────┬────────┘           └──────────┬──────────┘       │
//! │               └────────┬──────────────────────┘                  │
//! │             ┌──────────┴─────────┐   ┌─────────────────┐         │
//! │             │ RefreshCoordinator │──►│ CredentialStore │         │
//! │             └──────────┬─────────┘   └─────────────────┘         │
//! │                        │ HttpClient (reqwest)                    │
//! └────────────────────────┼─────────────────────────────────────────┘
//!                          ▼
//!                    remote API server
//! ```
//!
//! # Key Types
//!
//! - [`Gateway`]: routes surface messages and owns the channel table
//! - [`RequestExecutor`]: one-shot requests with one retry after a refresh
//! - [`StreamSessionManager`]: SSE sessions with idle timeout and stop
//! - [`RefreshCoordinator`]: at most one token refresh in flight
//! - [`CredentialStore`]: the single active credential set
//!
//! # Quick Start
//!
//! ```ignore
//! use relay_core::{load_config, Gateway, RequestPayload};
//!
//! let config = load_config()?;
//! let gateway = Gateway::from_config(&config)?;
//! let reply = gateway.handle_request(RequestPayload::new("/api/models")).await;
//! ```

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod credentials;
pub mod descriptor;
pub mod executor;
pub mod gateway;
pub mod http;
pub mod messages;
pub mod redact;
pub mod refresh;
pub mod streaming;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use config::{
    default_config_path, default_credentials_path, load_config, load_config_from_path,
    ConfigError, ConfigOverrides, ConfigSource, RelayConfig,
};
pub use credentials::{
    AuthMode, CredentialSet, CredentialStore, FileCredentialStore, MemoryCredentialStore,
    StoreError,
};
pub use descriptor::{AuthEndpoints, RequestDescriptor};
pub use executor::RequestExecutor;
pub use gateway::{ChannelKey, Gateway, SetupError};
pub use http::{HttpClient, HttpError, ReqwestClient};
pub use messages::{
    AuthStatus, FailureKind, GatewayMessage, PayloadError, Reply, RequestPayload,
    StreamErrorKind, StreamEvent, StreamPayload, SurfaceMessage,
};
pub use refresh::{RefreshCoordinator, RefreshError, RefreshResult};
pub use streaming::{
    SessionId, SessionState, StopHandle, StreamHandle, StreamSessionManager, StreamSettings,
};
pub use transport::{ConnectionId, TransportError, UnixSocketClient, UnixSocketServer};
