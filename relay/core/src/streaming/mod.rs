//! Streaming Sessions
//!
//! Streaming requests (chat completions) are consumed incrementally and
//! relayed to the caller as events.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                    StreamSessionManager                        │
//! │  registry: SessionId -> { abort token, state, last activity } │
//! │                                                                │
//! │   open() ──spawn──► StreamSession task                         │
//! │                       │ open_stream (auth, 401 -> refresh once)│
//! │                       │ sse::decode(body) -> events            │
//! │                       │ idle deadline from last chunk          │
//! │                       ▼                                        │
//! │                  EventSink ──► mpsc ──► StreamHandle           │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every session ends with exactly one terminal event:
//!
//! | Ending            | Event                           | State       |
//! |-------------------|---------------------------------|-------------|
//! | `[DONE]` / EOF    | `done`                          | `Completed` |
//! | explicit stop     | `done` with `stopped: true`     | `Aborted`   |
//! | idle timeout      | `error` (`idle_timeout`)        | `Aborted`   |
//! | anything else     | `error`                         | `Errored`   |
//!
//! # Example
//!
//! ```ignore
//! let mut handle = manager.open(RequestDescriptor::streaming(Method::POST, "/api/chat"));
//! while let Some(event) = handle.recv().await {
//!     render(event);
//! }
//! ```

mod manager;
mod session;
pub mod sse;

pub use manager::{SessionSnapshot, StreamSessionManager, StreamSettings};
pub use session::{SessionId, SessionState, StopHandle, StreamHandle};
pub use sse::{SseError, SseEvent, SseStream};
