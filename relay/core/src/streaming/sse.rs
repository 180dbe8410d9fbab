//! Server-Sent Events Decoding
//!
//! Turns a `text/event-stream` body into discrete events. Framing is done by
//! [`eventsource_stream`], which buffers partial lines and multi-line events
//! across chunk boundaries. This module adds what a completion stream needs
//! on top: a per-event size cap, the `[DONE]` sentinel and JSON payloads.
//!
//! # Wire Format
//!
//! ```text
//! : comment, ignored
//! event: message
//! data: {"delta":"Hel
//! data: lo"}
//! id: 42
//!                          <- blank line dispatches the event
//! data: [DONE]
//!
//! ```
//!
//! Events without a `data` line are never dispatched. An event still missing
//! its blank line when the body ends is discarded.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;

use crate::http::{ByteStream, HttpError};

/// Maximum bytes buffered for one pending event (8 MB)
pub const MAX_EVENT_SIZE: usize = 8 * 1024 * 1024;

/// Data value that marks the end of a completion stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// Decoding failures
#[derive(Clone, Debug, Error)]
pub enum SseError {
    /// The body is not valid UTF-8
    #[error("event stream is not valid UTF-8")]
    InvalidUtf8,

    /// The framing could not be parsed
    #[error("malformed event stream: {0}")]
    Malformed(String),

    /// A pending event grew past [`MAX_EVENT_SIZE`]
    #[error("event exceeds {MAX_EVENT_SIZE} bytes")]
    EventTooLarge,

    /// The body itself failed
    #[error(transparent)]
    Body(#[from] HttpError),
}

impl From<EventStreamError<SseError>> for SseError {
    fn from(err: EventStreamError<SseError>) -> Self {
        match err {
            EventStreamError::Transport(inner) => inner,
            EventStreamError::Utf8(_) => Self::InvalidUtf8,
            other => Self::Malformed(other.to_string()),
        }
    }
}

/// One dispatched event
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, if any
    pub event: Option<String>,
    /// Joined `data:` lines
    pub data: String,
    /// Last `id:` seen, if any
    pub id: Option<String>,
}

impl SseEvent {
    /// Event type, `message` when unnamed
    #[must_use]
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }

    /// Whether this is the `[DONE]` end-of-stream marker
    #[must_use]
    pub fn is_done_sentinel(&self) -> bool {
        self.data.trim() == DONE_SENTINEL
    }

    /// Data parsed as JSON, or as a JSON string when it is not JSON
    #[must_use]
    pub fn payload(&self) -> serde_json::Value {
        serde_json::from_str(&self.data)
            .unwrap_or_else(|_| serde_json::Value::String(self.data.clone()))
    }
}

impl From<eventsource_stream::Event> for SseEvent {
    fn from(event: eventsource_stream::Event) -> Self {
        Self {
            event: Some(event.event).filter(|e| !e.is_empty() && e != "message"),
            data: event.data,
            id: Some(event.id).filter(|id| !id.is_empty()),
        }
    }
}

/// Decoded events of one response body
pub type SseStream = BoxStream<'static, Result<SseEvent, SseError>>;

/// Decode `body` into events
///
/// Bytes received since the last dispatched event are counted; once they pass
/// [`MAX_EVENT_SIZE`] the stream yields [`SseError::EventTooLarge`].
#[must_use]
pub fn decode(body: ByteStream) -> SseStream {
    let pending = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&pending);

    let bounded = body.map(move |chunk| -> Result<Bytes, SseError> {
        let chunk = chunk?;
        let buffered = counted.fetch_add(chunk.len(), Ordering::Relaxed) + chunk.len();
        if buffered > MAX_EVENT_SIZE {
            return Err(SseError::EventTooLarge);
        }
        Ok(chunk)
    });

    bounded
        .eventsource()
        .map(move |item| -> Result<SseEvent, SseError> {
            let event = item?;
            pending.store(0, Ordering::Relaxed);
            Ok(SseEvent::from(event))
        })
        .boxed()
}
