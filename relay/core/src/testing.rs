//! Scripted [`HttpClient`] for unit tests

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::http::{HttpClient, HttpError, HttpResponse, OutboundRequest, StreamResponse};

pub(crate) fn response(status: u16, body: &str) -> HttpResponse {
    HttpResponse {
        status,
        headers: HeaderMap::new(),
        body: Bytes::from(body.to_string()),
    }
}

/// Holds a scripted reply back until released
pub(crate) struct Gate(oneshot::Sender<()>);

impl Gate {
    pub(crate) fn release(self) {
        let _ = self.0.send(());
    }
}

/// Feeds chunks into an accepted stream; dropping it ends the stream
pub(crate) type ChunkSender = mpsc::UnboundedSender<Result<Bytes, HttpError>>;

enum Scripted<T> {
    Ready(Result<T, HttpError>),
    Gated(oneshot::Receiver<()>, Result<T, HttpError>),
    Hang,
}

impl<T> Scripted<T> {
    async fn resolve(self) -> Result<T, HttpError> {
        match self {
            Self::Ready(result) => result,
            Self::Gated(gate, result) => {
                let _ = gate.await;
                result
            }
            Self::Hang => futures::future::pending().await,
        }
    }
}

#[derive(Default)]
pub(crate) struct ScriptedClient {
    sends: Mutex<VecDeque<Scripted<HttpResponse>>>,
    streams: Mutex<VecDeque<Scripted<StreamResponse>>>,
    sent: Mutex<Vec<OutboundRequest>>,
}

impl ScriptedClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_send(&self, response: HttpResponse) {
        self.sends.lock().push_back(Scripted::Ready(Ok(response)));
    }

    pub(crate) fn push_send_error(&self, error: HttpError) {
        self.sends.lock().push_back(Scripted::Ready(Err(error)));
    }

    pub(crate) fn push_send_gated(&self, response: HttpResponse) -> Gate {
        let (tx, rx) = oneshot::channel();
        self.sends.lock().push_back(Scripted::Gated(rx, Ok(response)));
        Gate(tx)
    }

    /// Queue an accepted stream and return the sender feeding its body
    pub(crate) fn push_stream(&self) -> ChunkSender {
        let (tx, rx) = mpsc::unbounded_channel();
        let body = UnboundedReceiverStream::new(rx).boxed();
        self.streams
            .lock()
            .push_back(Scripted::Ready(Ok(StreamResponse::Accepted { status: 200, body })));
        tx
    }

    pub(crate) fn push_stream_rejected(&self, response: HttpResponse) {
        self.streams
            .lock()
            .push_back(Scripted::Ready(Ok(StreamResponse::Rejected(response))));
    }

    pub(crate) fn push_stream_error(&self, error: HttpError) {
        self.streams.lock().push_back(Scripted::Ready(Err(error)));
    }

    /// Queue a stream whose response headers never arrive
    pub(crate) fn push_stream_hang(&self) {
        self.streams.lock().push_back(Scripted::Hang);
    }

    /// Every request seen so far, in order
    pub(crate) fn sent(&self) -> Vec<OutboundRequest> {
        self.sent.lock().clone()
    }

    /// `Authorization` values of every request seen so far
    pub(crate) fn authorizations(&self) -> Vec<Option<String>> {
        self.sent
            .lock()
            .iter()
            .map(|r| {
                r.headers
                    .get(reqwest::header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .collect()
    }
}

#[async_trait]
impl HttpClient for ScriptedClient {
    async fn send(&self, request: OutboundRequest) -> Result<HttpResponse, HttpError> {
        self.sent.lock().push(request);
        let next = self.sends.lock().pop_front();
        match next {
            Some(scripted) => scripted.resolve().await,
            None => Err(HttpError::Network("no scripted response".to_string())),
        }
    }

    async fn open_stream(&self, request: OutboundRequest) -> Result<StreamResponse, HttpError> {
        self.sent.lock().push(request);
        let next = self.streams.lock().pop_front();
        match next {
            Some(scripted) => scripted.resolve().await,
            None => Err(HttpError::Network("no scripted stream".to_string())),
        }
    }
}
