//! Unix Socket Client Transport
//!
//! Surface side: connects to the relay daemon and exchanges framed messages.
//! Besides raw `send`/`recv`, [`UnixSocketClient::request`] correlates a
//! request with its reply by id, holding back any stream events that arrive
//! in between so `recv` still sees them in order.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use crate::messages::{GatewayMessage, Reply, RequestPayload, SurfaceMessage};
use crate::transport::frame::{encode, FrameDecoder};
use crate::transport::TransportError;

/// Client-side Unix socket transport for surfaces
pub struct UnixSocketClient {
    socket_path: PathBuf,
    msg_rx: Option<mpsc::Receiver<GatewayMessage>>,
    msg_tx: Option<mpsc::Sender<SurfaceMessage>>,
    connected: Arc<AtomicBool>,
    /// Messages read while waiting for a specific reply
    backlog: VecDeque<GatewayMessage>,
    next_id: u64,
}

impl UnixSocketClient {
    /// Create a client for the daemon socket at `socket_path`
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            msg_rx: None,
            msg_tx: None,
            connected: Arc::new(AtomicBool::new(false)),
            backlog: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Create a client using the default socket path
    #[must_use]
    pub fn with_default_path() -> Self {
        Self::new(super::default_socket_path())
    }

    /// Get the socket path
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Connect to the daemon
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the socket is not
    /// accepting connections, or [`TransportError::InvalidState`] if already
    /// connected.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidState("Already connected".to_string()));
        }

        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to connect to {}: {e}",
                self.socket_path.display()
            ))
        })?;
        let (mut read_half, mut write_half) = stream.into_split();

        let (msg_tx, msg_rx) = mpsc::channel::<GatewayMessage>(256);
        let (out_tx, mut out_rx) = mpsc::channel::<SurfaceMessage>(256);
        self.connected.store(true, Ordering::SeqCst);

        let connected_read = Arc::clone(&self.connected);
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 8192];

            'read: loop {
                let n = match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                decoder.push(&buf[..n]);
                loop {
                    match decoder.decode::<GatewayMessage>() {
                        Ok(Some(msg)) => {
                            if msg_tx.send(msg).await.is_err() {
                                break 'read;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "Frame decode error");
                            break 'read;
                        }
                    }
                }
            }

            connected_read.store(false, Ordering::SeqCst);
            tracing::debug!("Disconnected from relay daemon");
        });

        let connected_write = Arc::clone(&self.connected);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let frame = match encode(&msg) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(error = %e, "Encode error");
                        continue;
                    }
                };
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
            connected_write.store(false, Ordering::SeqCst);
        });

        self.msg_rx = Some(msg_rx);
        self.msg_tx = Some(out_tx);

        tracing::debug!(path = %self.socket_path.display(), "Connected to relay daemon");
        Ok(())
    }

    /// Close the connection
    pub fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.msg_rx = None;
        self.msg_tx = None;
        self.backlog.clear();
    }

    /// Whether the connection is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a message to the daemon
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidState`] when not connected and
    /// [`TransportError::SendFailed`] when the connection has dropped.
    pub async fn send(&self, msg: SurfaceMessage) -> Result<(), TransportError> {
        let tx = self
            .msg_tx
            .as_ref()
            .filter(|_| self.is_connected())
            .ok_or_else(|| TransportError::InvalidState("Not connected".to_string()))?;
        tx.send(msg)
            .await
            .map_err(|_| TransportError::SendFailed("Channel closed".to_string()))
    }

    /// Receive the next message from the daemon
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the daemon hangs up.
    pub async fn recv(&mut self) -> Result<GatewayMessage, TransportError> {
        if let Some(msg) = self.backlog.pop_front() {
            return Ok(msg);
        }
        let rx = self
            .msg_rx
            .as_mut()
            .ok_or_else(|| TransportError::InvalidState("Not connected".to_string()))?;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    /// Receive a message if one is already waiting
    pub fn try_recv(&mut self) -> Option<GatewayMessage> {
        if let Some(msg) = self.backlog.pop_front() {
            return Some(msg);
        }
        self.msg_rx.as_mut()?.try_recv().ok()
    }

    /// Allocate the next request id
    pub fn next_request_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Send a message built around a fresh id and wait for its reply
    ///
    /// # Errors
    ///
    /// Same as [`Self::send`] and [`Self::recv`].
    pub async fn call(
        &mut self,
        build: impl FnOnce(u64) -> SurfaceMessage,
    ) -> Result<Reply, TransportError> {
        let id = self.next_request_id();
        self.send(build(id)).await?;

        let rx = self
            .msg_rx
            .as_mut()
            .ok_or_else(|| TransportError::InvalidState("Not connected".to_string()))?;
        loop {
            match rx.recv().await.ok_or(TransportError::ConnectionClosed)? {
                GatewayMessage::Reply { id: reply_id, reply } if reply_id == id => return Ok(reply),
                other => self.backlog.push_back(other),
            }
        }
    }

    /// Proxy one request and wait for its reply
    ///
    /// # Errors
    ///
    /// Same as [`Self::call`].
    pub async fn request(&mut self, payload: RequestPayload) -> Result<Reply, TransportError> {
        self.call(|id| SurfaceMessage::Request { id, payload }).await
    }
}
