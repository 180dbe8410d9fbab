//! Unix Socket Server Transport
//!
//! Daemon side: binds the socket, validates peers and turns each accepted
//! stream into a [`SurfaceConnection`] backed by a reader and a writer task.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::messages::{GatewayMessage, SurfaceMessage};
use crate::transport::frame::{encode, FrameDecoder};
use crate::transport::{ConnectionId, TransportError};

/// Per-connection channel capacity
const CONNECTION_CHANNEL_CAPACITY: usize = 256;

/// One accepted surface
///
/// `inbound` yields decoded messages until the peer disconnects or sends a
/// malformed frame. Messages sent on `outbound` are framed and written in
/// order.
#[derive(Debug)]
pub struct SurfaceConnection {
    /// Connection identity
    pub id: ConnectionId,
    /// Messages from the surface
    pub inbound: mpsc::Receiver<SurfaceMessage>,
    /// Messages to the surface
    pub outbound: mpsc::Sender<GatewayMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SurfaceConnection {
    /// Abort the reader and writer tasks
    pub fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Server-side Unix socket transport
pub struct UnixSocketServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
}

impl UnixSocketServer {
    /// Create a server for `socket_path`; nothing is bound until [`Self::listen`]
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            listener: None,
        }
    }

    /// Get the socket path
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket with owner-only permissions
    ///
    /// A stale socket file at the path is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::IoError`] if the directory cannot be created
    /// or the socket cannot be bound.
    pub fn listen(&mut self) -> Result<(), TransportError> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TransportError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create directory {}: {e}", parent.display()),
                ))
            })?;
        }

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        self.listener = Some(listener);

        tracing::info!(path = %self.socket_path.display(), "Listening on Unix socket");
        Ok(())
    }

    /// Accept the next surface connection
    ///
    /// # Errors
    ///
    /// - [`TransportError::InvalidState`] if [`Self::listen`] was not called
    /// - [`TransportError::AuthenticationFailed`] if the peer runs as another user
    /// - [`TransportError::IoError`] if accepting fails
    pub async fn accept(&self) -> Result<SurfaceConnection, TransportError> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| TransportError::InvalidState("Not listening".to_string()))?;

        let (stream, _addr) = listener.accept().await?;
        validate_peer(&stream)?;

        let id = ConnectionId::new();
        let (inbound_tx, inbound) = mpsc::channel(CONNECTION_CHANNEL_CAPACITY);
        let (outbound, outbound_rx) = mpsc::channel(CONNECTION_CHANNEL_CAPACITY);
        let (read_half, write_half) = stream.into_split();

        let reader = tokio::spawn(read_loop(id.clone(), read_half, inbound_tx));
        let writer = tokio::spawn(write_loop(id.clone(), write_half, outbound_rx));

        tracing::info!(conn_id = %id, "Surface connected");
        Ok(SurfaceConnection {
            id,
            inbound,
            outbound,
            reader,
            writer,
        })
    }

    /// Stop listening and remove the socket file
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::IoError`] if the socket file cannot be removed.
    pub fn shutdown(&mut self) -> Result<(), TransportError> {
        self.listener = None;
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(path = %self.socket_path.display(), "Socket removed");
        Ok(())
    }
}

async fn read_loop(
    conn_id: ConnectionId,
    mut read_half: OwnedReadHalf,
    inbound: mpsc::Sender<SurfaceMessage>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 8192];

    'read: loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(conn_id = %conn_id, "Connection closed by peer");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, error = %e, "Read error");
                break;
            }
        };
        decoder.push(&buf[..n]);

        loop {
            match decoder.decode::<SurfaceMessage>() {
                Ok(Some(msg)) => {
                    if inbound.send(msg).await.is_err() {
                        break 'read;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Framing is lost after a bad frame; drop the connection.
                    tracing::warn!(conn_id = %conn_id, error = %e, "Frame decode error");
                    break 'read;
                }
            }
        }
    }
}

async fn write_loop(
    conn_id: ConnectionId,
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<GatewayMessage>,
) {
    while let Some(msg) = outbound.recv().await {
        let frame = match encode(&msg) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, error = %e, "Encode error");
                continue;
            }
        };
        if let Err(e) = write_half.write_all(&frame).await {
            tracing::debug!(conn_id = %conn_id, error = %e, "Write error");
            break;
        }
    }
}

/// Reject peers running as a different user
#[cfg(target_os = "linux")]
fn validate_peer(stream: &UnixStream) -> Result<(), TransportError> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    // SAFETY: `cred` and `len` are valid for writes of the sizes passed, and
    // `fd` is a live socket owned by `stream`.
    let cred = unsafe {
        let mut cred: libc::ucred = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
        let result = libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            std::ptr::addr_of_mut!(cred).cast::<libc::c_void>(),
            &mut len,
        );
        if result < 0 {
            return Err(TransportError::AuthenticationFailed(
                "Failed to get peer credentials".to_string(),
            ));
        }
        cred
    };

    // SAFETY: getuid has no preconditions and cannot fail.
    let my_uid = unsafe { libc::getuid() };
    if cred.uid != my_uid {
        tracing::warn!(peer_uid = cred.uid, my_uid, "Rejecting connection from different user");
        return Err(TransportError::AuthenticationFailed(format!(
            "Peer UID {} does not match server UID {my_uid}",
            cred.uid
        )));
    }

    tracing::debug!(peer_uid = cred.uid, peer_pid = cred.pid, "Peer validated");
    Ok(())
}

/// Non-Linux platforms rely on the socket's filesystem permissions
#[cfg(not(target_os = "linux"))]
fn validate_peer(_stream: &UnixStream) -> Result<(), TransportError> {
    Ok(())
}
