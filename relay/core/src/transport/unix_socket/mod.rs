//! Unix Socket Transport
//!
//! Local IPC between UI surfaces and the relay daemon.
//!
//! # Socket Location
//!
//! Default: `$XDG_RUNTIME_DIR/relay/relay.sock`
//! Fallback: `/tmp/relay-$UID/relay.sock`
//!
//! # Security
//!
//! - Socket created with mode 0600 (owner-only access)
//! - Peer UID validated via `SO_PEERCRED` (Linux)
//! - No network exposure
//!
//! ```text
//! ┌──────────────────┐                    ┌──────────────────┐
//! │ Surface (popup)  │                    │   relay-daemon   │
//! │                  │                    │                  │
//! │ UnixSocketClient ├───────────────────►│ UnixSocketServer │
//! │ SurfaceMessage ─►│     relay.sock     │──► Gateway       │
//! │ ◄─ GatewayMessage│                    │◄── replies/events│
//! └──────────────────┘                    └──────────────────┘
//! ```

mod client;
mod server;

pub use client::UnixSocketClient;
pub use server::{SurfaceConnection, UnixSocketServer};

use std::path::PathBuf;

/// Default socket path for the relay daemon
///
/// Uses `XDG_RUNTIME_DIR` when set, otherwise `/tmp/relay-$UID/`.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(runtime_dir) => PathBuf::from(runtime_dir).join("relay").join("relay.sock"),
        None => {
            // SAFETY: getuid has no preconditions and cannot fail.
            let uid = unsafe { libc::getuid() };
            PathBuf::from(format!("/tmp/relay-{uid}/relay.sock"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_socket_path_shape() {
        let path = default_socket_path();
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("relay.sock"));
        assert!(path.to_string_lossy().contains("relay"));
    }
}
