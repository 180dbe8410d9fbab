//! Surface Transport Layer
//!
//! How UI surfaces reach the relay daemon. Messages are the JSON types from
//! [`crate::messages`], framed by [`frame`] and carried over a Unix domain
//! socket.
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::transport::UnixSocketClient;
//! use relay_core::messages::RequestPayload;
//!
//! let mut client = UnixSocketClient::with_default_path();
//! client.connect().await?;
//! let reply = client.request(RequestPayload::new("/api/models")).await?;
//! ```

mod error;
pub mod frame;
pub mod unix_socket;

pub use error::{ConnectionId, TransportError};
pub use frame::{encode, FrameDecoder, MAX_FRAME_SIZE};
pub use unix_socket::{SurfaceConnection, UnixSocketClient, UnixSocketServer};
