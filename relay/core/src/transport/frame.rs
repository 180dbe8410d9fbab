//! Frame Protocol
//!
//! Wire format between surfaces and the relay daemon: length-prefixed JSON
//! with a CRC32 checksum.
//!
//! ```text
//! +----------------+----------------+------------------------------------------+
//! | Length (4)     | Checksum (4)   | JSON Payload (variable)                  |
//! | big-endian u32 | CRC32 BE       | SurfaceMessage or GatewayMessage         |
//! +----------------+----------------+------------------------------------------+
//! ```
//!
//! The length covers the payload only. Lengths above [`MAX_FRAME_SIZE`] are
//! rejected before any payload is buffered.

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};

use super::TransportError;

/// Maximum payload size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Length + checksum
const HEADER_SIZE: usize = 8;

/// Encode a message into one frame
///
/// # Errors
///
/// Returns [`TransportError::SerializationError`] if the message cannot be
/// serialized or exceeds [`MAX_FRAME_SIZE`].
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    let payload =
        serde_json::to_vec(msg).map_err(|e| TransportError::SerializationError(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len as usize <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            TransportError::SerializationError(format!(
                "Frame too large: {} bytes (max: {MAX_FRAME_SIZE})",
                payload.len()
            ))
        })?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.put_u32(len);
    frame.put_u32(crc32fast::hash(&payload));
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Incremental frame decoder
///
/// Feed raw socket reads with [`FrameDecoder::push`], then call
/// [`FrameDecoder::decode`] until it returns `Ok(None)`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next complete frame, if any
    ///
    /// # Errors
    ///
    /// - [`TransportError::SerializationError`] for an oversized length or a
    ///   payload that is not the expected JSON message
    /// - [`TransportError::ChecksumMismatch`] for a corrupted payload
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &self.buffer[..HEADER_SIZE];
        let len = header.get_u32() as usize;
        let expected = header.get_u32();

        if len > MAX_FRAME_SIZE {
            return Err(TransportError::SerializationError(format!(
                "Frame size {len} exceeds maximum {MAX_FRAME_SIZE}"
            )));
        }
        if self.buffer.len() < HEADER_SIZE + len {
            self.buffer.reserve(HEADER_SIZE + len - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(HEADER_SIZE);
        let payload = self.buffer.split_to(len).freeze();

        let actual = crc32fast::hash(&payload);
        if actual != expected {
            return Err(TransportError::ChecksumMismatch { expected, actual });
        }

        serde_json::from_slice(&payload)
            .map(Some)
            .map_err(|e| TransportError::SerializationError(e.to_string()))
    }
}
