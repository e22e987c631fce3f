//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy payload extraction. The length
//! prefix is only peeked: nothing is consumed until the whole frame is
//! buffered, so a split frame is never half-spent and trailing bytes are
//! always kept for the next push.
//!
//! # Example
//!
//! ```
//! use wirelink::protocol::{encode_message, FrameBuffer, Message, MessageType};
//!
//! let bytes = encode_message(&Message::business_request("ping")).unwrap();
//! let mut buffer = FrameBuffer::new();
//!
//! assert!(buffer.push(&bytes[..3]).unwrap().is_empty());
//! let messages = buffer.push(&bytes[3..]).unwrap();
//! assert_eq!(messages[0].kind(), MessageType::BusinessRequest);
//! ```

use bytes::{Buf, BytesMut};

use super::message::Message;
use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, LENGTH_FIELD_SIZE, TYPE_SIZE};
use crate::error::Result;

/// Initial buffer capacity.
const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Buffer for accumulating incoming bytes and extracting complete messages.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Maximum allowed payload size.
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default 1 MiB payload limit.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_CAPACITY),
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete messages.
    ///
    /// Partial frames stay buffered for the next push.
    ///
    /// # Errors
    ///
    /// Returns error if a length field is 0 or exceeds the payload limit.
    /// The connection should be closed; the buffer contents are unspecified.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Message>> {
        self.extend(data);

        let mut messages = Vec::new();
        while let Some(message) = self.decode_next()? {
            messages.push(message);
        }
        Ok(messages)
    }

    /// Append bytes without decoding; pair with [`decode_next`](Self::decode_next).
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract a single message from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(message))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on a framing violation
    pub fn decode_next(&mut self) -> Result<Option<Message>> {
        let header = match Header::peek(&self.buffer) {
            Some(h) => h,
            None => return Ok(None),
        };

        header.validate(self.max_payload_size)?;

        if self.buffer.len() - LENGTH_FIELD_SIZE < header.length as usize {
            // Leave the length prefix in place until the body arrives
            self.buffer.reserve(header.frame_len() - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(HEADER_SIZE);
        let payload = self.buffer.split_to(header.length as usize - TYPE_SIZE).freeze();

        let message = Message::new(header.kind(), payload);
        tracing::debug!(
            kind = %message.kind(),
            length = header.length,
            "decoded frame"
        );
        Ok(Some(message))
    }

    /// Number of buffered, not yet decoded bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
