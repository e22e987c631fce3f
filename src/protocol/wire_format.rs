//! Wire format encoding and decoding.
//!
//! Every frame is a 5-byte header followed by the payload:
//! ```text
//! ┌──────────┬───────┬──────────────┐
//! │ Length   │ Type  │ Payload      │
//! │ 4 bytes  │ 1 byte│ Length-1     │
//! │ uint32 BE│       │ bytes        │
//! └──────────┴───────┴──────────────┘
//! ```
//!
//! `Length` counts everything after itself (type byte + payload), so it is
//! never smaller than 1.

use bytes::{BufMut, Bytes, BytesMut};

use super::message::Message;
use super::message_type::MessageType;
use crate::error::{Result, WireError};

/// Size of the big-endian length prefix.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Size of the type tag.
pub const TYPE_SIZE: usize = 1;

/// Header size in bytes (length prefix + type tag).
pub const HEADER_SIZE: usize = LENGTH_FIELD_SIZE + TYPE_SIZE;

/// Default maximum payload size (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Byte count following the length field (type + payload).
    pub length: u32,
    /// Raw type tag.
    pub tag: u8,
}

impl Header {
    /// Header for a message of the given type and payload length.
    pub fn for_payload(kind: MessageType, payload_len: usize) -> Result<Self> {
        let length = u32::try_from(payload_len + TYPE_SIZE).map_err(|_| {
            WireError::FrameTooLarge {
                length: (payload_len + TYPE_SIZE) as u64,
                max: u32::MAX as u64,
            }
        })?;
        Ok(Self {
            length,
            tag: kind.tag(),
        })
    }

    /// Encode header to bytes (Big Endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..LENGTH_FIELD_SIZE].copy_from_slice(&self.length.to_be_bytes());
        buf[LENGTH_FIELD_SIZE] = self.tag;
        buf
    }

    /// Peek a header from the front of `buf` without consuming anything.
    ///
    /// Returns `None` if fewer than `HEADER_SIZE` bytes are available.
    pub fn peek(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            tag: buf[LENGTH_FIELD_SIZE],
        })
    }

    /// Check the length field against protocol limits.
    ///
    /// A length of 0 cannot hold the type byte; a length above
    /// `max_payload_size + 1` would carry an oversized payload.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.length == 0 {
            return Err(WireError::Protocol(
                "Frame length 0 cannot hold a type byte".to_string(),
            ));
        }
        let max = max_payload_size as u64 + TYPE_SIZE as u64;
        if self.length as u64 > max {
            return Err(WireError::FrameTooLarge {
                length: self.length as u64,
                max,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn kind(&self) -> MessageType {
        MessageType::from(self.tag)
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(TYPE_SIZE)
    }

    /// Total frame size, length prefix included.
    #[inline]
    pub fn frame_len(&self) -> usize {
        LENGTH_FIELD_SIZE + self.length as usize
    }
}

/// Encode a message into a contiguous buffer.
///
/// The length field is computed from the payload; the message is not touched.
pub fn encode_message(message: &Message) -> Result<Bytes> {
    let header = Header::for_payload(message.kind(), message.payload().len())?;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + message.payload().len());
    buf.put_u32(header.length);
    buf.put_u8(header.tag);
    buf.put_slice(message.payload());
    Ok(buf.freeze())
}
