//! In-memory representation of one message.
//!
//! A `Message` is a type tag plus a payload. The wire `length` is always
//! derived (`1 + payload.len()`); there is no way to construct a message
//! whose length disagrees with its payload.
//!
//! # Example
//!
//! ```
//! use wirelink::protocol::{Message, MessageType};
//!
//! let msg = Message::new(MessageType::BusinessRequest, "ping");
//! assert_eq!(msg.length(), 5);
//! assert_eq!(msg.payload(), b"ping");
//! ```

use std::borrow::Cow;

use bytes::Bytes;

use super::message_type::MessageType;
use super::wire_format::{HEADER_SIZE, TYPE_SIZE};
use crate::client_id::ClientId;

/// One discrete message exchanged over a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageType,
    payload: Bytes,
}

impl Message {
    /// Create a message with the given type and payload.
    pub fn new(kind: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Create a message with an empty payload.
    pub fn empty(kind: MessageType) -> Self {
        Self {
            kind,
            payload: Bytes::new(),
        }
    }

    /// Liveness probe (empty payload).
    pub fn heartbeat_request() -> Self {
        Self::empty(MessageType::HeartbeatRequest)
    }

    /// Answer to a liveness probe (empty payload).
    pub fn heartbeat_response() -> Self {
        Self::empty(MessageType::HeartbeatResponse)
    }

    /// Welcome message announcing the assigned client id.
    pub fn welcome(client_id: &ClientId) -> Self {
        Self::new(MessageType::Welcome, client_id.welcome_text())
    }

    /// Business request carrying the given payload.
    pub fn business_request(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageType::BusinessRequest, payload)
    }

    #[inline]
    pub fn kind(&self) -> MessageType {
        self.kind
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Cheap clone of the payload.
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Value of the wire length field: type byte plus payload.
    ///
    /// Saturates at `u32::MAX`; oversized payloads are rejected before encoding.
    #[inline]
    pub fn length(&self) -> u32 {
        u32::try_from(TYPE_SIZE + self.payload.len()).unwrap_or(u32::MAX)
    }

    /// Total bytes on the wire, length prefix included.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}
