//! Message type tags.
//!
//! ```text
//! 0 WELCOME                  5 FILE_TO_SERVER_REQUEST
//! 1 HEARTBEAT_REQUEST        6 FILE_TO_SERVER_RESPONSE
//! 2 HEARTBEAT_RESPONSE       7 FILE_TO_CLIENT_REQUEST
//! 3 BUSINESS_REQUEST         8 FILE_TO_CLIENT_RESPONSE
//! 4 BUSINESS_RESPONSE
//! ```
//!
//! Any other tag decodes to [`MessageType::Unknown`] so that it can be logged
//! and dropped by dispatch rather than failing the connection.

use std::fmt;

/// Type tag carried in the fifth byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Welcome,
    HeartbeatRequest,
    HeartbeatResponse,
    BusinessRequest,
    BusinessResponse,
    FileToServerRequest,
    FileToServerResponse,
    FileToClientRequest,
    FileToClientResponse,
    /// Tag outside the known range.
    Unknown(u8),
}

impl MessageType {
    /// All known (non-`Unknown`) types in tag order.
    pub const KNOWN: [MessageType; 9] = [
        MessageType::Welcome,
        MessageType::HeartbeatRequest,
        MessageType::HeartbeatResponse,
        MessageType::BusinessRequest,
        MessageType::BusinessResponse,
        MessageType::FileToServerRequest,
        MessageType::FileToServerResponse,
        MessageType::FileToClientRequest,
        MessageType::FileToClientResponse,
    ];

    /// Wire tag for this type.
    #[inline]
    pub fn tag(self) -> u8 {
        match self {
            MessageType::Welcome => 0,
            MessageType::HeartbeatRequest => 1,
            MessageType::HeartbeatResponse => 2,
            MessageType::BusinessRequest => 3,
            MessageType::BusinessResponse => 4,
            MessageType::FileToServerRequest => 5,
            MessageType::FileToServerResponse => 6,
            MessageType::FileToClientRequest => 7,
            MessageType::FileToClientResponse => 8,
            MessageType::Unknown(tag) => tag,
        }
    }

    /// Heartbeat control traffic, consumed by the heartbeat monitor.
    #[inline]
    pub fn is_heartbeat(self) -> bool {
        matches!(
            self,
            MessageType::HeartbeatRequest | MessageType::HeartbeatResponse
        )
    }

    /// Anything that is forwarded to business dispatch.
    #[inline]
    pub fn is_business(self) -> bool {
        !self.is_heartbeat()
    }

    #[inline]
    pub fn is_unknown(self) -> bool {
        matches!(self, MessageType::Unknown(_))
    }

    /// Stable upper-snake name, used in logs.
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Welcome => "WELCOME",
            MessageType::HeartbeatRequest => "HEARTBEAT_REQUEST",
            MessageType::HeartbeatResponse => "HEARTBEAT_RESPONSE",
            MessageType::BusinessRequest => "BUSINESS_REQUEST",
            MessageType::BusinessResponse => "BUSINESS_RESPONSE",
            MessageType::FileToServerRequest => "FILE_TO_SERVER_REQUEST",
            MessageType::FileToServerResponse => "FILE_TO_SERVER_RESPONSE",
            MessageType::FileToClientRequest => "FILE_TO_CLIENT_REQUEST",
            MessageType::FileToClientResponse => "FILE_TO_CLIENT_RESPONSE",
            MessageType::Unknown(_) => "UNKNOWN",
        }
    }
}

impl From<u8> for MessageType {
    fn from(tag: u8) -> Self {
        match tag {
            0 => MessageType::Welcome,
            1 => MessageType::HeartbeatRequest,
            2 => MessageType::HeartbeatResponse,
            3 => MessageType::BusinessRequest,
            4 => MessageType::BusinessResponse,
            5 => MessageType::FileToServerRequest,
            6 => MessageType::FileToServerResponse,
            7 => MessageType::FileToClientRequest,
            8 => MessageType::FileToClientResponse,
            other => MessageType::Unknown(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> Self {
        kind.tag()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Unknown(tag) => write!(f, "UNKNOWN({})", tag),
            known => f.write_str(known.name()),
        }
    }
}
