//! Protocol module - wire format, framing, and message types.
//!
//! This module implements the binary protocol shared by client and server:
//! - 5-byte header encoding/decoding (`u32` BE length + `u8` type)
//! - Frame buffer for accumulating partial reads
//! - Message struct with a derived length

mod frame_buffer;
mod message;
mod message_type;
mod wire_format;

pub use frame_buffer::FrameBuffer;
pub use message::Message;
pub use message_type::MessageType;
pub use wire_format::{
    encode_message, Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, LENGTH_FIELD_SIZE, TYPE_SIZE,
};
