//! Transport module - TCP listener and connector setup.
//!
//! Framing, heartbeats and dispatch work on any `AsyncRead + AsyncWrite`
//! stream; this module only produces configured TCP sockets.

mod tcp;

pub use tcp::{bind, configure, connect};
