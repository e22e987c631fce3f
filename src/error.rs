//! Error types for wirelink.

use thiserror::Error;

use crate::client_id::ClientId;

/// Main error type for all wirelink operations.
#[derive(Debug, Error)]
pub enum WireError {
    /// I/O error on a socket or config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed frame on the wire.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame length field exceeds the configured maximum.
    #[error("Frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: u64, max: u64 },

    /// The connection is closed (locally, by the peer, or after an error).
    #[error("Connection closed")]
    ConnectionClosed,

    /// The client connector has no live connection.
    #[error("Not connected")]
    NotConnected,

    /// No live connection is registered under this client id.
    #[error("Unknown client: {0}")]
    UnknownClient(ClientId),

    /// A connection is already registered under this client id.
    #[error("Client id already registered: {0}")]
    DuplicateClient(ClientId),

    /// Too many consecutive heartbeat probes went unanswered.
    #[error("Heartbeat timeout after {missed} unanswered probes")]
    HeartbeatTimeout { missed: u32 },

    /// Backpressure timeout - outbound queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// A message handler failed or panicked.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The server or client is shutting down.
    #[error("Shutting down")]
    Shutdown,
}

impl WireError {
    /// Whether this error must tear down the connection it occurred on.
    ///
    /// Caller-side errors such as an unknown client or backpressure leave
    /// the connection alone.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            WireError::Io(_)
                | WireError::Protocol(_)
                | WireError::FrameTooLarge { .. }
                | WireError::ConnectionClosed
                | WireError::HeartbeatTimeout { .. }
                | WireError::Handler(_)
        )
    }
}

/// Result type alias using WireError.
pub type Result<T> = std::result::Result<T, WireError>;
