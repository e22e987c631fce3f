//! Server and client configuration.
//!
//! Every struct has working defaults and can be loaded from JSON; missing
//! fields keep their default. Durations are human-readable strings.
//!
//! ```json
//! {
//!   "bind_addr": "0.0.0.0:9000",
//!   "heartbeat": { "writer_idle": "4s", "max_missed": 3 },
//!   "shutdown_grace": "2s"
//! }
//! ```
//!
//! Fields left out of a nested `heartbeat` object keep that side's
//! heartbeat defaults.

use std::path::Path;
use std::time::Duration;

use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;

use crate::connection::ConnectionConfig;
use crate::error::{Result, WireError};
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;

pub use crate::heartbeat::HeartbeatConfig;
pub use crate::registry::DuplicatePolicy;
pub use crate::writer::WriterConfig;

/// Default server bind address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8888";

/// Default client target address.
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:8888";

/// Default number of handlers running at once.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 16;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 128;

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time allowed for connections to wind down on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub backlog: u32,
    pub nodelay: bool,
    pub heartbeat: HeartbeatConfig,
    pub writer: WriterConfig,
    pub max_payload_size: u32,
    /// Handlers running at once across all connections.
    pub max_concurrent_handlers: usize,
    pub duplicate_policy: DuplicatePolicy,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            backlog: DEFAULT_BACKLOG,
            nodelay: true,
            heartbeat: HeartbeatConfig::server(),
            writer: WriterConfig::default(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            duplicate_policy: DuplicatePolicy::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        parse_validated(json, Self::validate)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        require(!self.bind_addr.trim().is_empty(), "bind_addr must not be empty")?;
        require(self.backlog > 0, "backlog must be at least 1")?;
        validate_common(
            &self.heartbeat,
            &self.writer,
            self.max_payload_size,
            self.max_concurrent_handlers,
        )
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            heartbeat: self.heartbeat.clone(),
            writer: self.writer.clone(),
            max_payload_size: self.max_payload_size,
        }
    }
}

/// Connector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_addr: String,
    pub nodelay: bool,
    #[serde(deserialize_with = "client_heartbeat")]
    pub heartbeat: HeartbeatConfig,
    pub writer: WriterConfig,
    pub max_payload_size: u32,
    pub max_concurrent_handlers: usize,
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Sent as a `WELCOME` message after every successful connect.
    pub greeting: Option<String>,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            nodelay: true,
            heartbeat: HeartbeatConfig::client(),
            writer: WriterConfig::default(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            greeting: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        parse_validated(json, Self::validate)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        require(
            !self.server_addr.trim().is_empty(),
            "server_addr must not be empty",
        )?;
        require(!self.reconnect_delay.is_zero(), "reconnect_delay must be > 0")?;
        require(!self.connect_timeout.is_zero(), "connect_timeout must be > 0")?;
        validate_common(
            &self.heartbeat,
            &self.writer,
            self.max_payload_size,
            self.max_concurrent_handlers,
        )
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            heartbeat: self.heartbeat.clone(),
            writer: self.writer.clone(),
            max_payload_size: self.max_payload_size,
        }
    }
}

fn parse_validated<T: DeserializeOwned>(json: &str, validate: fn(&T) -> Result<()>) -> Result<T> {
    let config: T = serde_json::from_str(json)?;
    validate(&config)?;
    Ok(config)
}

fn validate_common(
    heartbeat: &HeartbeatConfig,
    writer: &WriterConfig,
    max_payload_size: u32,
    max_concurrent_handlers: usize,
) -> Result<()> {
    require(max_payload_size > 0, "max_payload_size must be > 0")?;
    require(
        max_concurrent_handlers >= 1,
        "max_concurrent_handlers must be at least 1",
    )?;
    require(heartbeat.max_missed >= 1, "heartbeat.max_missed must be at least 1")?;
    require(writer.channel_capacity >= 1, "writer.channel_capacity must be at least 1")?;
    require(
        writer.max_pending_frames >= 1,
        "writer.max_pending_frames must be at least 1",
    )
}

fn require(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(WireError::Config(message.to_string()))
    }
}

/// `heartbeat` object with every field optional.
#[derive(Deserialize)]
struct HeartbeatOverrides {
    #[serde(default, with = "humantime_serde")]
    writer_idle: Option<Duration>,
    #[serde(default)]
    max_missed: Option<u32>,
}

impl HeartbeatOverrides {
    fn apply(self, base: HeartbeatConfig) -> HeartbeatConfig {
        HeartbeatConfig {
            writer_idle: self.writer_idle.unwrap_or(base.writer_idle),
            max_missed: self.max_missed.unwrap_or(base.max_missed),
        }
    }
}

fn client_heartbeat<'de, D>(deserializer: D) -> std::result::Result<HeartbeatConfig, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = HeartbeatOverrides::deserialize(deserializer)?;
    Ok(overrides.apply(HeartbeatConfig::client()))
}
