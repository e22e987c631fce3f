//! Per-connection liveness state machine.
//!
//! Both ends run the same logic:
//!
//! - When nothing has been written for `writer_idle`, send a
//!   `HEARTBEAT_REQUEST` and count it as missed. Once the count exceeds
//!   `max_missed` the connection is closed.
//! - An inbound `HEARTBEAT_RESPONSE` resets the count.
//! - An inbound `HEARTBEAT_REQUEST` is answered right away.
//!
//! Heartbeat traffic is consumed here and never reaches dispatch.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Notify;

use crate::error::{Result, WireError};
use crate::protocol::{Message, MessageType};
use crate::writer::{OutboundFrame, WriterHandle};

/// Default write-idle window on the server side.
pub const DEFAULT_SERVER_WRITER_IDLE: Duration = Duration::from_secs(4);

/// Default write-idle window on the client side.
pub const DEFAULT_CLIENT_WRITER_IDLE: Duration = Duration::from_secs(30);

/// Default number of unanswered probes tolerated before closing.
pub const DEFAULT_MAX_MISSED: u32 = 3;

/// Heartbeat settings for one side of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Write-idle window after which a probe is sent. Zero disables probing;
    /// inbound probes are still answered.
    #[serde(with = "humantime_serde")]
    pub writer_idle: Duration,
    /// Unanswered probes tolerated; one more closes the connection.
    pub max_missed: u32,
}

impl HeartbeatConfig {
    pub fn server() -> Self {
        Self {
            writer_idle: DEFAULT_SERVER_WRITER_IDLE,
            max_missed: DEFAULT_MAX_MISSED,
        }
    }

    pub fn client() -> Self {
        Self {
            writer_idle: DEFAULT_CLIENT_WRITER_IDLE,
            max_missed: DEFAULT_MAX_MISSED,
        }
    }

    /// Whether idle probing is enabled.
    pub fn probes_enabled(&self) -> bool {
        !self.writer_idle.is_zero()
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::server()
    }
}

/// Liveness state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// Connection considered live; `missed` consecutive probes unanswered.
    Alive { missed: u32 },
    /// Too many probes went unanswered; the connection is being closed.
    Closing,
}

/// What to do after the write-idle timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    /// Send a probe and keep going.
    Probe,
    /// Send a probe, then close the connection.
    ProbeAndClose { missed: u32 },
    /// Already closing; do nothing.
    Ignore,
}

/// Outcome of feeding an inbound message through the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Heartbeat traffic, fully handled.
    Consumed,
    /// Heartbeat probe from the peer; send this reply.
    Reply(Message),
    /// Not heartbeat traffic; pass on to dispatch.
    Forward,
}

/// Heartbeat state machine for a single connection.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: Mutex<HeartbeatState>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HeartbeatState::Alive { missed: 0 }),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub fn state(&self) -> HeartbeatState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consecutive unanswered probes.
    pub fn missed(&self) -> u32 {
        match self.state() {
            HeartbeatState::Alive { missed } => missed,
            HeartbeatState::Closing => self.config.max_missed + 1,
        }
    }

    /// Write-idle timer fired.
    pub fn on_write_idle(&self) -> IdleAction {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            HeartbeatState::Alive { missed } => {
                let missed = missed + 1;
                if missed > self.config.max_missed {
                    *state = HeartbeatState::Closing;
                    IdleAction::ProbeAndClose { missed }
                } else {
                    *state = HeartbeatState::Alive { missed };
                    IdleAction::Probe
                }
            }
            HeartbeatState::Closing => IdleAction::Ignore,
        }
    }

    /// Classify an inbound message type, updating state for responses.
    pub fn on_inbound(&self, kind: MessageType) -> Inbound {
        match kind {
            MessageType::HeartbeatResponse => {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if let HeartbeatState::Alive { .. } = *state {
                    *state = HeartbeatState::Alive { missed: 0 };
                }
                Inbound::Consumed
            }
            MessageType::HeartbeatRequest => Inbound::Reply(Message::heartbeat_response()),
            _ => Inbound::Forward,
        }
    }

    /// Probe the peer whenever `writer_idle` passes without a write.
    ///
    /// `activity` must be notified after every successful socket write; each
    /// notification restarts the idle window. Returns
    /// `Err(HeartbeatTimeout)` once the peer missed too many probes and
    /// never returns if probing is disabled.
    pub(crate) async fn run_idle_loop(&self, writer: &WriterHandle, activity: &Notify) -> Result<()> {
        if !self.config.probes_enabled() {
            std::future::pending::<()>().await;
        }

        loop {
            tokio::select! {
                _ = activity.notified() => continue,
                _ = tokio::time::sleep(self.config.writer_idle) => {}
            }

            let action = self.on_write_idle();
            if action == IdleAction::Ignore {
                continue;
            }

            let probe = OutboundFrame::from_message(&Message::heartbeat_request())?;
            writer.send(probe).await?;
            tracing::debug!(missed = self.missed(), "sent heartbeat probe");

            if let IdleAction::ProbeAndClose { missed } = action {
                tracing::warn!(missed, "heartbeat timeout, closing connection");
                return Err(WireError::HeartbeatTimeout { missed });
            }
        }
    }
}
