//! Dedicated writer task per connection.
//!
//! Every sender (heartbeat loop, handlers, registry lookups from request
//! code) pushes encoded frames into an mpsc channel; a single task owns the
//! socket write half and drains the channel in batches.
//!
//! # Architecture
//!
//! ```text
//! Heartbeat ─┐
//! Handler   ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► TCP write half
//! Registry  ─┘                                      │
//!                                                   └─► write activity (idle timer rearm)
//! ```
//!
//! The task exits when every handle is dropped, when the connection's close
//! signal fires (an in-flight write is abandoned), or on the first I/O error.

use std::io::IoSlice;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::backpressure::{BackpressureController, DEFAULT_MAX_PENDING, DEFAULT_TIMEOUT};
use crate::error::{Result, WireError};
use crate::protocol::{Header, Message, HEADER_SIZE};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header (5 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (empty for heartbeats).
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Encode a message's header; the payload is shared, not copied.
    pub fn from_message(message: &Message) -> Result<Self> {
        let header = Header::for_payload(message.kind(), message.payload().len())?;
        tracing::debug!(kind = %message.kind(), length = header.length, "encoded frame");
        Ok(Self {
            header: header.encode(),
            payload: message.payload_bytes(),
        })
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    #[serde(with = "humantime_serde")]
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheap to clone; all clones feed the same socket.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    backpressure: BackpressureController,
}

impl WriterHandle {
    /// Queue a frame, waiting while backpressure is active.
    ///
    /// Success means the frame was accepted by the writer queue, not that
    /// the peer received it.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        let guard = tokio::select! {
            reserved = self.backpressure.reserve() => reserved?,
            _ = self.tx.closed() => return Err(WireError::ConnectionClosed),
        };

        self.tx
            .send(frame)
            .await
            .map_err(|_| WireError::ConnectionClosed)?;
        guard.disarm();
        Ok(())
    }

    /// Queue a frame without waiting.
    ///
    /// Returns `Err(BackpressureTimeout)` immediately if at capacity.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        let guard = self.backpressure.try_reserve()?;

        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WireError::BackpressureTimeout,
            mpsc::error::TrySendError::Closed(_) => WireError::ConnectionClosed,
        })?;
        guard.disarm();
        Ok(())
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.backpressure.is_active()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.backpressure.pending_count()
    }

    /// Whether the writer task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// `activity` is notified after every batch reaches the socket; `closed`
/// stops the task as soon as it flips to `true`.
pub fn spawn_writer_task<W>(
    writer: W,
    config: &WriterConfig,
    closed: watch::Receiver<bool>,
    activity: Arc<Notify>,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let backpressure =
        BackpressureController::with_timeout(config.max_pending_frames, config.backpressure_timeout);

    let handle = WriterHandle {
        tx,
        backpressure: backpressure.clone(),
    };
    let task = tokio::spawn(writer_loop(rx, writer, backpressure, closed, activity));

    (handle, task)
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // A dropped sender counts as closed.
    let _ = closed.wait_for(|is_closed| *is_closed).await;
}

/// Main writer loop - receives frames and writes them to the socket.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    backpressure: BackpressureController,
    mut closed: watch::Receiver<bool>,
    activity: Arc<Notify>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => return Ok(()),
            frame = rx.recv() => match frame {
                Some(f) => f,
                None => return Ok(()),
            },
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => return Ok(()),
            written = write_batch(&mut writer, &batch) => written?,
        }

        backpressure.release_many(batch.len());
        activity.notify_one();
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlice array for the bytes after the first `skip_bytes` of the batch.
fn remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [&frame.header[..], &frame.payload[..]] {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}
