//! Backpressure handling for write operations.
//!
//! Tracks frames that were handed to a connection's writer task but not yet
//! written to the socket. Senders reserve a slot before queueing a frame and
//! the writer task releases slots as batches hit the socket.
//!
//! # Configuration
//!
//! - `max_pending`: Maximum number of pending frames (default: 1024)
//! - Timeout: How long to wait when backpressure is active (default: 5s)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Result, WireError};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Default backpressure timeout (how long to wait for space to become available).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between backpressure checks.
const CHECK_INTERVAL: Duration = Duration::from_micros(100);

/// Lock-free pending-frame counter shared between senders and the writer task.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl BackpressureController {
    pub fn new(max_pending: usize) -> Self {
        Self::with_timeout(max_pending, DEFAULT_TIMEOUT)
    }

    /// Create a controller with custom timeout.
    pub fn with_timeout(max_pending: usize, timeout: Duration) -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending,
            timeout,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Reserve a slot without waiting.
    ///
    /// The returned guard releases the slot on drop unless disarmed.
    pub fn try_reserve(&self) -> Result<BackpressureGuard> {
        let reserved = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_pending).then_some(current + 1)
            });
        match reserved {
            Ok(_) => Ok(BackpressureGuard::new(self.clone())),
            Err(_) => Err(WireError::BackpressureTimeout),
        }
    }

    /// Reserve a slot, waiting up to the configured timeout.
    pub async fn reserve(&self) -> Result<BackpressureGuard> {
        let start = Instant::now();
        loop {
            if let Ok(guard) = self.try_reserve() {
                return Ok(guard);
            }
            if start.elapsed() > self.timeout {
                return Err(WireError::BackpressureTimeout);
            }
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    /// Release slots after a batch was written.
    #[inline]
    pub fn release_many(&self, count: usize) {
        self.pending.fetch_sub(count, Ordering::Release);
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

/// Guard that releases a reserved slot on drop.
///
/// Disarm it once the frame is owned by the writer task, which releases
/// the slot itself after writing.
pub struct BackpressureGuard {
    controller: BackpressureController,
    armed: bool,
}

impl BackpressureGuard {
    fn new(controller: BackpressureController) -> Self {
        Self {
            controller,
            armed: true,
        }
    }

    /// Hand the slot over to the writer task.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for BackpressureGuard {
    fn drop(&mut self) {
        if self.armed {
            self.controller.release_many(1);
        }
    }
}
