//! Multi-buffer access synchronization for memory shared between a CPU
//! and one or more DMA engines.
//!
//! Callers group buffers into a [`SyncSession`], then lock and unlock the
//! whole group atomically. Deadlock between sessions that grab overlapping
//! buffer sets in different orders is avoided with a wound-wait ticket
//! discipline, and per-buffer grant order follows the order in which
//! sessions first expressed interest, not the whims of the underlying
//! primitive. A watchdog force-releases sessions that never unlock.
//!
//! Callers that only ever touch one buffer at a time can skip sessions and
//! use [`lock_one`]/[`unlock_one`] directly.

pub mod access;
pub mod buffer;
pub mod error;
pub mod session;
pub mod single;

mod reservation;
mod token;
mod watchdog;

pub use access::{AccessType, CpuDirection};
pub use buffer::{BufferOps, BufferState, EventSink, NoopSink, SyncBuffer, SyncEvent, SyncOp};
pub use error::SyncError;
pub use session::{SessionStatus, SyncSession};
pub use single::{lock_one, unlock_one};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Construction-time configuration shared by buffers and sessions.
///
/// `enabled` is fixed for the lifetime of the config; the timeouts are
/// runtime-tunable by an operator.
pub struct SyncConfig {
    enabled: bool,
    watchdog_timeout_ms: AtomicU64,
    wait_timeout_ms: AtomicU64,
    sink: Arc<dyn EventSink>,
}

impl SyncConfig {
    /// Watchdog default: a held lock is considered stalled after this long.
    pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(1);
    /// Bound on a single ordering-fairness wait before the stale waiter is
    /// forcibly dropped.
    pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

    pub fn new(enabled: bool) -> Arc<Self> {
        Self::with_sink(enabled, Arc::new(NoopSink))
    }

    pub fn with_sink(enabled: bool, sink: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            enabled,
            watchdog_timeout_ms: AtomicU64::new(Self::DEFAULT_WATCHDOG_TIMEOUT.as_millis() as u64),
            wait_timeout_ms: AtomicU64::new(Self::DEFAULT_WAIT_TIMEOUT.as_millis() as u64),
            sink,
        })
    }

    /// Global feature toggle; when false every lock/unlock is a no-op.
    pub fn is_supported(&self) -> bool {
        self.enabled
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_watchdog_timeout(&self, timeout: Duration) {
        self.watchdog_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_wait_timeout(&self, timeout: Duration) {
        self.wait_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn emit(&self, event: SyncEvent<'_>) {
        log::trace!(
            "{}: {:?} buffer {} access {:?} {}",
            event.session,
            event.op,
            event.buffer,
            event.access,
            event.detail
        );
        self.sink.record(&event);
    }
}
