use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::access::{AccessType, CpuDirection};
use crate::error::SyncError;
use crate::reservation::Reservation;
use crate::SyncConfig;

/// Cache-coherency collaborator, invoked by the single-buffer variant when
/// an access-mode change crosses the CPU/device visibility boundary.
pub trait BufferOps: Send + Sync {
    /// Make device writes visible to the CPU (invalidate) for `range`.
    fn begin_cpu_access(&self, range: Range<usize>, dir: CpuDirection) -> Result<(), SyncError>;
    /// Make CPU writes visible to the device (clean/flush) for `range`.
    fn end_cpu_access(&self, range: Range<usize>, dir: CpuDirection) -> Result<(), SyncError>;
}

/// Fire-and-forget observability hook; implementations must not block and
/// cannot fail the caller.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &SyncEvent<'_>);
}

pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _event: &SyncEvent<'_>) {}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncOp {
    AddBuffer,
    RemoveBuffer,
    Lock,
    Unlock,
    LockOne,
    UnlockOne,
    Stall,
}

#[derive(Debug)]
pub struct SyncEvent<'a> {
    pub session: &'a str,
    pub op: SyncOp,
    pub buffer: u64,
    pub access: AccessType,
    pub detail: &'a str,
}

/// Point-in-time view of a reservation, see [`SyncBuffer::state`].
#[derive(Clone, Copy, Debug)]
pub struct BufferState {
    pub accessed_type: AccessType,
    pub locked: bool,
    pub shared_cnt: u32,
}

/// A shared memory buffer and its reservation.
///
/// The reservation is owned by the buffer and outlives any session that
/// touches it; sessions and single-buffer lockers keep the buffer alive
/// by holding `Arc` clones through their tokens.
pub struct SyncBuffer {
    id: u64,
    name: String,
    size: usize,
    config: Arc<SyncConfig>,
    ops: Option<Arc<dyn BufferOps>>,
    reservation: Reservation,
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

impl SyncBuffer {
    pub fn new(config: &Arc<SyncConfig>, name: impl Into<String>, size: usize) -> Arc<Self> {
        Self::build(config, name, size, None)
    }

    pub fn with_ops(
        config: &Arc<SyncConfig>,
        name: impl Into<String>,
        size: usize,
        ops: Arc<dyn BufferOps>,
    ) -> Arc<Self> {
        Self::build(config, name, size, Some(ops))
    }

    fn build(
        config: &Arc<SyncConfig>,
        name: impl Into<String>,
        size: usize,
        ops: Option<Arc<dyn BufferOps>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            size,
            config: config.clone(),
            ops,
            reservation: Reservation::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Current `{accessed_type, locked, shared_cnt}` snapshot.
    pub fn state(&self) -> BufferState {
        self.reservation.snapshot()
    }

    /// Blocks until the buffer transitions to unlocked; `false` on timeout.
    pub fn wait_unlocked(&self, timeout: Duration) -> bool {
        self.reservation.wait_unlocked(timeout)
    }

    pub(crate) fn config(&self) -> &Arc<SyncConfig> {
        &self.config
    }

    pub(crate) fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    pub(crate) fn begin_cpu_access(&self, dir: CpuDirection) -> Result<(), SyncError> {
        match &self.ops {
            Some(ops) => ops.begin_cpu_access(0..self.size, dir),
            None => Ok(()),
        }
    }

    pub(crate) fn end_cpu_access(&self, dir: CpuDirection) -> Result<(), SyncError> {
        match &self.ops {
            Some(ops) => ops.end_cpu_access(0..self.size, dir),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_buffer_state() {
        let cfg = SyncConfig::new(true);
        let buf = SyncBuffer::new(&cfg, "fb", 4096);
        let st = buf.state();
        assert!(st.accessed_type.is_empty());
        assert!(!st.locked);
        assert_eq!(st.shared_cnt, 0);
    }

    #[test]
    fn buffer_ids_are_unique() {
        let cfg = SyncConfig::new(true);
        let a = SyncBuffer::new(&cfg, "a", 16);
        let b = SyncBuffer::new(&cfg, "b", 16);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn wait_unlocked_is_immediate_when_free() {
        let cfg = SyncConfig::new(true);
        let buf = SyncBuffer::new(&cfg, "free", 16);
        assert!(buf.wait_unlocked(Duration::from_millis(10)));
    }
}
