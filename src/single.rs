//! Single-buffer variant: a reduced protocol for callers that only ever
//! touch one buffer at a time, e.g. a file-descriptor-scoped lock. One
//! implicit token per call, resolved back to the caller by thread
//! identity on unlock.
//!
//! This is also where cache-coherency domain transitions happen: when the
//! recorded access mode crosses the CPU/device visibility boundary, the
//! buffer's coherency callouts run before the grant is returned.

use std::sync::Arc;
use std::thread;

use crate::access::AccessType;
use crate::buffer::{SyncBuffer, SyncOp};
use crate::error::SyncError;
use crate::reservation::Ticket;
use crate::token::{Grant, SyncToken};

/// Locks one buffer for the calling thread.
///
/// With `blocking = false` this is a try-lock: an already-held
/// reservation yields [`SyncError::WouldBlock`] immediately. Read-only
/// requests may join an existing read-only holder group without blocking
/// either way.
pub fn lock_one(buffer: &Arc<SyncBuffer>, access: AccessType, blocking: bool) -> Result<(), SyncError> {
    let access = access.validate()?;
    if !buffer.config().is_supported() {
        return Ok(());
    }
    let res = buffer.reservation();
    let tok = SyncToken::for_current_thread(buffer, access);
    res.enqueue(&tok);
    if access.is_read_only() && res.try_shared() {
        tok.set_grant(Grant::Shared);
        emit(buffer, SyncOp::LockOne, access);
        return Ok(());
    }
    let ticket = Ticket::next();
    if blocking {
        res.excl().acquire_slow(ticket);
    } else if !res.excl().try_acquire(ticket) {
        res.dequeue(&tok);
        return Err(SyncError::WouldBlock);
    }
    let prev = res.note_exclusive(access);
    tok.set_grant(Grant::Exclusive);
    if let Err(err) = domain_transitions(buffer, prev, access) {
        // the grant never completed: rewind the recorded access mode so
        // a retry still sees the same domain transition
        res.restore_accessed(prev);
        res.unlock_token(&tok);
        return Err(err);
    }
    emit(buffer, SyncOp::LockOne, access);
    Ok(())
}

/// Releases the calling thread's single-buffer lock. The token is found
/// by owner identity, since the caller only knows the buffer.
pub fn unlock_one(buffer: &Arc<SyncBuffer>) -> Result<(), SyncError> {
    if !buffer.config().is_supported() {
        return Ok(());
    }
    let res = buffer.reservation();
    let tok = res
        .find_thread_token(thread::current().id())
        .ok_or(SyncError::NotRegistered)?;
    res.unlock_token(&tok);
    emit(buffer, SyncOp::UnlockOne, tok.access());
    Ok(())
}

/// Runs the coherency callouts required by the access-mode change.
///
/// Device wrote and the CPU is about to read: invalidate first. CPU wrote
/// and a device is about to touch the buffer: clean before handing over.
fn domain_transitions(
    buffer: &Arc<SyncBuffer>,
    prev: AccessType,
    next: AccessType,
) -> Result<(), SyncError> {
    if prev.contains(AccessType::DEVICE_WRITE) && !next.has_device() && next.contains(AccessType::READ)
    {
        buffer.begin_cpu_access(next.cpu_direction())?;
    }
    if prev.contains(AccessType::WRITE) && !prev.has_device() && next.has_device() {
        buffer.end_cpu_access(prev.cpu_direction())?;
    }
    Ok(())
}

fn emit(buffer: &Arc<SyncBuffer>, op: SyncOp, access: AccessType) {
    buffer.config().emit(crate::buffer::SyncEvent {
        session: "(single)",
        op,
        buffer: buffer.id(),
        access,
        detail: "",
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::CpuDirection;
    use crate::buffer::BufferOps;
    use crate::session::SyncSession;
    use crate::SyncConfig;
    use std::ops::Range;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn try_lock_misses_when_held() {
        let cfg = SyncConfig::new(true);
        let buf = SyncBuffer::new(&cfg, "A", 64);
        lock_one(&buf, AccessType::WRITE, false).unwrap();
        assert_eq!(lock_one(&buf, AccessType::WRITE, false), Err(SyncError::WouldBlock));
        unlock_one(&buf).unwrap();
        lock_one(&buf, AccessType::WRITE, false).unwrap();
        unlock_one(&buf).unwrap();
    }

    #[test]
    fn try_read_misses_against_session_writer() {
        let cfg = SyncConfig::new(true);
        let buf = SyncBuffer::new(&cfg, "A", 64);
        let s = SyncSession::create(&cfg, "S");
        s.add_buffer(&buf, AccessType::WRITE).unwrap();
        s.lock().unwrap();
        assert_eq!(lock_one(&buf, AccessType::READ, false), Err(SyncError::WouldBlock));
        s.unlock().unwrap();
        lock_one(&buf, AccessType::READ, false).unwrap();
        unlock_one(&buf).unwrap();
    }

    #[test]
    fn blocking_lock_waits_for_release() {
        let cfg = SyncConfig::new(true);
        let buf = SyncBuffer::new(&cfg, "A", 64);
        lock_one(&buf, AccessType::WRITE, false).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let th = thread::spawn({
            let buf = buf.clone();
            let done = done.clone();
            move || {
                lock_one(&buf, AccessType::WRITE, true).unwrap();
                done.store(true, Ordering::SeqCst);
                unlock_one(&buf).unwrap();
            }
        });
        thread::sleep(Duration::from_millis(150));
        assert!(!done.load(Ordering::SeqCst));
        unlock_one(&buf).unwrap();
        th.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn readers_share_and_unlock_by_identity() {
        let cfg = SyncConfig::new(true);
        let buf = SyncBuffer::new(&cfg, "A", 64);
        lock_one(&buf, AccessType::READ, true).unwrap();
        let th = thread::spawn({
            let buf = buf.clone();
            move || {
                // joins the read group without blocking
                lock_one(&buf, AccessType::READ, false).unwrap();
                thread::sleep(Duration::from_millis(150));
                unlock_one(&buf).unwrap();
            }
        });
        thread::sleep(Duration::from_millis(60));
        assert_eq!(buf.state().shared_cnt, 1);
        unlock_one(&buf).unwrap();
        th.join().unwrap();
        assert!(!buf.state().locked);
    }

    #[test]
    fn unlock_without_lock_is_not_registered() {
        let cfg = SyncConfig::new(true);
        let buf = SyncBuffer::new(&cfg, "A", 64);
        assert_eq!(unlock_one(&buf), Err(SyncError::NotRegistered));
    }

    #[test]
    fn unlock_resolves_the_calling_thread_only() {
        let cfg = SyncConfig::new(true);
        let buf = SyncBuffer::new(&cfg, "A", 64);
        lock_one(&buf, AccessType::WRITE, false).unwrap();
        let th = thread::spawn({
            let buf = buf.clone();
            move || unlock_one(&buf)
        });
        assert_eq!(th.join().unwrap(), Err(SyncError::NotRegistered));
        unlock_one(&buf).unwrap();
    }

    #[derive(Default)]
    struct MockOps(Mutex<Vec<&'static str>>);

    impl BufferOps for MockOps {
        fn begin_cpu_access(&self, _range: Range<usize>, _dir: CpuDirection) -> Result<(), SyncError> {
            self.0.lock().unwrap().push("begin");
            Ok(())
        }
        fn end_cpu_access(&self, _range: Range<usize>, _dir: CpuDirection) -> Result<(), SyncError> {
            self.0.lock().unwrap().push("end");
            Ok(())
        }
    }

    #[test]
    fn coherency_callouts_fire_on_domain_transitions() {
        let cfg = SyncConfig::new(true);
        let ops = Arc::new(MockOps::default());
        let buf = SyncBuffer::with_ops(&cfg, "A", 256, ops.clone());

        // cpu write: nothing to maintain yet
        lock_one(&buf, AccessType::WRITE, false).unwrap();
        unlock_one(&buf).unwrap();
        assert!(ops.0.lock().unwrap().is_empty());

        // cpu write -> device write: clean before handing to the device
        lock_one(&buf, AccessType::DEVICE_WRITE, false).unwrap();
        unlock_one(&buf).unwrap();
        assert_eq!(*ops.0.lock().unwrap(), vec!["end"]);

        // device write -> cpu read: invalidate before the CPU reads
        lock_one(&buf, AccessType::READ, false).unwrap();
        unlock_one(&buf).unwrap();
        assert_eq!(*ops.0.lock().unwrap(), vec!["end", "begin"]);
    }

    struct RefusingOps;

    impl BufferOps for RefusingOps {
        fn begin_cpu_access(&self, _range: Range<usize>, _dir: CpuDirection) -> Result<(), SyncError> {
            Err(SyncError::AccessCallout)
        }
        fn end_cpu_access(&self, _range: Range<usize>, _dir: CpuDirection) -> Result<(), SyncError> {
            Err(SyncError::AccessCallout)
        }
    }

    #[test]
    fn failed_callout_rolls_the_grant_back() {
        let cfg = SyncConfig::new(true);
        let buf = SyncBuffer::with_ops(&cfg, "A", 256, Arc::new(RefusingOps));
        lock_one(&buf, AccessType::DEVICE_WRITE, false).unwrap();
        unlock_one(&buf).unwrap();
        assert_eq!(
            lock_one(&buf, AccessType::READ, false),
            Err(SyncError::AccessCallout)
        );
        assert!(!buf.state().locked);
        assert_eq!(buf.reservation().waiter_count(), 0);
        // the aborted grant must not count as a completed CPU read
        assert_eq!(buf.state().accessed_type, AccessType::DEVICE_WRITE);
    }

    struct FlakyOps {
        refuse_next: AtomicBool,
        begins: AtomicUsize,
    }

    impl BufferOps for FlakyOps {
        fn begin_cpu_access(&self, _range: Range<usize>, _dir: CpuDirection) -> Result<(), SyncError> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            if self.refuse_next.swap(false, Ordering::SeqCst) {
                return Err(SyncError::AccessCallout);
            }
            Ok(())
        }
        fn end_cpu_access(&self, _range: Range<usize>, _dir: CpuDirection) -> Result<(), SyncError> {
            Ok(())
        }
    }

    #[test]
    fn retry_after_failed_callout_still_invalidates() {
        let cfg = SyncConfig::new(true);
        let ops = Arc::new(FlakyOps {
            refuse_next: AtomicBool::new(true),
            begins: AtomicUsize::new(0),
        });
        let buf = SyncBuffer::with_ops(&cfg, "A", 256, ops.clone());
        lock_one(&buf, AccessType::DEVICE_WRITE, false).unwrap();
        unlock_one(&buf).unwrap();
        // first CPU read dies in the invalidate callout
        assert_eq!(
            lock_one(&buf, AccessType::READ, false),
            Err(SyncError::AccessCallout)
        );
        assert_eq!(buf.state().accessed_type, AccessType::DEVICE_WRITE);
        // the retry still crosses device -> CPU, so the invalidate reruns
        lock_one(&buf, AccessType::READ, false).unwrap();
        assert_eq!(ops.begins.load(Ordering::SeqCst), 2);
        unlock_one(&buf).unwrap();
    }

    #[test]
    fn poll_channel_reports_unlock() {
        let cfg = SyncConfig::new(true);
        let buf = SyncBuffer::new(&cfg, "A", 64);
        lock_one(&buf, AccessType::WRITE, false).unwrap();
        let th = thread::spawn({
            let buf = buf.clone();
            move || buf.wait_unlocked(Duration::from_secs(5))
        });
        thread::sleep(Duration::from_millis(100));
        unlock_one(&buf).unwrap();
        assert!(th.join().unwrap());
    }
}
