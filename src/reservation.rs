use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::access::AccessType;
use crate::buffer::BufferState;
use crate::token::SyncToken;

/// Acquisition stamp for one lock attempt; lower is older.
///
/// Comparable across all sessions so contending holders can decide who
/// backs off. A session keeps its ticket across internal restarts of the
/// same `lock()` call, which is what guarantees it eventually becomes the
/// oldest contender and makes progress.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) struct Ticket(u64);

static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

impl Ticket {
    pub(crate) fn next() -> Ticket {
        Ticket(NEXT_TICKET.fetch_add(1, Ordering::Relaxed))
    }
}

/// Returned by `TicketLock::acquire` when the holder is older than the
/// caller: the caller must roll back and take the slow path. Internal
/// only, never surfaced.
pub(crate) struct Backoff;

/// The per-reservation exclusive primitive, wait-die flavored.
///
/// Unlike a plain mutex it may be released from any thread: the last
/// reader of a shared group releases a lock the first reader took.
pub(crate) struct TicketLock {
    holder: Mutex<Option<Ticket>>,
    lifted: Condvar,
}

impl TicketLock {
    fn new() -> Self {
        Self {
            holder: Mutex::new(None),
            lifted: Condvar::new(),
        }
    }

    fn lock_holder(&self) -> MutexGuard<'_, Option<Ticket>> {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ticketed acquisition. Blocks while the holder is younger than the
    /// caller; errors with a backoff hint when the holder is older, since
    /// waiting on an older ticket out of order is how cycles form.
    pub(crate) fn acquire(&self, ticket: Ticket) -> Result<(), Backoff> {
        let mut holder = self.lock_holder();
        loop {
            match *holder {
                None => {
                    *holder = Some(ticket);
                    return Ok(());
                }
                Some(cur) if cur < ticket => return Err(Backoff),
                Some(_) => {
                    holder = self
                        .lifted
                        .wait(holder)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Unconditional blocking acquisition, used once the caller holds
    /// nothing else and can safely cooperate with the current holder.
    pub(crate) fn acquire_slow(&self, ticket: Ticket) {
        let mut holder = self.lock_holder();
        while holder.is_some() {
            holder = self
                .lifted
                .wait(holder)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *holder = Some(ticket);
    }

    pub(crate) fn try_acquire(&self, ticket: Ticket) -> bool {
        let mut holder = self.lock_holder();
        if holder.is_some() {
            return false;
        }
        *holder = Some(ticket);
        true
    }

    pub(crate) fn release(&self) {
        let mut holder = self.lock_holder();
        *holder = None;
        self.lifted.notify_all();
    }
}

struct Meta {
    /// Most recently granted access mode; empty until any access occurs.
    accessed: AccessType,
    /// True while the exclusive primitive is held on behalf of a grant.
    locked: bool,
    /// Poll notification raised on unlock, consumed by pollers.
    poll_pending: bool,
    /// Insertion-ordered pending interest, the fairness ground truth.
    waiters: VecDeque<Arc<SyncToken>>,
}

/// Per-buffer record of current access state and pending interest.
///
/// Metadata lives under its own light mutex, distinct from the exclusive
/// primitive, so waiter bookkeeping stays reachable while the primitive
/// is contended.
pub(crate) struct Reservation {
    excl: TicketLock,
    /// Concurrent read-only holders beyond the first. The first reader
    /// holds `excl` like a writer; the group keeps it until the last
    /// reader leaves.
    shared_cnt: AtomicU32,
    meta: Mutex<Meta>,
    unlocked: Condvar,
}

impl Reservation {
    pub(crate) fn new() -> Self {
        Self {
            excl: TicketLock::new(),
            shared_cnt: AtomicU32::new(0),
            meta: Mutex::new(Meta {
                accessed: AccessType::empty(),
                locked: false,
                poll_pending: false,
                waiters: VecDeque::new(),
            }),
            unlocked: Condvar::new(),
        }
    }

    fn lock_meta(&self) -> MutexGuard<'_, Meta> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn excl(&self) -> &TicketLock {
        &self.excl
    }

    /// Appends the token to the waiter queue unless a previous pass of the
    /// same lock attempt already did, preserving its fairness position.
    pub(crate) fn enqueue(&self, tok: &Arc<SyncToken>) {
        let mut meta = self.lock_meta();
        if tok.mark_enqueued() {
            meta.waiters.push_back(tok.clone());
        }
    }

    pub(crate) fn dequeue(&self, tok: &SyncToken) {
        let mut meta = self.lock_meta();
        if let Some(pos) = meta.waiters.iter().position(|t| t.id() == tok.id()) {
            let _ = meta.waiters.remove(pos);
        }
        tok.mark_dequeued();
    }

    /// Read-read fast path: joins a currently locked read-only holder
    /// group without touching the exclusive primitive.
    pub(crate) fn try_shared(&self) -> bool {
        let meta = self.lock_meta();
        if meta.locked && meta.accessed.is_read_only() {
            self.shared_cnt.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Records an exclusive grant; returns the previously recorded access
    /// mode for the cache-coherency transition check.
    pub(crate) fn note_exclusive(&self, access: AccessType) -> AccessType {
        let mut meta = self.lock_meta();
        let prev = meta.accessed;
        meta.locked = true;
        meta.accessed = access;
        prev
    }

    /// Rewinds the recorded access mode after an aborted grant. Only
    /// meaningful while the caller still holds the exclusive primitive,
    /// before the abort releases it.
    pub(crate) fn restore_accessed(&self, prev: AccessType) {
        self.lock_meta().accessed = prev;
    }

    /// Surrenders the primitive for a fairness wait, unless read-only
    /// joiners already share this grant: breaking up an active reader
    /// group would let a writer in beside its readers. Clearing `locked`
    /// under the metadata lock also keeps new joiners out while the
    /// caller is parked. The recorded access mode is rewound to `prev`,
    /// since the surrendered grant never completed.
    pub(crate) fn release_for_wait(&self, prev: AccessType) -> bool {
        let mut meta = self.lock_meta();
        if self.shared_cnt.load(Ordering::SeqCst) > 0 {
            return false;
        }
        meta.accessed = prev;
        meta.locked = false;
        drop(meta);
        self.excl.release();
        true
    }

    /// First token queued ahead of `tok` whose turn has not completed.
    /// `None` once nothing precedes it, or if `tok` itself was forcibly
    /// dropped from the queue.
    pub(crate) fn earlier_pending(&self, tok: &SyncToken) -> Option<Arc<SyncToken>> {
        let meta = self.lock_meta();
        let mut found_self = false;
        let mut earlier = None;
        for t in &meta.waiters {
            if t.id() == tok.id() {
                found_self = true;
                break;
            }
            if earlier.is_none() && t.is_pending() {
                earlier = Some(t.clone());
            }
        }
        if found_self {
            earlier
        } else {
            None
        }
    }

    fn dec_shared_if_positive(&self) -> bool {
        self.shared_cnt
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }

    /// The per-token half of the unlock protocol, shared by session
    /// unlock, rollback, watchdog recovery and the single-buffer variant:
    /// raise the poll notification, wake the oldest waiting token so a
    /// blocked fairness wait can proceed, unlink this token, then either
    /// shed one shared holder or release the exclusive primitive.
    pub(crate) fn unlock_token(&self, tok: &SyncToken) {
        let mut meta = self.lock_meta();
        meta.poll_pending = true;
        if let Some(oldest) = meta.waiters.iter().find(|t| t.is_waiting_pending()) {
            oldest.mark_serviced();
        }
        if let Some(pos) = meta.waiters.iter().position(|t| t.id() == tok.id()) {
            let _ = meta.waiters.remove(pos);
        }
        tok.mark_dequeued();
        let release_excl = match tok.take_grant() {
            None => false,
            // The reader group holds the primitive collectively; only the
            // last departure actually releases it.
            Some(_) => !self.dec_shared_if_positive(),
        };
        if release_excl {
            meta.locked = false;
        }
        self.unlocked.notify_all();
        drop(meta);
        if release_excl {
            self.excl.release();
        }
    }

    /// Undoes a grant taken earlier in a failed lock pass without touching
    /// the waiter queue, so the token keeps its fairness position for the
    /// retry. `prev` carries the access mode recorded before the grant;
    /// exclusive rollbacks rewind to it so an aborted pass never alters
    /// the coherency history.
    pub(crate) fn rollback_grant(&self, tok: &SyncToken, prev: Option<AccessType>) {
        if tok.take_grant().is_none() {
            return;
        }
        if self.dec_shared_if_positive() {
            return;
        }
        let mut meta = self.lock_meta();
        if let Some(prev) = prev {
            meta.accessed = prev;
        }
        meta.locked = false;
        drop(meta);
        self.excl.release();
    }

    /// Resolves an unqualified single-buffer unlock to the caller's token.
    pub(crate) fn find_thread_token(&self, owner: ThreadId) -> Option<Arc<SyncToken>> {
        let meta = self.lock_meta();
        meta.waiters
            .iter()
            .find(|t| t.owner() == Some(owner) && t.grant().is_some())
            .cloned()
    }

    pub(crate) fn snapshot(&self) -> BufferState {
        let meta = self.lock_meta();
        BufferState {
            accessed_type: meta.accessed,
            locked: meta.locked,
            shared_cnt: self.shared_cnt.load(Ordering::SeqCst),
        }
    }

    /// Blocks until the reservation transitions to unlocked, consuming the
    /// poll notification. Returns `false` on timeout.
    pub(crate) fn wait_unlocked(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut meta = self.lock_meta();
        while meta.locked {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            meta = self
                .unlocked
                .wait_timeout(meta, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        meta.poll_pending = false;
        true
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.lock_meta().waiters.len()
    }
}
