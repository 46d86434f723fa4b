use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::access::AccessType;
use crate::buffer::SyncBuffer;

/// How a token currently holds its reservation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Grant {
    /// Joined an existing read-only holder group via `shared_cnt`.
    Shared,
    /// Holds the reservation's exclusive primitive.
    Exclusive,
}

#[derive(Default)]
struct TokenState {
    /// Present in the reservation's waiter queue.
    enqueued: bool,
    /// Some locker is blocked until this token has been serviced.
    waiting: bool,
    /// This token's turn has completed (or was forcibly skipped).
    serviced: bool,
    grant: Option<Grant>,
}

/// The per-(session, buffer) relation record.
///
/// Shared via `Arc` between the owning session's token list and the target
/// reservation's waiter queue, so either side may outlive the other.
pub(crate) struct SyncToken {
    id: u64,
    buffer: Arc<SyncBuffer>,
    access: AccessType,
    /// Requesting execution context; set only by the single-buffer variant,
    /// which must resolve an unqualified unlock back to its token.
    owner: Option<ThreadId>,
    state: Mutex<TokenState>,
    progressed: Condvar,
}

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

impl SyncToken {
    pub(crate) fn new(buffer: &Arc<SyncBuffer>, access: AccessType) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
            buffer: buffer.clone(),
            access,
            owner: None,
            state: Mutex::new(TokenState::default()),
            progressed: Condvar::new(),
        })
    }

    pub(crate) fn for_current_thread(buffer: &Arc<SyncBuffer>, access: AccessType) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
            buffer: buffer.clone(),
            access,
            owner: Some(std::thread::current().id()),
            state: Mutex::new(TokenState::default()),
            progressed: Condvar::new(),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn buffer(&self) -> &Arc<SyncBuffer> {
        &self.buffer
    }

    pub(crate) fn access(&self) -> AccessType {
        self.access
    }

    pub(crate) fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    fn lock_state(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the token as queued for one lock cycle. Returns `false` when
    /// it was already queued (e.g. a restart of the same lock attempt).
    pub(crate) fn mark_enqueued(&self) -> bool {
        let mut st = self.lock_state();
        if st.enqueued {
            return false;
        }
        st.enqueued = true;
        st.waiting = false;
        st.serviced = false;
        true
    }

    /// Unlinks the token from its queue and releases anyone blocked on it.
    pub(crate) fn mark_dequeued(&self) {
        let mut st = self.lock_state();
        st.enqueued = false;
        self.progressed.notify_all();
    }

    pub(crate) fn mark_waiting(&self) {
        self.lock_state().waiting = true;
    }

    pub(crate) fn mark_serviced(&self) {
        let mut st = self.lock_state();
        st.serviced = true;
        self.progressed.notify_all();
    }

    /// Still queued and not yet serviced: a later locker must defer to it.
    pub(crate) fn is_pending(&self) -> bool {
        let st = self.lock_state();
        st.enqueued && !st.serviced
    }

    /// Flagged by a blocked locker and not yet woken; the unlock protocol
    /// services the oldest such token first.
    pub(crate) fn is_waiting_pending(&self) -> bool {
        let st = self.lock_state();
        st.enqueued && st.waiting && !st.serviced
    }

    /// Blocks until the token has been serviced or force-dequeued.
    /// Returns `false` on timeout, leaving the token untouched.
    pub(crate) fn wait_serviced(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.lock_state();
        while st.enqueued && !st.serviced {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            st = self
                .progressed
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    pub(crate) fn set_grant(&self, grant: Grant) {
        self.lock_state().grant = Some(grant);
    }

    pub(crate) fn grant(&self) -> Option<Grant> {
        self.lock_state().grant
    }

    pub(crate) fn take_grant(&self) -> Option<Grant> {
        self.lock_state().grant.take()
    }
}
