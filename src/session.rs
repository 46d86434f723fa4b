use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::access::AccessType;
use crate::buffer::{SyncBuffer, SyncEvent, SyncOp};
use crate::error::SyncError;
use crate::reservation::{Backoff, Ticket};
use crate::token::{Grant, SyncToken};
use crate::watchdog::Watchdog;
use crate::SyncConfig;

/// Session state machine: `Empty` → `Acquired` (buffers registered) →
/// `Locked` (lock protocol succeeded) → back.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionStatus {
    Empty,
    Acquired,
    Locked,
}

struct Inner {
    /// Insertion order doubles as the lock acquisition order.
    tokens: Vec<Arc<SyncToken>>,
    status: SessionStatus,
}

struct SessionCore {
    name: String,
    config: Arc<SyncConfig>,
    inner: Mutex<Inner>,
    watchdog: Watchdog,
}

/// One atomic multi-buffer transaction.
///
/// A session is owned by one logical caller: buffers are added, the whole
/// group is locked, CPU/DMA work happens, the group is unlocked. The
/// session may then be relocked, extended, or dropped. Dropping a session
/// force-releases anything it still holds.
pub struct SyncSession {
    core: Arc<SessionCore>,
}

impl SyncSession {
    pub fn create(config: &Arc<SyncConfig>, name: impl Into<String>) -> SyncSession {
        SyncSession {
            core: Arc::new(SessionCore {
                name: name.into(),
                config: config.clone(),
                inner: Mutex::new(Inner {
                    tokens: Vec::new(),
                    status: SessionStatus::Empty,
                }),
                watchdog: Watchdog::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn status(&self) -> SessionStatus {
        self.core.lock_inner().status
    }

    pub fn buffer_count(&self) -> usize {
        self.core.lock_inner().tokens.len()
    }

    /// Registers a buffer with the requested access mode.
    ///
    /// The token joins the session's list only; waiter-queue linking is
    /// deferred to lock time. Registering the same buffer twice is
    /// rejected, as locking it twice in one transaction would self-block.
    pub fn add_buffer(&self, buffer: &Arc<SyncBuffer>, access: AccessType) -> Result<(), SyncError> {
        let access = access.validate()?;
        let mut inner = self.core.lock_inner();
        if inner.tokens.iter().any(|t| t.buffer().id() == buffer.id()) {
            return Err(SyncError::InvalidArgument("buffer already registered"));
        }
        inner.tokens.push(SyncToken::new(buffer, access));
        if inner.status == SessionStatus::Empty {
            inner.status = SessionStatus::Acquired;
        }
        self.core.emit(SyncOp::AddBuffer, buffer.id(), access, "");
        Ok(())
    }

    /// Unregisters a buffer, first releasing its reservation if this
    /// session currently holds it.
    pub fn remove_buffer(&self, buffer: &SyncBuffer) -> Result<(), SyncError> {
        let mut inner = self.core.lock_inner();
        let pos = inner
            .tokens
            .iter()
            .position(|t| t.buffer().id() == buffer.id())
            .ok_or(SyncError::NotRegistered)?;
        let tok = inner.tokens.remove(pos);
        Self::drop_token(&tok);
        if inner.tokens.is_empty() {
            inner.status = SessionStatus::Empty;
        }
        self.core.emit(SyncOp::RemoveBuffer, buffer.id(), tok.access(), "");
        Ok(())
    }

    pub fn remove_all(&self) {
        let mut inner = self.core.lock_inner();
        for tok in inner.tokens.drain(..) {
            Self::drop_token(&tok);
            self.core
                .emit(SyncOp::RemoveBuffer, tok.buffer().id(), tok.access(), "");
        }
        inner.status = SessionStatus::Empty;
    }

    /// Explicit form of dropping the session; releases any held
    /// reservations and all buffer references.
    pub fn destroy(self) {}

    fn drop_token(tok: &Arc<SyncToken>) {
        let res = tok.buffer().reservation();
        if tok.grant().is_some() {
            res.unlock_token(tok);
        } else {
            res.dequeue(tok);
        }
    }

    /// Acquires every registered buffer without deadlock and in
    /// first-requested order per buffer. Blocks as needed; contention is
    /// resolved internally and never surfaced.
    pub fn lock(&self) -> Result<(), SyncError> {
        if !self.core.config.is_supported() {
            return Ok(());
        }
        // Snapshot the token list and run the blocking protocol outside
        // the session mutex, so observers can still read status and
        // counts while this call waits. A token added meanwhile simply
        // misses this cycle; it carries no grant and unlock skips it.
        let tokens = {
            let inner = self.core.lock_inner();
            if inner.tokens.is_empty() {
                return Err(SyncError::InvalidArgument("session has no buffers"));
            }
            if inner.status != SessionStatus::Acquired {
                return Err(SyncError::WrongState);
            }
            inner.tokens.clone()
        };
        let ticket = Ticket::next();
        self.core.lock_tokens(&tokens, ticket);
        self.core.lock_inner().status = SessionStatus::Locked;
        let weak = Arc::downgrade(&self.core);
        self.core
            .watchdog
            .arm(self.core.config.watchdog_timeout(), move || {
                if let Some(core) = weak.upgrade() {
                    core.force_recover();
                }
            });
        for tok in &tokens {
            self.core
                .emit(SyncOp::Lock, tok.buffer().id(), tok.access(), "");
        }
        Ok(())
    }

    /// Releases every buffer locked by the last `lock()` call. Buffers
    /// stay registered for relocking.
    pub fn unlock(&self) -> Result<(), SyncError> {
        if !self.core.config.is_supported() {
            return Ok(());
        }
        let mut inner = self.core.lock_inner();
        if inner.status != SessionStatus::Locked {
            return Err(SyncError::WrongState);
        }
        self.core.watchdog.disarm();
        for tok in &inner.tokens {
            // tokens added after the lock call carry no grant; skip them
            if tok.grant().is_none() {
                continue;
            }
            tok.buffer().reservation().unlock_token(tok);
            self.core
                .emit(SyncOp::Unlock, tok.buffer().id(), tok.access(), "");
        }
        inner.status = SessionStatus::Acquired;
        Ok(())
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.core.teardown();
    }
}

impl SessionCore {
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, op: SyncOp, buffer: u64, access: AccessType, detail: &str) {
        self.config.emit(SyncEvent {
            session: &self.name,
            op,
            buffer,
            access,
            detail,
        });
    }

    /// The wound-wait core. One pass acquires tokens in insertion order;
    /// contention against an older holder rolls the pass back in reverse,
    /// takes the contended reservation on the blocking slow path, and
    /// restarts with that token pinned. The ticket is kept across
    /// restarts, so the session ages until it wins.
    fn lock_tokens(&self, tokens: &[Arc<SyncToken>], ticket: Ticket) {
        // Each held entry remembers the access mode recorded before its
        // grant, so a rollback can rewind the coherency history. Shared
        // joins record nothing and carry `None`.
        let mut held: Vec<(Arc<SyncToken>, Option<AccessType>)> = Vec::with_capacity(tokens.len());
        let mut pinned: Option<(Arc<SyncToken>, Option<AccessType>)> = None;
        'attempt: loop {
            for tok in tokens {
                match pinned.take() {
                    Some((p, prev)) if p.id() == tok.id() => {
                        held.push((p, prev));
                        continue;
                    }
                    still => pinned = still,
                }
                let res = tok.buffer().reservation();
                res.enqueue(tok);
                if tok.access().is_read_only() && res.try_shared() {
                    tok.set_grant(Grant::Shared);
                    held.push((tok.clone(), None));
                    continue;
                }
                let attempt = res.excl().acquire(ticket).and_then(|()| {
                    let prev = res.note_exclusive(tok.access());
                    tok.set_grant(Grant::Exclusive);
                    self.wait_for_turn(tok, ticket, prev)
                });
                match attempt {
                    Ok(prev) => held.push((tok.clone(), Some(prev))),
                    Err(Backoff) => {
                        log::debug!(
                            "session {}: wound on buffer {}, backing off",
                            self.name,
                            tok.buffer().id()
                        );
                        for (h, prev) in held.drain(..).rev() {
                            h.buffer().reservation().rollback_grant(&h, prev);
                        }
                        if let Some((p, prev)) = pinned.take() {
                            p.buffer().reservation().rollback_grant(&p, prev);
                        }
                        // Holding nothing now, so waiting out the older
                        // holder cannot form a cycle. A fairness wait may
                        // still lose the buffer to an older session; we
                        // hold nothing then either, so just queue again.
                        let prev = loop {
                            res.excl().acquire_slow(ticket);
                            let prev = res.note_exclusive(tok.access());
                            tok.set_grant(Grant::Exclusive);
                            match self.wait_for_turn(tok, ticket, prev) {
                                Ok(prev) => break prev,
                                Err(Backoff) => {}
                            }
                        };
                        pinned = Some((tok.clone(), Some(prev)));
                        continue 'attempt;
                    }
                }
            }
            return;
        }
    }

    /// Ordering fairness check: sessions queued on this buffer before us
    /// get serviced first, whatever grant order the primitive produced.
    /// We surrender the primitive, park on the earlier token's channel,
    /// and retake the primitive once that token is serviced, dequeued, or
    /// written off as stale.
    ///
    /// Retaking goes through the ticketed path: with earlier reservations
    /// still held, blocking is only safe against a younger holder. An
    /// older holder means the whole pass backs off, same as a wound on
    /// first acquisition. Returns the access mode recorded before our
    /// grant, refreshed across every surrender/retake.
    fn wait_for_turn(
        &self,
        tok: &Arc<SyncToken>,
        ticket: Ticket,
        mut prev: AccessType,
    ) -> Result<AccessType, Backoff> {
        let res = tok.buffer().reservation();
        loop {
            let Some(earlier) = res.earlier_pending(tok) else {
                return Ok(prev);
            };
            if !res.release_for_wait(prev) {
                return Ok(prev);
            }
            earlier.mark_waiting();
            if !earlier.wait_serviced(self.config.wait_timeout()) {
                log::warn!(
                    "session {}: waiter ahead on buffer {} stalled past {:?}, dropping it",
                    self.name,
                    tok.buffer().id(),
                    self.config.wait_timeout()
                );
                res.dequeue(&earlier);
            }
            match res.excl().acquire(ticket) {
                Ok(()) => prev = res.note_exclusive(tok.access()),
                Err(Backoff) => {
                    // an older session took the buffer while we parked
                    tok.take_grant();
                    return Err(Backoff);
                }
            }
        }
    }

    /// Watchdog path: the caller locked and went silent. Force-release
    /// everything, wake whoever is queued behind us, drop all buffer
    /// references and reset to `Empty`. Reaching this is a caller bug.
    fn force_recover(&self) {
        let mut inner = self.lock_inner();
        if inner.status != SessionStatus::Locked {
            return;
        }
        for tok in inner.tokens.drain(..) {
            let res = tok.buffer().reservation();
            if tok.grant().is_some() {
                log::warn!(
                    "session {}: stalled holding buffer {} ({:?}), forcing release",
                    self.name,
                    tok.buffer().id(),
                    tok.access()
                );
                self.emit(SyncOp::Stall, tok.buffer().id(), tok.access(), "forced release");
                res.unlock_token(&tok);
            } else {
                res.dequeue(&tok);
            }
        }
        inner.status = SessionStatus::Empty;
    }

    fn teardown(&self) {
        self.watchdog.disarm();
        let mut inner = self.lock_inner();
        for tok in inner.tokens.drain(..) {
            let res = tok.buffer().reservation();
            if tok.grant().is_some() {
                res.unlock_token(&tok);
            } else {
                res.dequeue(&tok);
            }
        }
        inner.status = SessionStatus::Empty;
    }
}
