use std::error::Error;
use std::fmt;

/// Errors surfaced to callers.
///
/// Contended-lock outcomes (deadlock backoff, fairness-wait timeout) are
/// retried or recovered internally and never appear here; only programming
/// errors and the non-blocking try-lock miss do.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncError {
    /// Null/empty input, e.g. locking a session with no buffers.
    InvalidArgument(&'static str),
    /// Malformed access-type bitmask.
    InvalidAccess,
    /// The buffer was not found among the session's (or thread's) tokens.
    NotRegistered,
    /// Operation does not match the session's state machine.
    WrongState,
    /// Non-blocking single-buffer lock against an already-held reservation.
    WouldBlock,
    /// A cache-coherency callout refused the domain transition.
    AccessCallout,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            SyncError::InvalidAccess => write!(f, "malformed access-type bitmask"),
            SyncError::NotRegistered => write!(f, "buffer not registered"),
            SyncError::WrongState => write!(f, "operation not valid in current session state"),
            SyncError::WouldBlock => write!(f, "reservation already held"),
            SyncError::AccessCallout => write!(f, "cpu access callout failed"),
        }
    }
}

impl Error for SyncError {}
