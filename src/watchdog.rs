use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

struct State {
    epoch: u64,
    armed: bool,
}

struct Shared {
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deferred stall-recovery timer.
///
/// Armed when a lock attempt succeeds, disarmed on unlock. Fires on its
/// own worker thread, never inline with a caller. Re-arming bumps the
/// epoch so a stale worker from a previous cycle cannot fire.
pub(crate) struct Watchdog {
    shared: Arc<Shared>,
}

impl Watchdog {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    epoch: 0,
                    armed: false,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    pub(crate) fn arm(&self, timeout: Duration, on_fire: impl FnOnce() + Send + 'static) {
        let epoch = {
            let mut st = self.shared.lock_state();
            st.epoch += 1;
            st.armed = true;
            st.epoch
        };
        let shared = self.shared.clone();
        thread::spawn(move || {
            let deadline = Instant::now() + timeout;
            let mut st = shared.lock_state();
            while st.epoch == epoch && st.armed {
                let now = Instant::now();
                if now >= deadline {
                    st.armed = false;
                    drop(st);
                    on_fire();
                    return;
                }
                st = shared
                    .changed
                    .wait_timeout(st, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        });
    }

    pub(crate) fn disarm(&self) {
        let mut st = self.shared.lock_state();
        st.armed = false;
        st.epoch += 1;
        self.shared.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_after_timeout() {
        let wd = Watchdog::new();
        let fired = Arc::new(AtomicUsize::new(0));
        wd.arm(Duration::from_millis(50), {
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });
        thread::sleep(Duration::from_millis(250));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disarm_prevents_firing() {
        let wd = Watchdog::new();
        let fired = Arc::new(AtomicUsize::new(0));
        wd.arm(Duration::from_millis(100), {
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });
        thread::sleep(Duration::from_millis(20));
        wd.disarm();
        thread::sleep(Duration::from_millis(250));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rearm_supersedes_previous_cycle() {
        let wd = Watchdog::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            wd.arm(Duration::from_millis(50), {
                let fired = fired.clone();
                move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }
            });
            wd.disarm();
        }
        wd.arm(Duration::from_millis(50), {
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });
        thread::sleep(Duration::from_millis(250));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
