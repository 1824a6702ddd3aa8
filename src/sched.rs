//! Condition-variable primitives over the cooperative scheduler.
//!
//! Blocking is expressed as "suspend the calling thread", not as a busy
//! retry loop, so the natural host for it is a real condition variable
//! paired with the caller's own mutex. `Cv` is a thin, cause-tagged wrapper
//! around `std::sync::Condvar` rather than a reimplementation of blocking.

use std::sync::{Condvar, MutexGuard};
use std::time::{Duration, Instant};

/// Why a thread is suspending, carried purely for trace logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    /// Blocked in `pipe_write` (buffer full) or `pipe_read` (buffer empty).
    Pipe,
    /// Blocked in `Accept`, waiting for a connection request.
    Accept,
    /// Blocked in `Connect`, waiting to be admitted.
    Connect,
    /// Blocked in `ThreadJoin`, waiting for a target thread to exit.
    Join,
}

/// A condition variable, always paired with the `Mutex` guarding the state
/// it is signaled over. Every `wait` call site re-checks its predicate in a
/// loop: spurious wake-ups and state changes during the wait must be
/// tolerated.
pub struct Cv {
    inner: Condvar,
}

impl Cv {
    pub const fn new() -> Self {
        Cv { inner: Condvar::new() }
    }

    /// Suspend the calling thread until signaled. Returns the guard
    /// reacquired on wake-up; the caller is responsible for re-testing its
    /// precondition before calling `wait` again.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>, cause: Cause) -> MutexGuard<'a, T> {
        log::trace!("suspending calling thread, cause={cause:?}");
        self.inner.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    /// Suspend with a deadline. `None` means unbounded. Returns `(guard,
    /// timed_out)`.
    pub fn timed_wait<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        cause: Cause,
        timeout: Option<Duration>,
    ) -> (MutexGuard<'a, T>, bool) {
        let Some(timeout) = timeout else {
            return (self.wait(guard, cause), false);
        };
        log::trace!("suspending calling thread with timeout={timeout:?}, cause={cause:?}");
        let deadline = Instant::now() + timeout;
        let mut guard = guard;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return (guard, true);
            }
            let (g, wait_result) = self
                .inner
                .wait_timeout(guard, remaining)
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
            if !wait_result.timed_out() {
                return (guard, false);
            }
            if Instant::now() >= deadline {
                return (guard, true);
            }
        }
    }

    /// Wake exactly one waiter.
    pub fn signal(&self) {
        self.inner.notify_one();
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        self.inner.notify_all();
    }
}

impl Default for Cv {
    fn default() -> Self {
        Self::new()
    }
}
