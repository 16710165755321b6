//! Condition variable paired with [`TrackedMutex`] (section 4.13).
//!
//! `wait` is a cancellation point and reports the mutex as released for the
//! duration of the park and reacquired on wake, so the lock accountant's
//! view of the lock stack stays accurate across the wait. Rather than
//! registering itself somewhere `kill`/`cancel` can reach to force a
//! specific condvar's waiters awake, a waiter polls in short slices and
//! checks for a delivered signal or a pending cancellation between them —
//! the same pattern [`crate::suspend`] and [`crate::block`] use against the
//! element's own wakeup condvar.

use std::time::{Duration, Instant};

use parking_lot::Condvar as PlCondvar;

use crate::cancel::cancellation_point;
use crate::crash;
use crate::element::{LockFrame, LockKind};
use crate::error::{RuntimeError, RuntimeResult};
use crate::lock::{TrackedMutex, TrackedMutexGuard};
use crate::runtime;
use crate::signal::deliver_pending;

/// How often a wait wakes up to check for a delivered signal or pending
/// cancellation even without a `notify`.
const POLL_SLICE: Duration = Duration::from_millis(20);

fn condvar_frame(addr: usize) -> LockFrame {
    LockFrame {
        address: addr,
        kind: LockKind::Mutex,
        file: "condvar::wait",
        line: 0,
    }
}

pub struct TrackedCondvar {
    inner: PlCondvar,
}

impl TrackedCondvar {
    pub const fn new() -> Self {
        TrackedCondvar {
            inner: PlCondvar::new(),
        }
    }

    pub fn notify_one(&self) {
        self.inner.notify_one();
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }

    /// Wait until notified, a signal is delivered, or cancellation is
    /// pending. Never returns `Err`; mirrors `pthread_cond_wait`'s
    /// infallible, unbounded wait.
    pub fn wait<'a, T>(&self, guard: TrackedMutexGuard<'a, T>) -> TrackedMutexGuard<'a, T> {
        self.wait_until(guard, None)
            .expect("an unbounded wait cannot time out")
    }

    /// As [`wait`](Self::wait), but gives up once `deadline` passes.
    pub fn wait_until<'a, T>(
        &self,
        guard: TrackedMutexGuard<'a, T>,
        deadline: Option<Instant>,
    ) -> RuntimeResult<TrackedMutexGuard<'a, T>> {
        let rt = runtime::global();
        let element = guard.owner();
        let addr = guard.address();
        cancellation_point(&element);

        rt.accountant
            .lock_released(&element, addr, crash::in_crash_mode());
        let mut raw = guard.into_raw();

        enum Outcome {
            Notified,
            TimedOut,
            Cancelled,
        }

        let outcome = loop {
            if let Some(d) = deadline
                && Instant::now() >= d
            {
                break Outcome::TimedOut;
            }
            let slice = match deadline {
                Some(d) => POLL_SLICE.min(d.saturating_duration_since(Instant::now())),
                None => POLL_SLICE,
            };
            let timed_out = self.inner.wait_for(&mut raw, slice).timed_out();
            deliver_pending(&element);
            if crate::cancel::is_cancel_pending(&element) {
                break Outcome::Cancelled;
            }
            if !timed_out {
                break Outcome::Notified;
            }
            if deadline.is_none() {
                continue;
            }
        };

        rt.accountant.lock_got(&element, &rt.config, condvar_frame(addr));
        let guard = TrackedMutexGuard::from_raw(raw, element.clone(), addr);

        match outcome {
            Outcome::Notified => Ok(guard),
            Outcome::TimedOut => {
                drop(guard);
                Err(RuntimeError::TimedOut)
            }
            Outcome::Cancelled => {
                // The mutex is reacquired at this point, matching POSIX's
                // guarantee that a cancelled `pthread_cond_wait` leaves
                // cleanup handlers running with the mutex held; unwinding
                // from `cancellation_point` drops `guard`, releasing it.
                cancellation_point(&element);
                unreachable!("cancellation_point always unwinds when cancellation is pending")
            }
        }
    }
}

impl Default for TrackedCondvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn notify_wakes_a_waiter() {
        let mutex = Arc::new(TrackedMutex::new(false));
        let cv = Arc::new(TrackedCondvar::new());

        let m2 = mutex.clone();
        let cv2 = cv.clone();
        let handle = std::thread::spawn(move || {
            let mut guard = m2.lock();
            while !*guard {
                guard = cv2.wait(guard);
            }
        });

        std::thread::sleep(Duration::from_millis(30));
        *mutex.lock() = true;
        cv.notify_all();
        handle.join().unwrap();
    }

    #[test]
    fn wait_until_past_deadline_times_out() {
        let mutex = TrackedMutex::new(());
        let cv = TrackedCondvar::new();
        let guard = mutex.lock();
        let result = cv.wait_until(guard, Some(Instant::now()));
        assert!(matches!(result, Err(RuntimeError::TimedOut)));
    }
}
