//! Tracked lock primitives (section 4.12): the closed `{spin, mutex, read,
//! write}` set the lock accountant (section 4.4) understands, each backed
//! by `parking_lot` (Design Notes: "model as a tagged variant rather than a
//! virtual hierarchy").
//!
//! Every acquire/release calls into [`crate::runtime::global`]'s
//! [`crate::lock_accountant::LockAccountant`] against the calling thread's
//! element, resolved via [`crate::runtime::Runtime::current_element`]. The
//! lock's own address (`self as *const Self as usize`) is the identity the
//! accountant tracks; callers must not move a tracked lock while any guard
//! borrowed from it is outstanding, which Rust's borrow checker already
//! guarantees for them.

use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex as PlMutex, MutexGuard as PlMutexGuard};
use parking_lot::{RwLock as PlRwLock, RwLockReadGuard as PlReadGuard, RwLockWriteGuard as PlWriteGuard};

use crate::crash;
use crate::element::{LockFrame, LockKind, ThreadElement};
use crate::runtime::{self, Runtime};

fn frame(addr: usize, kind: LockKind, loc: &Location<'static>) -> LockFrame {
    LockFrame {
        address: addr,
        kind,
        file: loc.file(),
        line: loc.line(),
    }
}

/// Best-effort spin-then-acquire used by [`TrackedSpinLock`]: a handful of
/// `try_lock` attempts before falling back to the blocking path, so short
/// critical sections never pay a futex round trip.
const SPIN_ATTEMPTS: u32 = 64;

/// Wraps a `parking_lot::Mutex` and reports every acquire/release to the
/// lock accountant tagged [`LockKind::Spin`]: semantically identical to
/// [`TrackedMutex`], distinguished only for diagnostics (a spinlock holder
/// that blocks for a long time is far more suspicious than a mutex holder
/// doing the same).
pub struct TrackedSpinLock<T> {
    inner: PlMutex<T>,
}

/// Wraps a `parking_lot::Mutex`, reporting acquire/release as
/// [`LockKind::Mutex`].
pub struct TrackedMutex<T> {
    inner: PlMutex<T>,
}

/// Wraps a `parking_lot::RwLock`, reporting acquire/release as
/// [`LockKind::Read`]/[`LockKind::Write`] and upgrade as [`LockKind::Write`]
/// via [`crate::lock_accountant::LockAccountant::lock_changed`].
pub struct TrackedRwLock<T> {
    inner: PlRwLock<T>,
}

fn before_acquire(rt: &Runtime, element: &Arc<ThreadElement>, frame: &LockFrame) {
    if !crash::in_crash_mode() {
        rt.accountant
            .lock_waiting_element(element, &rt.registry, frame.clone());
    }
}

fn after_acquire(rt: &Runtime, element: &Arc<ThreadElement>, frame: LockFrame) {
    rt.accountant.lock_waiting_done(element);
    rt.accountant.lock_got(element, &rt.config, frame);
    // Section 4.4: "if this is the thread's only lock and a suspension is
    // requested, the lock may be transparently ... the thread suspended".
    // We don't release-and-reacquire the lock we just took (the accountant
    // has no way to hand the underlying `parking_lot` guard back out through
    // this call), but parking here at the safe point this single-lock
    // acquire represents still satisfies invariant 5 without adding a
    // suspend-while-holding-a-lock hazard for every other caller.
    if element.state.lock().lock_stack.len() == 1 {
        crate::suspend::check_suspended(element);
    }
}

fn after_release(rt: &Runtime, element: &Arc<ThreadElement>, addr: usize) {
    rt.accountant
        .lock_released(element, addr, crash::in_crash_mode());
    if element.state.lock().lock_stack.is_empty() {
        crate::suspend::check_suspended(element);
    }
}

macro_rules! tracked_guard {
    ($guard_ty:ident, $inner_guard:ty) => {
        pub struct $guard_ty<'a, T> {
            inner: Option<$inner_guard>,
            element: Arc<ThreadElement>,
            addr: usize,
        }

        impl<'a, T> std::ops::Deref for $guard_ty<'a, T> {
            type Target = T;
            fn deref(&self) -> &T {
                self.inner.as_ref().expect("guard dropped twice")
            }
        }

        impl<'a, T> Drop for $guard_ty<'a, T> {
            fn drop(&mut self) {
                if self.inner.take().is_some() {
                    after_release(runtime::global(), &self.element, self.addr);
                }
            }
        }
    };
}

tracked_guard!(TrackedSpinGuard, PlMutexGuard<'a, T>);
tracked_guard!(TrackedMutexGuard, PlMutexGuard<'a, T>);

impl<'a, T> std::ops::DerefMut for TrackedSpinGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().expect("guard dropped twice")
    }
}
impl<'a, T> std::ops::DerefMut for TrackedMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().expect("guard dropped twice")
    }
}

impl<'a, T> TrackedMutexGuard<'a, T> {
    /// The element that currently holds this guard.
    pub(crate) fn owner(&self) -> Arc<ThreadElement> {
        self.element.clone()
    }

    /// The lock's tracked identity (its own address).
    pub(crate) fn address(&self) -> usize {
        self.addr
    }

    /// Consume the guard and hand back the raw `parking_lot` guard. Taking
    /// `inner` first leaves this guard's own `Drop` a no-op (it only reports
    /// a release when `inner` is still `Some`), so the element `Arc` still
    /// drops normally and the accountant isn't double-reported. Used by
    /// [`crate::condvar::TrackedCondvar`], which takes over the
    /// release/reacquire bookkeeping itself around the park.
    pub(crate) fn into_raw(mut self) -> PlMutexGuard<'a, T> {
        self.inner.take().expect("guard dropped twice")
    }

    /// Rebuild a tracked guard from a raw `parking_lot` guard once the
    /// accountant has recorded the reacquire.
    pub(crate) fn from_raw(raw: PlMutexGuard<'a, T>, element: Arc<ThreadElement>, addr: usize) -> Self {
        TrackedMutexGuard {
            inner: Some(raw),
            element,
            addr,
        }
    }
}

impl<T> TrackedSpinLock<T> {
    pub const fn new(value: T) -> Self {
        TrackedSpinLock {
            inner: PlMutex::new(value),
        }
    }

    #[track_caller]
    pub fn lock(&self) -> TrackedSpinGuard<'_, T> {
        let loc = Location::caller();
        let addr = self as *const _ as usize;
        let rt = runtime::global();
        let element = rt.current_element();
        let f = frame(addr, LockKind::Spin, loc);

        let mut guard = None;
        if !crash::in_crash_mode() {
            for _ in 0..SPIN_ATTEMPTS {
                if let Some(g) = self.inner.try_lock() {
                    guard = Some(g);
                    break;
                }
                std::hint::spin_loop();
            }
        }
        let guard = match guard {
            Some(g) => g,
            None => {
                before_acquire(rt, &element, &f);
                self.inner.lock()
            }
        };
        after_acquire(rt, &element, f);
        TrackedSpinGuard {
            inner: Some(guard),
            element,
            addr,
        }
    }
}

impl<T> TrackedMutex<T> {
    pub const fn new(value: T) -> Self {
        TrackedMutex {
            inner: PlMutex::new(value),
        }
    }

    #[track_caller]
    pub fn lock(&self) -> TrackedMutexGuard<'_, T> {
        let loc = Location::caller();
        let addr = self as *const _ as usize;
        let rt = runtime::global();
        let element = rt.current_element();
        let f = frame(addr, LockKind::Mutex, loc);
        if crash::in_crash_mode() {
            let guard = self
                .inner
                .try_lock_for(Duration::from_millis(50))
                .unwrap_or_else(|| {
                    // Crash mode: never block indefinitely on a possibly
                    // wedged mutex. Force the lock by replacing the guard
                    // with a fresh one acquired via `try_lock`, looping
                    // until it succeeds (another crash-mode acquirer must
                    // eventually release).
                    loop {
                        if let Some(g) = self.inner.try_lock() {
                            break g;
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    }
                });
            after_acquire(rt, &element, f);
            return TrackedMutexGuard {
                inner: Some(guard),
                element,
                addr,
            };
        }
        before_acquire(rt, &element, &f);
        let guard = self.inner.lock();
        after_acquire(rt, &element, f);
        TrackedMutexGuard {
            inner: Some(guard),
            element,
            addr,
        }
    }
}

/// Read guard for [`TrackedRwLock`].
pub struct TrackedReadGuard<'a, T> {
    inner: Option<PlReadGuard<'a, T>>,
    element: Arc<ThreadElement>,
    addr: usize,
}

impl<'a, T> std::ops::Deref for TrackedReadGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.inner.as_ref().expect("guard dropped twice")
    }
}

impl<'a, T> Drop for TrackedReadGuard<'a, T> {
    fn drop(&mut self) {
        self.inner.take();
        after_release(runtime::global(), &self.element, self.addr);
    }
}

/// Write guard for [`TrackedRwLock`].
pub struct TrackedWriteGuard<'a, T> {
    inner: Option<PlWriteGuard<'a, T>>,
    element: Arc<ThreadElement>,
    addr: usize,
}

impl<'a, T> std::ops::Deref for TrackedWriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.inner.as_ref().expect("guard dropped twice")
    }
}
impl<'a, T> std::ops::DerefMut for TrackedWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().expect("guard dropped twice")
    }
}

impl<'a, T> Drop for TrackedWriteGuard<'a, T> {
    fn drop(&mut self) {
        self.inner.take();
        after_release(runtime::global(), &self.element, self.addr);
    }
}

impl<T> TrackedRwLock<T> {
    pub const fn new(value: T) -> Self {
        TrackedRwLock {
            inner: PlRwLock::new(value),
        }
    }

    #[track_caller]
    pub fn read(&self) -> TrackedReadGuard<'_, T> {
        let loc = Location::caller();
        let addr = self as *const _ as usize;
        let rt = runtime::global();
        let element = rt.current_element();
        let f = frame(addr, LockKind::Read, loc);
        before_acquire(rt, &element, &f);
        let guard = self.inner.read();
        after_acquire(rt, &element, f);
        TrackedReadGuard {
            inner: Some(guard),
            element,
            addr,
        }
    }

    #[track_caller]
    pub fn write(&self) -> TrackedWriteGuard<'_, T> {
        let loc = Location::caller();
        let addr = self as *const _ as usize;
        let rt = runtime::global();
        let element = rt.current_element();
        let f = frame(addr, LockKind::Write, loc);
        before_acquire(rt, &element, &f);
        let guard = self.inner.write();
        after_acquire(rt, &element, f);
        TrackedWriteGuard {
            inner: Some(guard),
            element,
            addr,
        }
    }

    /// Release the read guard and reacquire as a writer, reporting the
    /// transition via `lock_changed` instead of a release/acquire pair
    /// (section 4.4).
    pub fn upgrade<'a>(&'a self, guard: TrackedReadGuard<'a, T>) -> TrackedWriteGuard<'a, T> {
        let TrackedReadGuard {
            inner,
            element,
            addr,
        } = guard;
        drop(inner);
        let write = self.inner.write();
        runtime::global()
            .accountant
            .lock_changed(&element, addr, LockKind::Write);
        TrackedWriteGuard {
            inner: Some(write),
            element,
            addr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_guard_mutates_and_releases() {
        let m = TrackedMutex::new(0i32);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 1);
    }

    #[test]
    fn spinlock_roundtrip() {
        let s = TrackedSpinLock::new(String::from("a"));
        s.lock().push('b');
        assert_eq!(&*s.lock(), "ab");
    }

    #[test]
    fn rwlock_allows_concurrent_reads() {
        let rw = TrackedRwLock::new(5);
        let r1 = rw.read();
        let r2 = rw.read();
        assert_eq!(*r1, 5);
        assert_eq!(*r2, 5);
    }

    #[test]
    fn rwlock_upgrade_changes_kind_not_address() {
        let rw = TrackedRwLock::new(1);
        let r = rw.read();
        let mut w = rw.upgrade(r);
        *w += 1;
        drop(w);
        assert_eq!(*rw.read(), 2);
    }

    #[test]
    fn mutex_acquire_records_lock_stack_frame() {
        let m = TrackedMutex::new(());
        let rt = runtime::global();
        let before = rt.current_element().state.lock().lock_stack.len();
        let g = m.lock();
        let during = rt.current_element().state.lock().lock_stack.len();
        assert_eq!(during, before + 1);
        drop(g);
        let after = rt.current_element().state.lock().lock_stack.len();
        assert_eq!(after, before);
    }
}
