//! Advisory block/unblock (section 4.6): a generic "wait for an external
//! event" primitive used by higher layers (suspension, the harness, a host
//! daemon's own event loop) instead of each inventing its own wait/notify
//! pairing.
//!
//! The main thread is a special case: nothing can rescue it if it blocks
//! forever, so an indefinite [`block`] call on the main element is silently
//! bounded by [`RuntimeConfig::main_thread_block_timeout`] and a timeout
//! there is treated as fatal rather than returned to the caller.

use std::time::Instant;

use crate::config::RuntimeConfig;
use crate::diagnostics;
use crate::element::{SmallId, ThreadElement};
use crate::error::{RuntimeError, RuntimeResult};
use crate::registry::Registry;

/// A snapshot taken by [`block_prepare`] that lets [`block`]/[`timed_block`]
/// tell an already-delivered wakeup from one that arrives later, closing the
/// prepare/block race.
pub struct Events {
    generation: u64,
}

impl Events {
    /// Expose the snapshot as a plain integer so an ABI boundary can round-trip
    /// it through an opaque caller-side handle without reaching into this
    /// module's internals.
    pub fn raw(&self) -> u64 {
        self.generation
    }

    /// Reconstruct an `Events` snapshot from a value previously returned by
    /// [`Events::raw`].
    pub fn from_raw(generation: u64) -> Self {
        Events { generation }
    }
}

/// Snapshot the element's current unblock generation. Call this *before*
/// whatever condition you are about to wait on could become true, so that a
/// concurrent [`unblock`] arriving between the snapshot and the subsequent
/// [`block`] call is not lost.
pub fn block_prepare(element: &ThreadElement) -> Events {
    let state = element.state.lock();
    Events {
        generation: state.unblock_events,
    }
}

/// Block until `unblock` is called against this element, or (for the main
/// thread only) the watchdog timeout elapses.
///
/// On every wake, before re-checking the unblock condition, dispatches any
/// signal delivered while parked here (section 4.6 step 6) and checks for a
/// pending cancellation (section 4.7): `block` is itself a cancellation
/// point, and `cancel` wakes a blocked target the same way `unblock` does.
pub fn block(element: &ThreadElement, config: &RuntimeConfig, events: Events) {
    if element.is_main() {
        let deadline = Instant::now() + config.main_thread_block_timeout;
        if timed_block(element, events, deadline).is_err() {
            diagnostics::fatal(
                "main_thread_block_watchdog",
                Some(element.small_id),
                format!(
                    "main thread blocked past its configured watchdog timeout of {:?}",
                    config.main_thread_block_timeout
                ),
            );
        }
        return;
    }
    element.state.lock().blocked = true;
    loop {
        crate::cancel::cancellation_point(element);
        let signalled = {
            let mut state = element.state.lock();
            if state.unblock_events != events.generation || state.unblocked {
                state.blocked = false;
                state.unblocked = false;
                return;
            }
            element.pipe_cv.wait(&mut state);
            if state.signalled > 0 {
                state.signalled -= 1;
                true
            } else {
                false
            }
        };
        if signalled {
            crate::signal::deliver_pending(element);
        }
    }
}

/// Block until `unblock` is called or `deadline` passes, whichever first.
/// Dispatches signals and checks cancellation on each wake, as [`block`]
/// does.
pub fn timed_block(element: &ThreadElement, events: Events, deadline: Instant) -> RuntimeResult<()> {
    element.state.lock().blocked = true;
    loop {
        crate::cancel::cancellation_point(element);
        let signalled = {
            let mut state = element.state.lock();
            if state.unblock_events != events.generation || state.unblocked {
                state.blocked = false;
                state.unblocked = false;
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                state.blocked = false;
                return Err(RuntimeError::TimedOut);
            }
            element.pipe_cv.wait_for(&mut state, deadline - now);
            if state.signalled > 0 {
                state.signalled -= 1;
                true
            } else {
                false
            }
        };
        if signalled {
            crate::signal::deliver_pending(element);
        }
    }
}

/// Wake `target` out of a pending or future `block`/`timed_block` call.
/// Idempotent: calling it with nobody currently blocked just advances the
/// generation counter so the next `block` call (paired with a
/// `block_prepare` taken before this call) returns immediately.
pub fn unblock(registry: &Registry, target: SmallId) -> RuntimeResult<()> {
    let el = registry.get(target).ok_or(RuntimeError::NotFound)?;
    {
        let mut state = el.state.lock();
        state.unblock_events += 1;
        state.unblocked = true;
    }
    el.pipe_cv.notify_all();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Cancelable, ThreadKind};
    use std::sync::Arc;
    use std::time::Duration;

    fn elem(registry: &Registry) -> Arc<ThreadElement> {
        let id = registry.reserve_id().unwrap();
        let el = Arc::new(ThreadElement::new(
            id,
            ThreadKind::Discovered,
            std::thread::current().id(),
            Cancelable::No,
            0,
            0,
        ));
        registry.insert(id, el.clone());
        el
    }

    #[test]
    fn unblock_before_block_is_not_lost() {
        let registry = Registry::new(4);
        let config = RuntimeConfig::default();
        let el = elem(&registry);
        let events = block_prepare(&el);
        unblock(&registry, el.small_id).unwrap();
        block(&el, &config, events); // must return immediately, not hang
    }

    #[test]
    fn timed_block_reports_timeout() {
        let registry = Registry::new(4);
        let el = elem(&registry);
        let events = block_prepare(&el);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(matches!(
            timed_block(&el, events, deadline),
            Err(RuntimeError::TimedOut)
        ));
    }

    #[test]
    fn unblock_from_another_thread_wakes_blocker() {
        let registry = Arc::new(Registry::new(4));
        let config = RuntimeConfig::default();
        let el = elem(&registry);
        let events = block_prepare(&el);
        let registry2 = registry.clone();
        let target = el.small_id;
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            unblock(&registry2, target).unwrap();
        });
        block(&el, &config, events);
        handle.join().unwrap();
    }

    #[test]
    fn cancel_wakes_a_thread_parked_in_block() {
        let registry = Arc::new(Registry::new(4));
        let config = RuntimeConfig::default();
        let id = registry.reserve_id().unwrap();
        let el = Arc::new(ThreadElement::new(
            id,
            ThreadKind::Discovered,
            std::thread::current().id(),
            Cancelable::Yes,
            0,
            0,
        ));
        registry.insert(id, el.clone());
        let events = block_prepare(&el);
        let registry2 = registry.clone();
        let target = el.small_id;
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            crate::cancel::cancel(&registry2, target).unwrap();
        });
        let start = Instant::now();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            block(&el, &config, events);
        }));
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .downcast_ref::<crate::cancel::CancelledMarker>()
                .is_some()
        );
        assert!(start.elapsed() < Duration::from_millis(500));
        handle.join().unwrap();
    }

    #[test]
    fn signal_delivered_while_blocked_is_dispatched_before_unblock() {
        use crate::element::SignalHandler;
        use std::sync::atomic::{AtomicU32, Ordering};

        static COUNT: AtomicU32 = AtomicU32::new(0);
        COUNT.store(0, Ordering::SeqCst);
        fn handler(_sig: u32) {
            COUNT.fetch_add(1, Ordering::SeqCst);
        }

        let registry = Arc::new(Registry::new(4));
        let config = RuntimeConfig::default();
        let el = elem(&registry);
        crate::signal::set_handler(&el, 7, SignalHandler::Handler(handler)).unwrap();
        let events = block_prepare(&el);
        let registry2 = registry.clone();
        let target = el.small_id;
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            crate::signal::kill(&registry2, target, 7).unwrap();
            std::thread::sleep(Duration::from_millis(20));
            unblock(&registry2, target).unwrap();
        });
        block(&el, &config, events);
        assert_eq!(COUNT.load(Ordering::SeqCst), 1);
        handle.join().unwrap();
    }
}
