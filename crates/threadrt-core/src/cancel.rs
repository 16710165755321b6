//! Deferred cancellation and the cleanup stack (section 4.7).
//!
//! Cancellation here is always deferred: a pending cancellation only takes
//! effect the next time the target thread reaches a cancellation point
//! while cancellation is enabled. Delivery unwinds the target thread via a
//! sentinel panic that [`crate::thread`]'s trampoline catches and treats as
//! a clean, cancelled exit rather than a reportable panic.

use crate::element::{CancelState, Cancelable, CleanupEntry, SmallId, ThreadElement};
use crate::error::{RuntimeError, RuntimeResult};
use crate::registry::Registry;

/// Panic payload used to unwind a thread that reached a cancellation point
/// with cancellation pending. Never meant to cross a `catch_unwind` boundary
/// other than the one in the thread trampoline.
pub struct CancelledMarker;

/// Toggle whether cancellation delivery is enabled for the calling thread.
/// Returns the previous state. A no-op on a non-cancelable element's
/// bookkeeping still succeeds (the request is simply never delivered,
/// matching `Cancelable::No`'s contract), so callers never need to check
/// `cancelable` before calling this.
pub fn cancel_set_state(element: &ThreadElement, new: CancelState) -> CancelState {
    let mut state = element.state.lock();
    let old = state.cancel_state;
    state.cancel_state = new;
    old
}

/// Request cancellation of `target`. Fails with `Permission` if the target
/// was created with `Cancelable::No` (main thread, discovered threads): the
/// request would otherwise be silently recorded and never delivered, which
/// is more likely to indicate a caller bug than an intended async-cancel.
///
/// Also wakes `target` out of a pending `block`/`timed_block`/`pause`/
/// `sigsuspend`, the same way `crate::block::unblock` does, so a thread
/// parked in one of those calls reaches its next cancellation point
/// immediately rather than waiting out whatever it was blocked on.
pub fn cancel(registry: &Registry, target: SmallId) -> RuntimeResult<()> {
    let el = registry.get(target).ok_or(RuntimeError::NotFound)?;
    if el.cancelable == Cancelable::No {
        return Err(RuntimeError::Permission(
            "target thread was not created as cancelable",
        ));
    }
    {
        let mut state = el.state.lock();
        state.cancelled = true;
        state.unblock_events += 1;
        state.unblocked = true;
    }
    el.pipe_cv.notify_all();
    Ok(())
}

/// Whether a cancellation is pending, enabled, and deliverable right now.
pub fn is_cancel_pending(element: &ThreadElement) -> bool {
    if element.cancelable != Cancelable::Yes {
        return false;
    }
    let state = element.state.lock();
    state.cancelled && matches!(state.cancel_state, CancelState::Enabled)
}

/// Register a cleanup handler, to be run (in LIFO order, relative to other
/// pending handlers) on cancellation or normal thread exit.
pub fn cleanup_push(element: &ThreadElement, f: Box<dyn FnOnce() + Send>, site: &'static str) {
    let registration_sp = {
        let probe: u8 = 0;
        &probe as *const u8 as usize
    };
    element.state.lock().cleanup_stack.push(CleanupEntry {
        f,
        registration_sp,
        site,
    });
}

/// Pop the most recently pushed cleanup handler. Runs it first if `run` is
/// true, matching `pthread_cleanup_pop`'s `execute` argument.
pub fn cleanup_pop(element: &ThreadElement, run: bool) {
    let entry = element.state.lock().cleanup_stack.pop();
    if let Some(entry) = entry
        && run
    {
        (entry.f)();
    }
}

/// Run every remaining cleanup handler, most recently pushed first. Used by
/// both cancellation delivery and normal thread exit (section 4.10): a
/// nonempty cleanup stack at normal exit is unusual enough to warrant a
/// diagnostic, but the handlers still run so resources are not leaked.
pub fn drain_cleanup_stack(element: &ThreadElement) {
    loop {
        let entry = element.state.lock().cleanup_stack.pop();
        match entry {
            Some(entry) => (entry.f)(),
            None => break,
        }
    }
}

/// Call at a cancellation point. If cancellation is pending and enabled,
/// drains the cleanup stack and unwinds the calling thread via
/// [`CancelledMarker`]; the thread trampoline catches this and records a
/// cancelled exit rather than a panic. Returns normally otherwise.
pub fn cancellation_point(element: &ThreadElement) {
    if !is_cancel_pending(element) {
        return;
    }
    drain_cleanup_stack(element);
    std::panic::panic_any(CancelledMarker);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ThreadKind;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn elem(registry: &Registry, cancelable: Cancelable) -> Arc<ThreadElement> {
        let id = registry.reserve_id().unwrap();
        let el = Arc::new(ThreadElement::new(
            id,
            ThreadKind::Discovered,
            std::thread::current().id(),
            cancelable,
            0,
            0,
        ));
        registry.insert(id, el.clone());
        el
    }

    #[test]
    fn cancel_on_noncancelable_thread_is_rejected() {
        let registry = Registry::new(4);
        let el = elem(&registry, Cancelable::No);
        assert!(matches!(
            cancel(&registry, el.small_id),
            Err(RuntimeError::Permission(_))
        ));
    }

    #[test]
    fn cancel_wakes_a_parked_target() {
        let registry = Registry::new(4);
        let el = elem(&registry, Cancelable::Yes);
        let before = el.state.lock().unblock_events;
        cancel(&registry, el.small_id).unwrap();
        let state = el.state.lock();
        assert_eq!(state.unblock_events, before + 1);
        assert!(state.unblocked);
    }

    #[test]
    fn pending_cancellation_requires_enabled_state() {
        let registry = Registry::new(4);
        let el = elem(&registry, Cancelable::Yes);
        cancel(&registry, el.small_id).unwrap();
        cancel_set_state(&el, CancelState::Disabled);
        assert!(!is_cancel_pending(&el));
        cancel_set_state(&el, CancelState::Enabled);
        assert!(is_cancel_pending(&el));
    }

    #[test]
    fn cleanup_runs_in_lifo_order() {
        let registry = Registry::new(4);
        let el = elem(&registry, Cancelable::Yes);
        let order = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            cleanup_push(&el, Box::new(move || order.lock().unwrap().push(i)), "test");
        }
        drain_cleanup_stack(&el);
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn cleanup_pop_without_run_discards_handler() {
        let registry = Registry::new(4);
        let el = elem(&registry, Cancelable::Yes);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        cleanup_push(&el, Box::new(move || { ran2.fetch_add(1, Ordering::SeqCst); }), "test");
        cleanup_pop(&el, false);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(el.state.lock().cleanup_stack.is_empty());
    }

    #[test]
    fn cancellation_point_unwinds_with_marker_and_drains_cleanup() {
        let registry = Registry::new(4);
        let el = elem(&registry, Cancelable::Yes);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        cleanup_push(&el, Box::new(move || { ran2.fetch_add(1, Ordering::SeqCst); }), "test");
        cancel(&registry, el.small_id).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cancellation_point(&el);
        }));
        assert!(result.is_err());
        assert!(result.unwrap_err().downcast_ref::<CancelledMarker>().is_some());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
