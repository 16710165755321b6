//! Cooperative/advisory suspension (section 4.8).
//!
//! There is no way to force a thread to stop running instantaneously; a
//! suspend request only takes effect the next time the target calls
//! [`check_suspended`] at one of its own safe points. `suspend_others`
//! therefore waits for each target to acknowledge, bounded by a watchdog —
//! a thread that never reaches a safe point (an unyielding loop, most
//! likely) causes a fatal abort rather than an indefinite hang.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;
use crate::diagnostics;
use crate::element::{SmallId, ThreadElement};
use crate::registry::Registry;

/// Request that every element other than `exclude` suspend itself, and
/// block until each one has (acknowledged by parking in
/// [`check_suspended`]) or the watchdog timeout elapses.
pub fn suspend_others(registry: &Registry, config: &RuntimeConfig, exclude: SmallId) {
    let targets = registry.others(exclude);
    for el in &targets {
        el.suspend_depth.fetch_add(1, Ordering::AcqRel);
        el.pipe_cv.notify_all();
    }
    let deadline = Instant::now() + config.suspend_watchdog_timeout;
    for el in &targets {
        while !el.suspended_ack.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                diagnostics::fatal(
                    "suspend_watchdog_timeout",
                    Some(el.small_id),
                    format!(
                        "thread did not reach a safe point within {:?} of a suspend request",
                        config.suspend_watchdog_timeout
                    ),
                );
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Post a suspend request against every element other than `exclude` without
/// waiting for acknowledgment. Used by [`crate::crash::enter_crash_mode`]
/// (section 4.9): that path is itself the prelude to an abort, so it must
/// not risk hanging on the same watchdog that a normal `suspend_others` would
/// arm.
pub fn request_suspend_others(registry: &Registry, exclude: SmallId) {
    for el in registry.others(exclude) {
        el.suspend_depth.fetch_add(1, Ordering::AcqRel);
        el.pipe_cv.notify_all();
    }
}

/// Release a previously issued suspend request against every element other
/// than `exclude`. Suspend requests nest (section 4.8): a target only
/// resumes once its depth returns to zero.
pub fn unsuspend_others(registry: &Registry, exclude: SmallId) {
    for el in registry.others(exclude) {
        if el.suspend_depth.fetch_sub(1, Ordering::AcqRel) <= 1 {
            el.suspended_ack.store(false, Ordering::Release);
        }
        el.pipe_cv.notify_all();
    }
}

/// Call at a safe point. Parks the calling thread for as long as a suspend
/// request is outstanding against it; returns whether it actually parked.
pub fn check_suspended(element: &ThreadElement) -> bool {
    if element.suspend_depth.load(Ordering::Acquire) <= 0 {
        return false;
    }
    element.suspended_ack.store(true, Ordering::Release);
    let mut state = element.state.lock();
    while element.suspend_depth.load(Ordering::Acquire) > 0 {
        element.pipe_cv.wait_for(&mut state, Duration::from_millis(50));
    }
    drop(state);
    element.suspended_ack.store(false, Ordering::Release);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Cancelable, ThreadKind};
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

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
    fn suspend_others_waits_for_target_then_resumes() {
        let registry = Arc::new(Registry::new(4));
        let mut cfg = RuntimeConfig::default();
        cfg.suspend_watchdog_timeout = Duration::from_secs(2);
        let config = Arc::new(cfg);
        let target = elem(&registry);
        let target_id = target.small_id;
        let stop = Arc::new(AtomicBool::new(false));

        let t2 = target.clone();
        let stop2 = stop.clone();
        let worker = std::thread::spawn(move || {
            while !stop2.load(Ordering::Acquire) {
                if check_suspended(&t2) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        });

        // Excluding an id that cannot belong to `target` still reaches it
        // via `Registry::others`.
        suspend_others(&registry, &config, target_id + 1000);
        unsuspend_others(&registry, target_id + 1000);
        stop.store(true, Ordering::Release);
        worker.join().unwrap();
    }

    #[test]
    fn non_suspended_thread_does_not_park() {
        let registry = Registry::new(4);
        let el = elem(&registry);
        assert!(!check_suspended(&el));
    }
}
