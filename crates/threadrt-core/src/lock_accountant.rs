//! Lock accountant (section 4.4): per-thread LIFO lock-stack bookkeeping and
//! cross-thread deadlock detection.
//!
//! Every tracked lock primitive (section 4.12/4.13) calls into this module
//! around its acquire/release so the accountant always has a consistent
//! picture of who holds what and who is waiting on whom.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::diagnostics;
use crate::element::{LockFrame, SmallId, ThreadElement};
use crate::registry::Registry;

/// Tracks, for each currently-held lock address, which small id holds it.
/// Used only to walk the wait-for graph during deadlock detection; the
/// per-thread LIFO stack itself lives on [`crate::element::ElementState`].
pub struct LockAccountant {
    owners: Mutex<HashMap<usize, SmallId>>,
}

impl LockAccountant {
    pub fn new() -> Self {
        LockAccountant {
            owners: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `element` has just acquired `frame`. Pushes onto the
    /// thread's lock stack; aborts the process if the stack's configured
    /// capacity is exceeded (a near-certain sign of a leak or recursive
    /// acquire bug rather than legitimate nesting).
    pub fn lock_got(&self, element: &ThreadElement, config: &RuntimeConfig, frame: LockFrame) {
        {
            let mut state = element.state.lock();
            if state.lock_stack.len() >= config.lock_stack_capacity {
                let stack = state.lock_stack.clone();
                drop(state);
                diagnostics::fatal_with_stack(
                    "lock_stack_overflow",
                    Some(element.small_id),
                    format!(
                        "lock stack exceeded its configured capacity of {} frames acquiring {:#x}",
                        config.lock_stack_capacity, frame.address
                    ),
                    &stack,
                );
            }
            state.lock_stack.push(frame.clone());
            state.waiting = None;
        }
        self.owners.lock().insert(frame.address, element.small_id);
    }

    /// Record that `element` has released the lock at `address`.
    ///
    /// Outside crash mode this must be the top of the stack (LIFO). If
    /// `address` is present but not at the top, that is a genuine
    /// out-of-order release and the process aborts with a stack dump
    /// (except in crash mode, where the accountant degrades to best-effort
    /// bookkeeping per section 4.9: it removes the frame wherever it is and
    /// only warns). If `address` is not on the stack at all, the release is
    /// silently ignored: per section 4.4 this is the expected shape when the
    /// runtime only discovered the thread after the lock was already held,
    /// so it never saw a matching `lock_got`.
    pub fn lock_released(&self, element: &ThreadElement, address: usize, crash_mode: bool) {
        let mut state = element.state.lock();
        match state.lock_stack.last() {
            Some(top) if top.address == address => {
                state.lock_stack.pop();
            }
            _ => {
                let pos = state.lock_stack.iter().position(|f| f.address == address);
                match pos {
                    None => return,
                    Some(idx) if crash_mode => {
                        state.lock_stack.remove(idx);
                        drop(state);
                        diagnostics::warn(
                            "lock_released_out_of_order",
                            Some(element.small_id),
                            format!(
                                "lock {address:#x} released out of LIFO order while in crash \
mode; continuing in permissive mode"
                            ),
                        );
                        self.owners.lock().remove(&address);
                        return;
                    }
                    Some(_) => {
                        let stack = state.lock_stack.clone();
                        drop(state);
                        diagnostics::fatal_with_stack(
                            "lock_released_out_of_order",
                            Some(element.small_id),
                            format!("lock {address:#x} released out of LIFO order"),
                            &stack,
                        );
                    }
                }
            }
        }
        drop(state);
        self.owners.lock().remove(&address);
    }

    /// Atomically replace the top-of-stack frame at `old_address` with
    /// `new_frame`: used by condition variables, whose wait releases the
    /// guarded mutex and reacquires it as a single observable step rather
    /// than two separate release/acquire bookkeeping events.
    pub fn lock_got_swap(&self, element: &ThreadElement, old_address: usize, new_frame: LockFrame) {
        let mut state = element.state.lock();
        match state.lock_stack.last() {
            Some(top) if top.address == old_address => {
                state.lock_stack.pop();
            }
            _ => {
                let stack = state.lock_stack.clone();
                drop(state);
                diagnostics::fatal_with_stack(
                    "lock_swap_mismatch",
                    Some(element.small_id),
                    format!("expected {old_address:#x} at top of stack during swap"),
                    &stack,
                );
            }
        }
        state.lock_stack.push(new_frame.clone());
        drop(state);
        self.owners.lock().remove(&old_address);
        self.owners.lock().insert(new_frame.address, element.small_id);
    }

    /// Update the recorded kind of an already-held lock, e.g. a read lock
    /// upgraded to a write lock at the same address.
    pub fn lock_changed(&self, element: &ThreadElement, address: usize, kind: crate::element::LockKind) {
        let mut state = element.state.lock();
        if let Some(frame) = state.lock_stack.iter_mut().rev().find(|f| f.address == address) {
            frame.kind = kind;
        }
    }

    /// Record that `element` is about to block waiting for `frame`, and run
    /// deadlock detection: if the lock's current holder is (transitively)
    /// waiting on something `element` holds, this is a cycle and the
    /// process aborts with both stacks dumped, per section 4.4.
    pub fn lock_waiting_element(
        &self,
        element: &Arc<ThreadElement>,
        registry: &Registry,
        frame: LockFrame,
    ) {
        element.state.lock().waiting = Some(frame.clone());
        if self.detect_cycle(element.small_id, frame.address, registry) {
            let stack = element.state.lock().lock_stack.clone();
            diagnostics::fatal_with_stack(
                "deadlock_detected",
                Some(element.small_id),
                format!(
                    "waiting for lock {:#x} would complete a cycle in the wait-for graph",
                    frame.address
                ),
                &stack,
            );
        }
    }

    /// Clear a thread's recorded wait once it has acquired the lock (or
    /// given up, e.g. a timed attempt that failed).
    pub fn lock_waiting_done(&self, element: &ThreadElement) {
        element.state.lock().waiting = None;
    }

    fn detect_cycle(&self, start: SmallId, contended_address: usize, registry: &Registry) -> bool {
        let mut address = contended_address;
        let mut seen = HashSet::new();
        loop {
            let owner_id = match self.owners.lock().get(&address).copied() {
                Some(id) => id,
                None => return false,
            };
            if owner_id == start {
                return true;
            }
            if !seen.insert(owner_id) {
                return false;
            }
            let owner = match registry.get(owner_id) {
                Some(el) => el,
                None => return false,
            };
            let waiting = owner.state.lock().waiting.clone();
            match waiting {
                Some(frame) => address = frame.address,
                None => return false,
            }
        }
    }
}

impl Default for LockAccountant {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Cancelable, LockKind, ThreadKind};

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

    fn frame(address: usize) -> LockFrame {
        LockFrame {
            address,
            kind: LockKind::Mutex,
            file: "test",
            line: 1,
        }
    }

    #[test]
    fn lifo_push_pop_roundtrip() {
        let accountant = LockAccountant::new();
        let registry = Registry::new(4);
        let config = RuntimeConfig::default();
        let el = elem(&registry);
        accountant.lock_got(&el, &config, frame(0x10));
        accountant.lock_got(&el, &config, frame(0x20));
        assert_eq!(el.state.lock().lock_stack.len(), 2);
        accountant.lock_released(&el, 0x20, false);
        accountant.lock_released(&el, 0x10, false);
        assert!(el.state.lock().lock_stack.is_empty());
    }

    #[test]
    fn swap_replaces_top_frame() {
        let accountant = LockAccountant::new();
        let registry = Registry::new(4);
        let config = RuntimeConfig::default();
        let el = elem(&registry);
        accountant.lock_got(&el, &config, frame(0x10));
        accountant.lock_got_swap(&el, 0x10, frame(0x10));
        assert_eq!(el.state.lock().lock_stack.len(), 1);
        assert_eq!(el.state.lock().lock_stack[0].address, 0x10);
    }

    #[test]
    fn two_cycle_deadlock_is_detected() {
        let accountant = LockAccountant::new();
        let registry = Registry::new(4);
        let config = RuntimeConfig::default();
        let a = elem(&registry);
        let b = elem(&registry);

        accountant.lock_got(&a, &config, frame(0x10));
        accountant.lock_got(&b, &config, frame(0x20));
        // b waits on a's lock: no cycle yet.
        accountant.lock_waiting_element(&b, &registry, frame(0x10));
        assert!(!accountant.detect_cycle(b.small_id, 0x10, &registry));

        // a now tries to wait on b's lock, completing the cycle. This path
        // calls `diagnostics::fatal_with_stack`, which aborts the process,
        // so we only exercise the pure detection helper here.
        assert!(accountant.detect_cycle(a.small_id, 0x20, &registry));
    }

    #[test]
    fn release_of_never_recorded_lock_is_silently_ignored() {
        let accountant = LockAccountant::new();
        let registry = Registry::new(4);
        let el = elem(&registry);
        // Nothing was ever pushed for 0x99 (e.g. taken before the runtime
        // discovered this thread); releasing it must not panic or abort.
        accountant.lock_released(&el, 0x99, false);
        assert!(el.state.lock().lock_stack.is_empty());
    }

    #[test]
    fn lock_changed_updates_kind() {
        let accountant = LockAccountant::new();
        let registry = Registry::new(4);
        let config = RuntimeConfig::default();
        let el = elem(&registry);
        accountant.lock_got(&el, &config, LockFrame { kind: LockKind::Read, ..frame(0x10) });
        accountant.lock_changed(&el, 0x10, LockKind::Write);
        assert_eq!(el.state.lock().lock_stack[0].kind, LockKind::Write);
    }
}
