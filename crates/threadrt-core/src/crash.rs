//! Crash mode (section 4.9): a global, one-way degradation switch.
//!
//! Once entered, the lock accountant stops treating out-of-order releases
//! as fatal (see [`crate::lock_accountant::LockAccountant::lock_released`])
//! so that a host daemon already unwinding after a serious fault can still
//! run its own crash-reporting code without the runtime itself aborting the
//! process a second time.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::diagnostics;

static CRASH_MODE: AtomicBool = AtomicBool::new(false);

/// Whether the runtime is currently in crash mode.
pub fn in_crash_mode() -> bool {
    CRASH_MODE.load(Ordering::Acquire)
}

/// Enter crash mode. Idempotent; only the first call emits a diagnostic.
/// There is deliberately no way back out: crash mode exists to get a
/// process that is already failing safely to its final diagnostics, not to
/// be toggled during normal operation.
pub fn enter_crash_mode() {
    if !CRASH_MODE.swap(true, Ordering::AcqRel) {
        diagnostics::warn(
            "crash_mode_entered",
            None,
            "runtime entered crash mode; lock accounting is now permissive",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn crash_mode_is_global_and_sticky() {
        assert!(!in_crash_mode());
        enter_crash_mode();
        assert!(in_crash_mode());
        enter_crash_mode();
        assert!(in_crash_mode());
    }
}
