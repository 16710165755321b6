//! `extern "C"` veneer over the in-process signal subsystem (section 4.5),
//! block/unblock (4.6), and suspension/crash-mode (4.8/4.9).
//!
//! These are *not* real POSIX signals — section 4.5 is explicit that
//! delivery never touches kernel signal delivery — so this module does not
//! pretend to be ABI-compatible with `<signal.h>`'s `sigset_t`/`kill`/
//! `sigprocmask`. `threadrt_core::signal::SigSet` is a plain `u32` bitmask
//! over 31 in-process signal numbers, and `threadrt_sigmask`'s `how`
//! parameter is this crate's own small enum, encoded as a `c_int`, rather
//! than `SIG_BLOCK`/`SIG_UNBLOCK`/`SIG_SETMASK`. Naming still follows the
//! POSIX call each function stands in for, matching the spec's "pthread-
//! flavored... veneer over the same core" framing for the parts of the ABI
//! that *do* line up (thread lifecycle, in `pthread_abi`) while being
//! explicit about the parts that don't.

#![allow(clippy::missing_safety_doc)]

use threadrt_core::SignalHandler;
use threadrt_core::signal::{SigSet, Signal, SigmaskHow};

use crate::errno::to_errno;

/// `how` values for [`threadrt_sigmask`], chosen to mirror `SIG_BLOCK` (0),
/// `SIG_UNBLOCK` (1), `SIG_SETMASK` (2) position-for-position, plus a fourth
/// `GET` value POSIX expresses instead by passing a null `set` — here
/// `set_in` is always meaningful, so `GET` needs its own tag.
pub const THREADRT_SIG_BLOCK: libc::c_int = 0;
pub const THREADRT_SIG_UNBLOCK: libc::c_int = 1;
pub const THREADRT_SIG_SETMASK: libc::c_int = 2;
pub const THREADRT_SIG_GET: libc::c_int = 3;

fn decode_how(how: libc::c_int) -> Option<SigmaskHow> {
    match how {
        THREADRT_SIG_BLOCK => Some(SigmaskHow::Block),
        THREADRT_SIG_UNBLOCK => Some(SigmaskHow::Unblock),
        THREADRT_SIG_SETMASK => Some(SigmaskHow::Set),
        THREADRT_SIG_GET => Some(SigmaskHow::Get),
        _ => None,
    }
}

/// Raise `sig` against `target` (section 4.5). `sig` must be in
/// `0..=MAX_SIGNAL` (30); signal `0` is the existence-probe signal (POSIX
/// `kill(pid, 0)`'s convention) and is accepted but never latched or
/// dispatched to a handler.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_kill(target: u32, sig: Signal) -> libc::c_int {
    match threadrt_core::kill(target, sig) {
        Ok(()) => 0,
        Err(err) => to_errno(&err),
    }
}

/// Read or update the calling thread's signal mask (section 4.5). Always
/// writes the prior mask to `*set_out` (if non-null) before applying
/// `set_in`, mirroring `pthread_sigmask`'s `oldset` convention. Returns `0`,
/// or `EINVAL` for an unrecognized `how`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_sigmask(
    how: libc::c_int,
    set_in: SigSet,
    set_out: *mut SigSet,
) -> libc::c_int {
    let Some(how) = decode_how(how) else {
        return libc::EINVAL;
    };
    let old = threadrt_core::sigmask(how, Some(set_in));
    if !set_out.is_null() {
        // SAFETY: caller-provided output pointer, as with `pthread_sigmask`.
        unsafe { *set_out = old };
    }
    0
}

/// Install a handler for `sig`. A null `handler` installs the default
/// action (clear pending, no-op); there is no separate "ignore" sentinel
/// reachable from the ABI boundary distinct from "never deliver" — callers
/// wanting `SIG_IGN` semantics should mask the signal instead via
/// [`threadrt_sigmask`].
///
/// # Safety
/// `handler`, if non-null, must be a valid `extern "C" fn(u32)` that remains
/// callable for as long as it might still be invoked (i.e. until replaced or
/// the process exits).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_set_handler(
    sig: Signal,
    handler: Option<unsafe extern "C" fn(u32)>,
) -> libc::c_int {
    let handler = match handler {
        None => SignalHandler::Default,
        // SAFETY: `extern "C" fn(u32)` and `fn(u32)` share an identical
        // calling convention and argument layout on every platform this
        // crate targets; only the ABI tag differs. The caller's safety
        // contract above covers the pointer's validity.
        Some(f) => SignalHandler::Handler(unsafe {
            std::mem::transmute::<unsafe extern "C" fn(u32), fn(u32)>(f)
        }),
    };
    match threadrt_core::set_handler(sig, handler) {
        Ok(()) => 0,
        Err(err) => to_errno(&err),
    }
}

/// POSIX-flavored `sigsuspend`: temporarily replace the mask and block for
/// an unmasked signal. Returns `1` if a signal was delivered (always, per
/// section 4.5's "mirrors... always returns after a signal" contract), `0`
/// only if this crate's core ever grows a case that can return early without
/// delivering one.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_sigsuspend(temp_mask: SigSet) -> libc::c_int {
    threadrt_core::sigsuspend(temp_mask) as libc::c_int
}

/// POSIX `pause`. Returns `1` once an unmasked signal was delivered.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_pause() -> libc::c_int {
    threadrt_core::pause() as libc::c_int
}

/// Interruptible sleep (section 4.6/8): returns early if a signal is
/// delivered partway through. Always reports `0`; threadrt-core's
/// `sleep_ms` only fails via cancellation, which unwinds rather than
/// returning, so there is no error case to translate here.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_sleep_ms(ms: u64) -> libc::c_int {
    match threadrt_core::sleep_ms(ms) {
        Ok(()) => 0,
        Err(err) => to_errno(&err),
    }
}

/// Whether the runtime is in crash mode (section 4.9).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_in_crash_mode() -> libc::c_int {
    threadrt_core::in_crash_mode() as libc::c_int
}

/// Enter crash mode. Irreversible for the life of the process.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_enter_crash_mode() {
    threadrt_core::enter_crash_mode();
}

/// Request that every other live thread suspend itself (section 4.8).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_suspend_others() {
    threadrt_core::suspend_others();
}

/// Release a previously issued suspend request (section 4.8).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_unsuspend_others() {
    threadrt_core::unsuspend_others();
}

/// Call at a safe point: parks the calling thread while it is suspended.
/// Returns `1` if it actually parked.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_check_suspended() -> libc::c_int {
    threadrt_core::check_suspended() as libc::c_int
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn sigmask_block_and_get_round_trip() {
        let mut old = 0u32;
        let rc = unsafe { threadrt_sigmask(THREADRT_SIG_BLOCK, 0b101, &mut old) };
        assert_eq!(rc, 0);
        let mut current = 0u32;
        let rc = unsafe { threadrt_sigmask(THREADRT_SIG_GET, 0, &mut current) };
        assert_eq!(rc, 0);
        assert_eq!(current, 0b101);
    }

    #[test]
    fn sigmask_rejects_unknown_how() {
        let mut old = 0u32;
        let rc = unsafe { threadrt_sigmask(99, 0, &mut old) };
        assert_eq!(rc, libc::EINVAL);
    }

    #[test]
    fn kill_of_unknown_target_reports_esrch() {
        let rc = unsafe { threadrt_kill(u32::MAX, 1) };
        assert_eq!(rc, libc::ESRCH);
    }

    #[test]
    fn set_handler_runs_on_kill() {
        static COUNT: AtomicU32 = AtomicU32::new(0);
        unsafe extern "C" fn handler(_sig: u32) {
            COUNT.fetch_add(1, Ordering::SeqCst);
        }
        let id = threadrt_core::current_element().small_id;
        unsafe {
            assert_eq!(threadrt_set_handler(7, Some(handler)), 0);
            assert_eq!(threadrt_kill(id, 7), 0);
        }
        // The bit is already pending, so `pause` dispatches it immediately
        // without actually parking.
        assert!(threadrt_core::pause());
        assert_eq!(COUNT.load(Ordering::SeqCst), 1);
    }
}
