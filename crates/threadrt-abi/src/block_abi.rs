//! `extern "C"` veneer over block/unblock (section 4.6) and the cleanup
//! stack (section 4.7). There is no POSIX equivalent of `block`/`unblock`
//! (they are this crate's own self-pipe primitive, not an OS facility), so
//! these symbols use the `threadrt_` prefix rather than impersonating a
//! standard header.

#![allow(clippy::missing_safety_doc)]

use std::ffi::c_void;
use std::time::{Duration, Instant};

use threadrt_core::SmallId;

use crate::errno::to_errno;

/// Opaque handle for an in-flight [`threadrt_block_prepare`] snapshot.
/// Callers must not inspect its bits; it exists only to round-trip through
/// [`threadrt_block`]/[`threadrt_timed_block`].
#[repr(transparent)]
pub struct ThreadrtEvents(u64);

/// Snapshot the calling thread's unblock generation before evaluating some
/// external condition (section 4.6). Pair with [`threadrt_block`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_block_prepare() -> ThreadrtEvents {
    ThreadrtEvents(threadrt_core::block_prepare().raw())
}

/// Block until [`threadrt_unblock`] is called against the calling thread, or
/// immediately if one already raced ahead of this call (section 4.6 / 8's
/// block/unblock race property).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_block(events: ThreadrtEvents) {
    threadrt_core::block(threadrt_core::block::Events::from_raw(events.0));
}

/// As [`threadrt_block`], but gives up after `timeout_ms` milliseconds.
/// Returns `0` on success, `ETIMEDOUT` if the deadline passed first.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_timed_block(
    events: ThreadrtEvents,
    timeout_ms: u64,
) -> libc::c_int {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    match threadrt_core::timed_block(threadrt_core::block::Events::from_raw(events.0), deadline) {
        Ok(()) => 0,
        Err(err) => to_errno(&err),
    }
}

/// Wake `target` out of a pending or future block call (section 4.6).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_unblock(target: SmallId) -> libc::c_int {
    match threadrt_core::unblock(target) {
        Ok(()) => 0,
        Err(err) => to_errno(&err),
    }
}

/// A C cleanup routine plus its argument, matching
/// `pthread_cleanup_push(void (*routine)(void *), void *arg)`.
struct CCleanup {
    routine: unsafe extern "C" fn(*mut c_void),
    arg: usize,
}
unsafe impl Send for CCleanup {}

impl CCleanup {
    fn run(self) {
        // SAFETY: the caller's contract on `threadrt_cleanup_push` requires
        // `routine` to remain valid and callable with `arg` until popped.
        unsafe { (self.routine)(self.arg as *mut c_void) };
    }
}

/// POSIX `pthread_cleanup_push`. `site` is a short caller-supplied tag
/// (must be a static string literal's address, e.g. `c"my_func"` — this
/// crate keeps it simple and just labels every push from the ABI boundary
/// the same way).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_cleanup_push(
    routine: Option<unsafe extern "C" fn(*mut c_void)>,
    arg: *mut c_void,
) -> libc::c_int {
    let Some(routine) = routine else {
        return libc::EINVAL;
    };
    let cleanup = CCleanup {
        routine,
        arg: arg as usize,
    };
    threadrt_core::cleanup_push(Box::new(move || cleanup.run()), "threadrt_cleanup_push");
    0
}

/// POSIX `pthread_cleanup_pop`. `execute` matches `pthread_cleanup_pop`'s own
/// `int execute` parameter: nonzero runs the handler before popping it.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_cleanup_pop(execute: libc::c_int) {
    threadrt_core::cleanup_pop(execute != 0);
}
