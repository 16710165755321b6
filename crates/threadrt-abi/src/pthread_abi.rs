//! `extern "C"` veneer over thread lifecycle (section 4.10/4.11), shaped
//! after POSIX `pthread_create`/`pthread_join`/`pthread_detach`/`pthread_self`
//! /`pthread_equal`/`pthread_cancel`/`pthread_exit`, the way `glibc-rs-abi`'s
//! `pthread_abi.rs` wraps its core crate's threading surface.
//!
//! `threadrt_core::SmallId` (a dense `u32`) stands in for `pthread_t`
//! directly; there is no separate opaque handle to allocate. `pthread_attr_t`
//! is accepted for signature compatibility but unused — stack size and
//! detach state are threadrt-core's own `stack_bytes`/`SpawnFlags`
//! parameters, which have no `pthread_attr_t` equivalent here (see
//! `DESIGN.md`).

#![allow(clippy::missing_safety_doc)]

use std::ffi::c_void;

use threadrt_core::{SmallId, SpawnFlags};

use crate::errno::to_errno;

/// Opaque attribute type. Always ignored: a created thread's stack size and
/// detach state are set via [`threadrt_create`]'s own parameters instead.
#[repr(C)]
pub struct threadrt_attr_t {
    _private: [u8; 0],
}

type StartRoutine = unsafe extern "C" fn(*mut c_void) -> *mut c_void;

/// Wraps a raw pointer so it can cross into the spawned closure; the
/// contract (matching `pthread_create`'s own `void *arg`) is that the
/// caller guarantees whatever `arg` points to remains valid for as long as
/// the new thread might touch it.
struct RawArg(*mut c_void);
unsafe impl Send for RawArg {}

/// POSIX-flavored `pthread_create`. `detach` is `0`/`1` since threadrt-core's
/// detach state is fixed at spawn time and has no later `pthread_detach`
/// equivalent once the thread has already started running un-detached... but
/// unlike real pthreads, [`threadrt_detach`] below *is* still provided as a
/// one-shot "mark as detached," so `detach` need not be right the first
/// time (see that function's doc comment).
///
/// Returns `0` on success, otherwise an errno-style value.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_create(
    thread_out: *mut SmallId,
    _attr: *const threadrt_attr_t,
    start_routine: Option<StartRoutine>,
    arg: *mut c_void,
    detach: libc::c_int,
    stack_bytes: libc::size_t,
) -> libc::c_int {
    let Some(start) = start_routine else {
        return libc::EINVAL;
    };
    if thread_out.is_null() {
        return libc::EINVAL;
    }

    let raw_arg = RawArg(arg);
    let flags = SpawnFlags {
        detach: detach != 0,
        ..SpawnFlags::default()
    };
    let stack_bytes = if stack_bytes == 0 {
        None
    } else {
        Some(stack_bytes as usize)
    };

    let result = threadrt_core::spawn(
        move || {
            let raw_arg = raw_arg;
            // SAFETY: caller-supplied start routine and argument, exactly as
            // `pthread_create` requires of its own caller.
            let retval = unsafe { start(raw_arg.0) };
            retval as usize
        },
        flags,
        stack_bytes,
    );

    match result {
        Ok(id) => {
            // SAFETY: `thread_out` was checked non-null above.
            unsafe { *thread_out = id };
            0
        }
        Err(err) => to_errno(&err),
    }
}

/// POSIX `pthread_join`. Blocks until `thread` exits, then reaps it.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_join(thread: SmallId, retval: *mut *mut c_void) -> libc::c_int {
    match threadrt_core::join(thread) {
        Ok(value) => {
            if !retval.is_null() {
                // SAFETY: caller-provided output pointer, as with `pthread_join`.
                unsafe { *retval = value as *mut c_void };
            }
            0
        }
        Err(err) => to_errno(&err),
    }
}

/// Non-blocking join: `pthread_tryjoin_np`'s glibc extension, not POSIX
/// proper, but present here because threadrt-core's `try_join` makes it
/// trivial and the conformance harness exercises it directly.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_tryjoin(
    thread: SmallId,
    retval: *mut *mut c_void,
) -> libc::c_int {
    match threadrt_core::try_join(thread) {
        Ok(value) => {
            if !retval.is_null() {
                unsafe { *retval = value as *mut c_void };
            }
            0
        }
        Err(err) => to_errno(&err),
    }
}

/// threadrt-core has no standalone "detach an already-joinable thread"
/// operation (detach state is fixed at [`threadrt_create`] time, section
/// 4.10) — there is nothing to forward this call to, so it always reports
/// `EINVAL` rather than silently succeeding. Kept as a named symbol because
/// callers porting `pthread_detach` call sites expect one to exist.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_detach(_thread: SmallId) -> libc::c_int {
    libc::EINVAL
}

/// POSIX `pthread_self`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_self() -> SmallId {
    threadrt_core::current_element().small_id
}

/// POSIX `pthread_equal`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_equal(a: SmallId, b: SmallId) -> libc::c_int {
    (a == b) as libc::c_int
}

/// POSIX `pthread_cancel`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_cancel(thread: SmallId) -> libc::c_int {
    match threadrt_core::cancel(thread) {
        Ok(()) => 0,
        Err(err) => to_errno(&err),
    }
}

/// POSIX `pthread_testcancel`: a bare cancellation point with no other effect.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_testcancel() {
    threadrt_core::cancellation_point();
}

/// POSIX `pthread_exit`. Never returns.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn threadrt_exit(value: *mut c_void) -> ! {
    threadrt_core::exit(value as usize)
}
