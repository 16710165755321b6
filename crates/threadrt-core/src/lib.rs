//! An in-process thread runtime: discovery, lock accounting with deadlock
//! detection, portable signals, advisory suspension, deferred cancellation,
//! and a global crash-mode degradation switch.
//!
//! The pieces live in their own modules (see section 4 of `SPEC_FULL.md` for
//! the per-module design). This crate root only re-exports the public
//! surface a caller actually needs; everything else stays internal.

pub mod block;
pub mod cancel;
pub mod condvar;
pub mod config;
pub mod crash;
pub mod diagnostics;
pub mod discovery;
pub mod element;
pub mod error;
pub mod event_queue;
pub mod lock;
pub mod lock_accountant;
pub mod qid;
pub mod registry;
pub mod runtime;
pub mod signal;
pub mod suspend;
pub mod thread;
pub mod tls;

pub use config::RuntimeConfig;
pub use element::{Cancelable, CancelState, LockKind, SignalHandler, SmallId, MAIN_SMALL_ID};
pub use error::{RuntimeError, RuntimeResult};
pub use lock::{
    TrackedMutex, TrackedMutexGuard, TrackedReadGuard, TrackedRwLock, TrackedSpinGuard,
    TrackedSpinLock, TrackedWriteGuard,
};
pub use condvar::TrackedCondvar;
pub use thread::{SpawnFlags, WaitOutcome};

use std::sync::Arc;
use std::time::Duration;

use element::ThreadElement;

/// The calling thread's element, discovering it if this is the first call
/// from this thread (section 4.3). Most of the functions below resolve this
/// implicitly; it is exposed directly for callers that need to pass an
/// element to [`tls`] or hold onto their own small id.
pub fn current_element() -> Arc<ThreadElement> {
    runtime::global().current_element()
}

/// Spawn a new thread (section 4.10). See [`thread::spawn`].
pub fn spawn(
    entry: impl FnOnce() -> usize + Send + 'static,
    flags: SpawnFlags,
    stack_bytes: Option<usize>,
) -> RuntimeResult<SmallId> {
    thread::spawn(entry, flags, stack_bytes)
}

/// Terminate the calling thread with `value` (section 4.10). See
/// [`thread::exit`].
pub fn exit(value: usize) -> ! {
    thread::exit(value)
}

/// Block until `target` exits, then reap it (section 4.11).
pub fn join(target: SmallId) -> RuntimeResult<usize> {
    thread::join(target)
}

/// Non-blocking join (section 4.11).
pub fn try_join(target: SmallId) -> RuntimeResult<usize> {
    thread::try_join(target)
}

/// Join with a timeout (section 4.11).
pub fn join_timeout(target: SmallId, timeout: Duration) -> RuntimeResult<usize> {
    thread::join_timeout(target, timeout)
}

/// Rendezvous on `target`'s exit without reaping it (section 4.11). Unlike
/// [`join`], any number of callers may wait concurrently and `target` may be
/// detached or already have a joiner.
pub fn wait(target: SmallId, deadline: Option<std::time::Instant>) -> RuntimeResult<WaitOutcome> {
    thread::wait_until(target, deadline)
}

/// Register a callback run when the calling thread exits (section 4.10).
pub fn on_exit(f: Box<dyn FnOnce() + Send>) {
    let element = current_element();
    thread::on_exit(&element, f);
}

/// Sleep, interruptible by signal delivery (section 4.5/4.6, section 8).
pub fn sleep_ms(ms: u64) -> RuntimeResult<()> {
    thread::sleep_ms(&current_element(), ms)
}

/// Request cancellation of `target` (section 4.7).
pub fn cancel(target: SmallId) -> RuntimeResult<()> {
    cancel::cancel(&runtime::global().registry, target)
}

/// Toggle whether cancellation is currently deliverable against the calling
/// thread (section 4.7).
pub fn cancel_set_state(new: CancelState) -> CancelState {
    cancel::cancel_set_state(&current_element(), new)
}

/// Register a cleanup handler on the calling thread's cleanup stack (section
/// 4.7).
pub fn cleanup_push(f: Box<dyn FnOnce() + Send>, site: &'static str) {
    cancel::cleanup_push(&current_element(), f, site)
}

/// Pop the calling thread's most recently pushed cleanup handler, optionally
/// running it first (section 4.7).
pub fn cleanup_pop(run: bool) {
    cancel::cleanup_pop(&current_element(), run)
}

/// Call at a point it is safe to be cancelled (section 4.7).
pub fn cancellation_point() {
    cancel::cancellation_point(&current_element())
}

/// Read or update the calling thread's signal mask (section 4.5).
pub fn sigmask(how: signal::SigmaskHow, set_in: Option<signal::SigSet>) -> signal::SigSet {
    signal::sigmask(&current_element(), how, set_in)
}

/// Install a handler for `sig` on the calling thread (section 4.5).
pub fn set_handler(sig: signal::Signal, handler: SignalHandler) -> RuntimeResult<()> {
    signal::set_handler(&current_element(), sig, handler)
}

/// Raise `sig` against `target` (section 4.5).
pub fn kill(target: SmallId, sig: signal::Signal) -> RuntimeResult<()> {
    signal::kill(&runtime::global().registry, target, sig)
}

/// Temporarily replace the signal mask and block for an unmasked signal
/// (section 4.5).
pub fn sigsuspend(temp_mask: signal::SigSet) -> bool {
    signal::sigsuspend(&current_element(), temp_mask)
}

/// Block until any unmasked signal is delivered (section 4.5).
pub fn pause() -> bool {
    signal::pause(&current_element())
}

/// Snapshot the calling thread's unblock generation before waiting on some
/// external condition (section 4.6).
pub fn block_prepare() -> block::Events {
    block::block_prepare(&current_element())
}

/// Block until [`unblock`] is called against the calling thread (section
/// 4.6).
pub fn block(events: block::Events) {
    block::block(&current_element(), &runtime::global().config, events)
}

/// As [`block`], but gives up at `deadline` (section 4.6).
pub fn timed_block(events: block::Events, deadline: std::time::Instant) -> RuntimeResult<()> {
    block::timed_block(&current_element(), events, deadline)
}

/// Wake `target` out of a pending or future [`block`]/[`timed_block`] call
/// (section 4.6).
pub fn unblock(target: SmallId) -> RuntimeResult<()> {
    block::unblock(&runtime::global().registry, target)
}

/// Request that every other live thread suspend itself (section 4.8).
pub fn suspend_others() {
    let rt = runtime::global();
    let exclude = rt.current_element().small_id;
    suspend::suspend_others(&rt.registry, &rt.config, exclude)
}

/// Release a previously issued suspend request (section 4.8).
pub fn unsuspend_others() {
    let rt = runtime::global();
    let exclude = rt.current_element().small_id;
    suspend::unsuspend_others(&rt.registry, exclude)
}

/// Call at a safe point: parks the calling thread while suspended (section
/// 4.8).
pub fn check_suspended() -> bool {
    suspend::check_suspended(&current_element())
}

/// Whether the runtime is currently in crash mode (section 4.9).
pub fn in_crash_mode() -> bool {
    crash::in_crash_mode()
}

/// Enter crash mode; irreversible for the life of the process (section 4.9).
/// Also posts a non-blocking advisory suspend request against every other
/// live thread before flipping the crash-mode bit, per section 4.9's "asks
/// for advisory suspension of all other threads and flips crash-mode bits".
pub fn enter_crash_mode() {
    let rt = runtime::global();
    let exclude = rt.current_element().small_id;
    suspend::request_suspend_others(&rt.registry, exclude);
    crash::enter_crash_mode();
}
