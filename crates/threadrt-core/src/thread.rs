//! Thread lifecycle (sections 4.10-4.11): spawn, exit, join, and the
//! exit-callback/detached-reclamation plumbing that runs once a thread's
//! entry point returns.
//!
//! A created thread's entry runs inside a [`std::panic::catch_unwind`]
//! trampoline. Two sentinel panics unwind it on purpose and are treated as
//! clean exits rather than reportable panics: [`CancelledMarker`] (delivered
//! cancellation, see [`crate::cancel`]) and `ExitRequested` (an explicit
//! [`exit`] call from within the entry). Anything else that unwinds out of
//! the entry is an uncaught panic and is treated the same as any other
//! internal-consistency violation: a fatal diagnostic and process abort.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cancel::CancelledMarker;
use crate::diagnostics;
use crate::discovery;
use crate::element::{CancelState, Cancelable, ExitCallback, SmallId, ThreadElement};
use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime;
use crate::tls;

/// Flags accepted by [`spawn`], named after section 6's external-interface
/// wording (`flags={detach, async_exit, no_cancel}`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnFlags {
    /// The new thread is not joinable; its element is reclaimed automatically
    /// after [`crate::config::RuntimeConfig::detached_reclaim_hold`] once it
    /// exits.
    pub detach: bool,
    /// Run exit callbacks on the background event queue instead of inline
    /// before the thread is considered exited (join/wait still unblock
    /// immediately either way).
    pub async_exit: bool,
    /// The new thread is not cancelable: [`crate::cancel::cancel`] against it
    /// always fails with `Permission`.
    pub no_cancel: bool,
}

/// Panic payload for an explicit [`exit`] call, distinct from
/// [`CancelledMarker`] so the trampoline can tell a deliberate exit value
/// apart from a delivered cancellation.
struct ExitRequested(usize);

/// Terminate the calling thread immediately with `value`, running its
/// cleanup and exit-callback machinery exactly as a normal return from the
/// entry function would.
///
/// Only meaningful from inside a [`spawn`]ed thread's entry: it works by
/// unwinding to the trampoline that installed the matching `catch_unwind`.
/// Calling it from the main thread or a thread the runtime only discovered
/// propagates as an ordinary uncaught panic, since no such trampoline exists
/// there.
pub fn exit(value: usize) -> ! {
    std::panic::panic_any(ExitRequested(value))
}

/// Spawn a new thread running `entry` to completion, then `exit_internal`
/// with its return value. Returns the assigned small id, or
/// `ResourceExhausted` if the small-id space stays full (after backing off
/// for a configured number of rounds waiting on a reusable slot) or the host
/// refuses to allocate the requested stack.
pub fn spawn(
    entry: impl FnOnce() -> usize + Send + 'static,
    flags: SpawnFlags,
    stack_bytes: Option<usize>,
) -> RuntimeResult<SmallId> {
    let rt = runtime::global();
    let cancelable = if flags.no_cancel {
        Cancelable::No
    } else {
        Cancelable::Yes
    };
    let (id, element) = reserve_created_with_backoff(rt, cancelable)?;
    {
        let mut state = element.state.lock();
        state.detached = flags.detach;
        state.termination_gate = Some(crate::element::TerminationGate::new());
    }

    let stack_size = stack_bytes.unwrap_or(rt.config.default_stack_bytes);
    let trampoline_element = element.clone();
    let async_exit = flags.async_exit;
    let entry: Box<dyn FnOnce() -> usize + Send> = Box::new(entry);

    let spawn_result = std::thread::Builder::new()
        .name(format!("threadrt-{id}"))
        .stack_size(stack_size)
        .spawn(move || trampoline(trampoline_element, entry, stack_size, async_exit));

    match spawn_result {
        Ok(handle) => {
            rt.registry.set_handle(id, handle);
            Ok(id)
        }
        Err(_io_err) => {
            rt.registry.reclaim(id);
            Err(RuntimeError::ResourceExhausted(
                "host refused to allocate a thread stack",
            ))
        }
    }
}

/// Retry [`discovery::reserve_created`] with the configured backoff while the
/// small-id space stays full, rather than failing the first time a reusable
/// slot isn't immediately available (section 4.2's reclaim path runs on a
/// short delay, so a burst of short-lived threads shouldn't fail spawns it
/// could satisfy a moment later).
fn reserve_created_with_backoff(
    rt: &runtime::Runtime,
    cancelable: Cancelable,
) -> RuntimeResult<(SmallId, Arc<ThreadElement>)> {
    let mut attempt = 0u32;
    loop {
        match discovery::reserve_created(&rt.registry, cancelable) {
            Ok(ok) => return Ok(ok),
            Err(RuntimeError::ResourceExhausted(msg)) => {
                if attempt >= rt.config.reusable_wait_rounds {
                    return Err(RuntimeError::ResourceExhausted(msg));
                }
                attempt += 1;
                std::thread::sleep(rt.config.reusable_wait_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}

fn trampoline(
    element: Arc<ThreadElement>,
    entry: Box<dyn FnOnce() -> usize + Send>,
    stack_size: usize,
    async_exit: bool,
) {
    let rt = runtime::global();
    discovery::bind_created_thread(&rt.registry, &rt.qid_cache, stack_size, &element);

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry));
    let value = match outcome {
        Ok(v) => v,
        Err(payload) => match payload.downcast::<ExitRequested>() {
            Ok(exit_requested) => exit_requested.0,
            Err(payload) => {
                if payload.downcast_ref::<CancelledMarker>().is_some() {
                    0
                } else {
                    let stack = element.state.lock().lock_stack.clone();
                    diagnostics::fatal_with_stack(
                        "thread_panicked",
                        Some(element.small_id),
                        "a created thread's entry panicked without the panic being caught \
there",
                        &stack,
                    );
                }
            }
        },
    };
    exit_internal(&element, value, async_exit);
}

fn run_exit_callbacks(mut callbacks: VecDeque<ExitCallback>) {
    // Registered via `push_front`, so popping from the front runs them in
    // reverse registration order.
    while let Some(cb) = callbacks.pop_front() {
        (cb.f)();
    }
}

fn exit_internal(element: &Arc<ThreadElement>, value: usize, async_exit: bool) {
    let rt = runtime::global();
    {
        let mut state = element.state.lock();
        state.exit_started = true;
        state.cancel_state = CancelState::Disabled;
    }

    if !element.state.lock().cleanup_stack.is_empty() {
        diagnostics::warn(
            "nonempty_cleanup_stack_at_exit",
            Some(element.small_id),
            "thread exited normally with cleanup handlers still registered; running them now",
        );
    }
    crate::cancel::drain_cleanup_stack(element);

    let lock_stack_len = element.state.lock().lock_stack.len();
    if lock_stack_len != 0 {
        let stack = element.state.lock().lock_stack.clone();
        diagnostics::fatal_with_stack(
            "thread_exited_holding_locks",
            Some(element.small_id),
            format!("thread exited while still holding {lock_stack_len} tracked lock(s)"),
            &stack,
        );
    }

    tls::drain_all(element);

    let (detached, callbacks, gate) = {
        let mut state = element.state.lock();
        state.exit_value = Some(value);
        state.exited = true;
        (
            state.detached,
            std::mem::take(&mut state.exit_callbacks),
            state.termination_gate.clone(),
        )
    };

    if async_exit {
        rt.event_queue
            .schedule(Duration::ZERO, move || run_exit_callbacks(callbacks));
    } else {
        run_exit_callbacks(callbacks);
    }

    if let Some(gate) = &gate {
        gate.signal();
    }

    if detached {
        let id = element.small_id;
        rt.event_queue.schedule(rt.config.detached_reclaim_hold, move || {
            let _ = rt.registry.take_handle(id);
            rt.registry.reclaim(id);
            let pool = rt.registry.reusable_count();
            if pool > rt.config.max_reusable_slots {
                diagnostics::warn(
                    "reusable_pool_over_budget",
                    None,
                    format!(
                        "reusable small-id pool holds {pool} entries, over the configured {}",
                        rt.config.max_reusable_slots
                    ),
                );
            }
        });
    } else {
        element.state.lock().join_pending = true;
    }
}

/// Register a callback to run when the calling thread exits, most recently
/// registered first (section 4.10/4.11).
pub fn on_exit(element: &ThreadElement, f: Box<dyn FnOnce() + Send>) {
    element.state.lock().exit_callbacks.push_front(ExitCallback { f });
}

/// Block until `target` exits, then reap its element and return its exit
/// value. Fails with `InvalidArgument` if `target` is detached or already
/// has a joiner, `DeadlockDetected` on a self-join, `NotFound` if `target`
/// names no live element.
pub fn join(target: SmallId) -> RuntimeResult<usize> {
    join_deadline(target, None)
}

/// Non-blocking join: succeeds only if `target` has already exited,
/// otherwise `WouldBlock`.
pub fn try_join(target: SmallId) -> RuntimeResult<usize> {
    let rt = runtime::global();
    let el = rt.registry.get(target).ok_or(RuntimeError::NotFound)?;
    if !el.state.lock().exited {
        return Err(RuntimeError::WouldBlock);
    }
    join_deadline(target, Some(Instant::now()))
}

/// As [`join`], but gives up with `TimedOut` once `timeout` elapses.
pub fn join_timeout(target: SmallId, timeout: Duration) -> RuntimeResult<usize> {
    join_deadline(target, Some(Instant::now() + timeout))
}

fn join_deadline(target: SmallId, deadline: Option<Instant>) -> RuntimeResult<usize> {
    let rt = runtime::global();
    let caller = rt.current_element();
    if caller.small_id == target {
        return Err(RuntimeError::DeadlockDetected);
    }
    let el = rt.registry.get(target).ok_or(RuntimeError::NotFound)?;

    {
        let mut state = el.state.lock();
        if state.detached {
            return Err(RuntimeError::InvalidArgument("thread is detached"));
        }
        if state.join_requested {
            return Err(RuntimeError::InvalidArgument("thread already has a joiner"));
        }
        state.join_requested = true;
        state.joining_id = Some(caller.small_id);
    }

    let gate = el
        .state
        .lock()
        .termination_gate
        .clone()
        .expect("a joinable created thread always has a termination gate");

    // `join` is a cancellation point: the caller, not `target`, may be the
    // one cancelled while parked here, so poll our own cancellation state
    // rather than waiting on a gate notification that will never come from
    // the cancel side.
    if !gate.wait_interruptible(deadline, || crate::cancel::is_cancel_pending(&caller)) {
        let mut state = el.state.lock();
        state.join_requested = false;
        state.joining_id = None;
        drop(state);
        crate::cancel::cancellation_point(&caller);
        return Err(RuntimeError::TimedOut);
    }

    if let Some(handle) = rt.registry.take_handle(target) {
        let _ = handle.join();
    }

    let value = {
        let mut state = el.state.lock();
        state.join_pending = false;
        state
            .exit_value
            .take()
            .expect("termination gate only signals after exit_value is set")
    };

    rt.registry.reclaim(target);
    Ok(value)
}

/// Outcome of [`wait_until`]: whether `target` had already terminated
/// (or terminated before the deadline) or the deadline was reached first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Terminated,
    TimedOut,
}

/// Rendezvous on `target`'s exit without reaping it (section 4.11's `wait`,
/// distinct from [`join`]): any number of callers may wait on the same
/// target concurrently, none of them consumes its exit value, and the
/// target's element is left for a later `join` (or detached reclamation) to
/// clean up. Unlike `join`, `target` need not be joinable-and-unjoined; a
/// detached thread or one that already has a joiner can still be waited on.
pub fn wait_until(target: SmallId, deadline: Option<Instant>) -> RuntimeResult<WaitOutcome> {
    let rt = runtime::global();
    let caller = rt.current_element();
    let el = rt.registry.get(target).ok_or(RuntimeError::NotFound)?;

    if el.state.lock().exited {
        return Ok(WaitOutcome::Terminated);
    }

    let gate = {
        let mut state = el.state.lock();
        state
            .termination_gate
            .get_or_insert_with(crate::element::TerminationGate::new)
            .clone()
    };

    // As in `join_deadline`: `wait` is a cancellation point for its caller,
    // who is waiting on someone else's gate, so cancellation has to be
    // polled here rather than delivered via that gate's own notification.
    if gate.wait_interruptible(deadline, || crate::cancel::is_cancel_pending(&caller)) {
        Ok(WaitOutcome::Terminated)
    } else {
        crate::cancel::cancellation_point(&caller);
        Ok(WaitOutcome::TimedOut)
    }
}

/// Sleep for `ms` milliseconds, waking early (returning `Ok`) if a signal is
/// delivered partway through, matching `nanosleep`'s `EINTR` behavior
/// (section 8's "sleep is interruptible by signal" property). Also a
/// cancellation point.
pub fn sleep_ms(element: &Arc<ThreadElement>, ms: u64) -> RuntimeResult<()> {
    const POLL_SLICE: Duration = Duration::from_millis(20);
    let deadline = Instant::now() + Duration::from_millis(ms);
    loop {
        crate::cancel::cancellation_point(element);
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        let slice = POLL_SLICE.min(deadline - now);
        {
            let mut state = element.state.lock();
            element.pipe_cv.wait_for(&mut state, slice);
        }
        if crate::signal::deliver_pending(element) {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn spawn_join_returns_exit_value() {
        let id = spawn(|| 42, SpawnFlags::default(), None).unwrap();
        let value = join(id).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn explicit_exit_call_is_honored() {
        let id = spawn(
            || {
                exit(7);
                #[allow(unreachable_code)]
                99
            },
            SpawnFlags::default(),
            None,
        )
        .unwrap();
        assert_eq!(join(id).unwrap(), 7);
    }

    #[test]
    fn second_join_is_rejected() {
        let id = spawn(|| 1, SpawnFlags::default(), None).unwrap();
        assert_eq!(join(id).unwrap(), 1);
        // The element was already reclaimed by the first join.
        assert!(matches!(join(id), Err(RuntimeError::NotFound)));
    }

    #[test]
    fn detached_thread_cannot_be_joined() {
        let flags = SpawnFlags {
            detach: true,
            ..Default::default()
        };
        let id = spawn(|| 1, flags, None).unwrap();
        assert!(matches!(
            join(id),
            Err(RuntimeError::InvalidArgument(_))
        ));
        // Give the background reclaim task a moment to run so the test
        // doesn't leak a slot into later tests' small-id space.
        std::thread::sleep(Duration::from_millis(100));
    }

    #[test]
    fn on_exit_callbacks_run_in_reverse_registration_order() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let order2 = order.clone();
        let id = spawn(
            move || {
                let rt = runtime::global();
                let element = rt.current_element();
                for i in 0..3 {
                    let order3 = order2.clone();
                    on_exit(&element, Box::new(move || order3.lock().unwrap().push(i)));
                }
                0
            },
            SpawnFlags::default(),
            None,
        )
        .unwrap();
        join(id).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn cancellation_during_entry_runs_cleanup_and_exits_cleanly() {
        let ran_cleanup = Arc::new(StdMutex::new(false));
        let ran_cleanup2 = ran_cleanup.clone();
        let id = spawn(
            move || {
                let rt = runtime::global();
                let element = rt.current_element();
                cancel::cleanup_push(
                    &element,
                    Box::new(move || *ran_cleanup2.lock().unwrap() = true),
                    "test",
                );
                loop {
                    cancel::cancellation_point(&element);
                    std::thread::sleep(Duration::from_millis(5));
                }
            },
            SpawnFlags::default(),
            None,
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        cancel::cancel(&runtime::global().registry, id).unwrap();
        let value = join(id).unwrap();
        assert_eq!(value, 0);
        assert!(*ran_cleanup.lock().unwrap());
    }

    #[test]
    fn self_join_is_rejected_as_deadlock() {
        let result = Arc::new(StdMutex::new(None));
        let result2 = result.clone();
        let id = spawn(
            move || {
                // `id` isn't known inside the closure yet, so resolve the
                // calling thread's own small id instead.
                let rt = runtime::global();
                let self_id = rt.current_element().small_id;
                *result2.lock().unwrap() = Some(join(self_id));
                0
            },
            SpawnFlags::default(),
            None,
        )
        .unwrap();
        join(id).unwrap();
        assert!(matches!(
            result.lock().unwrap().take(),
            Some(Err(RuntimeError::DeadlockDetected))
        ));
    }

    #[test]
    fn wait_until_observes_detached_exit_without_reaping() {
        let flags = SpawnFlags {
            detach: true,
            ..Default::default()
        };
        let id = spawn(|| 5, flags, None).unwrap();
        let outcome = wait_until(id, None).unwrap();
        assert_eq!(outcome, WaitOutcome::Terminated);
        // A second waiter may still rendezvous on the same target.
        assert_eq!(wait_until(id, None).unwrap(), WaitOutcome::Terminated);
        std::thread::sleep(Duration::from_millis(100));
    }

    #[test]
    fn wait_until_times_out_before_exit() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let id = spawn(
            move || {
                rx.recv().ok();
                0
            },
            SpawnFlags::default(),
            None,
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(wait_until(id, Some(deadline)).unwrap(), WaitOutcome::TimedOut);
        tx.send(()).unwrap();
        assert_eq!(join(id).unwrap(), 0);
    }

    #[test]
    fn sleep_returns_after_deadline_without_a_signal() {
        let id = spawn(
            || {
                let rt = runtime::global();
                let element = rt.current_element();
                sleep_ms(&element, 10).unwrap();
                0
            },
            SpawnFlags::default(),
            None,
        )
        .unwrap();
        join(id).unwrap();
    }
}
