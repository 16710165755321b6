//! Per-thread record: the data model described in section 3.
//!
//! One [`ThreadElement`] exists per thread known to the runtime (created,
//! discovered, or the immortal main thread). Immutable fields (`small_id`,
//! `native`, `kind`) are read without locking; everything that other threads
//! may observe or mutate lives behind `state`, a single per-element lock, per
//! invariant 7 in section 3 ("each element's mutable cross-thread fields are
//! written under the element's lock").

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::config::MAX_SIGNAL;

/// Dense integer identifying a thread element, stable for the life of the
/// element. `0` is always the main thread.
pub type SmallId = u32;

/// The main thread's small id, per invariant in section 3's Lifecycle.
pub const MAIN_SMALL_ID: SmallId = 0;

/// How an element came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    /// Launched via [`crate::thread::spawn`].
    Created,
    /// First seen entering an instrumented primitive without having been
    /// created by the runtime.
    Discovered,
    /// The immortal `small_id == 0` element.
    Main,
}

/// The closed set of lock primitive variants the accountant tracks (section
/// 4.12 / Design Notes "Polymorphism").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Spin,
    Mutex,
    Read,
    Write,
}

/// A single entry in a thread's lock stack, or the lock it is currently
/// waiting to acquire.
#[derive(Debug, Clone, Serialize)]
pub struct LockFrame {
    pub address: usize,
    pub kind: LockKind,
    pub file: &'static str,
    pub line: u32,
}

/// A registered cleanup handler (section 4.7).
pub struct CleanupEntry {
    pub f: Box<dyn FnOnce() + Send>,
    /// Stack pointer recorded at push time, used to detect obsolete entries
    /// (a `cleanup_pop` whose caller frame is shallower than the push site).
    pub registration_sp: usize,
    pub site: &'static str,
}

/// An exit callback registered via [`crate::thread::on_exit`], delivered in
/// reverse registration order (a FIFO queue popped from the front reads as a
/// LIFO relative to registration, matching the spec's "delivered reverse of
/// registration" wording).
pub struct ExitCallback {
    pub f: Box<dyn FnOnce() + Send>,
}

/// Cancelability permission, fixed for the life of the element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancelable {
    /// May toggle `cancel_state` between enabled and disabled.
    Yes,
    /// Main and discovered threads: cancellation requests are recorded but
    /// never delivered.
    No,
}

/// Whether cancellation delivery is currently enabled for the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    Enabled,
    Disabled,
}

/// Per-signal handler (Design Notes: "plain callbacks plus two sentinels").
#[derive(Clone, Copy)]
pub enum SignalHandler {
    Default,
    Ignore,
    Handler(fn(u32)),
}

/// Reference-counted rendezvous released when a thread exits (Design Notes:
/// "Cyclic references").
pub struct TerminationGate {
    exited: Mutex<bool>,
    cv: Condvar,
}

impl TerminationGate {
    pub fn new() -> Arc<Self> {
        Arc::new(TerminationGate {
            exited: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    /// Release all waiters. Idempotent.
    pub fn signal(&self) {
        let mut exited = self.exited.lock();
        *exited = true;
        self.cv.notify_all();
    }

    /// Block until the gate is signalled or `deadline` passes.
    pub fn wait(&self, deadline: Option<std::time::Instant>) -> bool {
        self.wait_interruptible(deadline, || false)
    }

    /// As [`TerminationGate::wait`], but polls in short slices and returns
    /// early (reporting not-signalled) once `interrupt` returns true between
    /// polls. Used by `join`/`wait_until`, which wait on a *different*
    /// thread's gate and so cannot rely on their own element's `pipe_cv`
    /// being notified when the caller itself is cancelled.
    pub fn wait_interruptible(
        &self,
        deadline: Option<std::time::Instant>,
        mut interrupt: impl FnMut() -> bool,
    ) -> bool {
        const POLL_SLICE: std::time::Duration = std::time::Duration::from_millis(20);
        let mut exited = self.exited.lock();
        loop {
            if *exited {
                return true;
            }
            if interrupt() {
                return false;
            }
            let now = std::time::Instant::now();
            if let Some(d) = deadline {
                if now >= d {
                    return false;
                }
            }
            let slice = match deadline {
                Some(d) => POLL_SLICE.min(d - now),
                None => POLL_SLICE,
            };
            self.cv.wait_for(&mut exited, slice);
        }
    }
}

/// Mutable, cross-thread-visible state of an element. Guarded as a unit by
/// [`ThreadElement::state`].
pub struct ElementState {
    // --- stack bounds (section 3 / invariant 2-3) ---
    pub low_qid: u64,
    pub high_qid: u64,
    pub top_qid: u64,
    pub low_sig_qid: Option<u64>,
    pub high_sig_qid: Option<u64>,
    pub stack_base: Option<usize>,
    pub stack_size: Option<usize>,
    pub stack_owned: bool,

    // --- lock accounting (section 4.4) ---
    pub lock_stack: Vec<LockFrame>,
    pub waiting: Option<LockFrame>,

    // --- block/unblock (section 4.6) ---
    pub blocked: bool,
    pub unblocked: bool,
    pub signalled: u32,
    pub unblock_events: u64,
    pub sleeping: bool,

    // --- join/exit (section 4.10-4.11) ---
    pub join_pending: bool,
    pub join_requested: bool,
    pub joining_id: Option<SmallId>,
    pub exit_value: Option<usize>,
    pub detached: bool,
    pub reusable: bool,
    pub exited: bool,
    pub exit_started: bool,
    pub termination_gate: Option<Arc<TerminationGate>>,

    // --- cleanup / exit callbacks (section 4.7 / 4.10) ---
    pub cleanup_stack: Vec<CleanupEntry>,
    pub exit_callbacks: VecDeque<ExitCallback>,

    // --- cancellation (section 4.7) ---
    pub cancel_state: CancelState,
    pub cancelled: bool,
}

impl ElementState {
    fn new(low_qid: u64, high_qid: u64) -> Self {
        ElementState {
            low_qid,
            high_qid,
            top_qid: high_qid,
            low_sig_qid: None,
            high_sig_qid: None,
            stack_base: None,
            stack_size: None,
            stack_owned: false,
            lock_stack: Vec::new(),
            waiting: None,
            blocked: false,
            unblocked: false,
            signalled: 0,
            unblock_events: 0,
            sleeping: false,
            join_pending: false,
            join_requested: false,
            joining_id: None,
            exit_value: None,
            detached: false,
            reusable: false,
            exited: false,
            exit_started: false,
            termination_gate: None,
            cleanup_stack: Vec::new(),
            exit_callbacks: VecDeque::new(),
            cancel_state: CancelState::Enabled,
            cancelled: false,
        }
    }
}

/// Per-thread signal state (section 4.5). Kept separate from [`ElementState`]
/// because signal delivery is hot enough (checked at every safe point) to
/// benefit from its own, narrower lock.
pub struct SignalState {
    pub mask: u32,
    pub pending: u32,
    pub handlers: [SignalHandler; (MAX_SIGNAL + 1) as usize],
    pub generation: u64,
    pub in_signal_handler: u32,
}

impl SignalState {
    fn new() -> Self {
        SignalState {
            mask: 0,
            pending: 0,
            handlers: [SignalHandler::Default; (MAX_SIGNAL + 1) as usize],
            generation: 0,
            in_signal_handler: 0,
        }
    }
}

/// Thread-private key-value storage (Design Notes: "flexible key-value map").
pub struct PrivateEntry {
    pub value: usize,
    pub free_fn: Option<fn(usize, usize)>,
    pub free_arg: usize,
}

/// The runtime's per-thread record.
pub struct ThreadElement {
    pub small_id: SmallId,
    pub kind: ThreadKind,
    pub native: std::thread::ThreadId,
    pub cancelable: Cancelable,

    pub state: Mutex<ElementState>,
    pub signal: Mutex<SignalState>,
    pub private_map: Mutex<HashMap<usize, PrivateEntry>>,
    /// Sparse two-level array backing [`crate::tls`]'s fixed-key storage.
    /// Outer vector is indexed by `key / TLS_L2`; inner blocks are
    /// allocated lazily the first time a key in their range is set.
    pub local_slots: Mutex<Vec<Option<Box<[Option<usize>; crate::tls::TLS_L2]>>>>,
    /// Condition variable backing block/unblock (4.6), suspension (4.8),
    /// and signal delivery (4.5) wakeups. Paired with `state` rather than a
    /// real self-pipe: portable across hosts without file descriptors,
    /// at the cost of the fd-consumption contract named in section 6 (see
    /// `DESIGN.md`).
    pub pipe_cv: Condvar,

    /// Advisory suspension request count (section 4.8). Nonnegative;
    /// incremented by `suspend_others`, decremented by `unsuspend_others`.
    pub suspend_depth: AtomicI64,
    /// Guards against recursive entry into the suspension critical section
    /// on the thread that issued `suspend_others`.
    pub suspending: AtomicBool,
    /// Set by this element once it has parked itself in response to a
    /// suspend request; cleared on resume. Lets `suspend_others` wait for
    /// actual quiescence rather than just having posted the request.
    pub suspended_ack: AtomicBool,

    /// Last QID observed by the discovery engine's cache confirmation check
    /// (section 4.1).
    pub last_qid: AtomicU64,
}

impl ThreadElement {
    /// Construct a brand-new element. `low_qid`/`high_qid` bootstrap the
    /// stack-bounds tracking; discovered threads pass a single-page range
    /// that [`crate::discovery`] widens as more of the stack is observed.
    pub fn new(
        small_id: SmallId,
        kind: ThreadKind,
        native: std::thread::ThreadId,
        cancelable: Cancelable,
        low_qid: u64,
        high_qid: u64,
    ) -> Self {
        ThreadElement {
            small_id,
            kind,
            native,
            cancelable,
            state: Mutex::new(ElementState::new(low_qid, high_qid)),
            signal: Mutex::new(SignalState::new()),
            private_map: Mutex::new(HashMap::new()),
            local_slots: Mutex::new(Vec::new()),
            pipe_cv: Condvar::new(),
            suspend_depth: AtomicI64::new(0),
            suspending: AtomicBool::new(false),
            suspended_ack: AtomicBool::new(false),
            last_qid: AtomicU64::new(low_qid),
        }
    }

    /// True if this element's QID range covers `qid`.
    pub fn covers(&self, qid: u64) -> bool {
        let state = self.state.lock();
        !state.exited && qid >= state.low_qid && qid <= state.high_qid
    }

    pub fn is_main(&self) -> bool {
        matches!(self.kind, ThreadKind::Main)
    }

    pub fn is_discovered(&self) -> bool {
        matches!(self.kind, ThreadKind::Discovered)
    }

    /// Current suspend-depth snapshot.
    pub fn suspend_requested(&self) -> bool {
        self.suspend_depth.load(Ordering::Acquire) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(id: SmallId) -> ThreadElement {
        ThreadElement::new(
            id,
            ThreadKind::Discovered,
            std::thread::current().id(),
            Cancelable::No,
            10,
            10,
        )
    }

    #[test]
    fn covers_checks_range_and_exited_flag() {
        let el = make(1);
        assert!(el.covers(10));
        assert!(!el.covers(11));
        el.state.lock().exited = true;
        assert!(!el.covers(10));
    }

    #[test]
    fn termination_gate_wait_returns_after_signal() {
        let gate = TerminationGate::new();
        let gate2 = gate.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            gate2.signal();
        });
        let ok = gate.wait(None);
        assert!(ok);
        handle.join().unwrap();
    }

    #[test]
    fn termination_gate_wait_with_deadline_times_out() {
        let gate = TerminationGate::new();
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(20);
        let ok = gate.wait(Some(deadline));
        assert!(!ok);
    }

    #[test]
    fn suspend_requested_tracks_depth() {
        let el = make(2);
        assert!(!el.suspend_requested());
        el.suspend_depth.fetch_add(1, Ordering::AcqRel);
        assert!(el.suspend_requested());
    }
}
