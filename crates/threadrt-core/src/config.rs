//! Runtime configuration.
//!
//! Every tunable named throughout this crate's design (small-id space size,
//! lock-stack capacity, watchdog timeouts, ...) is collected here so an
//! embedding daemon can override them at startup instead of the runtime
//! reaching for hardcoded constants scattered through the modules.

use std::time::Duration;

/// Highest valid signal number. Signals are numbered `0..=30` (31 signals
/// total, `sig ∈ [0,31)`); signal 0 is the existence-probe signal and is
/// never latched or delivered to a handler.
pub const MAX_SIGNAL: u32 = 30;

/// Default maximum number of concurrently tracked thread elements.
pub const DEFAULT_N_MAX: usize = 4096;

/// Default per-thread lock stack capacity.
pub const DEFAULT_LOCK_STACK_CAPACITY: usize = 320;

/// Tunables for a [`crate::runtime::Runtime`] instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Size of the dense small-id space. Once exhausted, new threads wait
    /// for a reusable slot instead of failing outright.
    pub n_max: usize,
    /// Per-thread bounded LIFO lock-stack depth. Exceeding this is a fatal
    /// programming error (too many nested tracked locks).
    pub lock_stack_capacity: usize,
    /// Upper bound on slots held in `reusable` state before `spawn` starts
    /// waiting (with backoff) for the registry to drain.
    pub max_reusable_slots: usize,
    /// Backoff schedule used while waiting for a reusable slot.
    pub reusable_wait_backoff: Duration,
    /// Number of backoff rounds attempted before reporting resource
    /// exhaustion to the caller.
    pub reusable_wait_rounds: u32,
    /// Wall-clock interval after which a suspended thread's watchdog fires
    /// and aborts the process with a diagnostic dump.
    pub suspend_watchdog_timeout: Duration,
    /// How long a detached thread's element is held before being marked
    /// reusable, to let the host's own thread-exit bookkeeping settle.
    pub detached_reclaim_hold: Duration,
    /// How long the main thread is allowed to block before the event queue
    /// fires a diagnostic panic (the main thread is not expected to block).
    pub main_thread_block_timeout: Duration,
    /// Default stack size requested from the host for created threads.
    pub default_stack_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            n_max: DEFAULT_N_MAX,
            lock_stack_capacity: DEFAULT_LOCK_STACK_CAPACITY,
            max_reusable_slots: 256,
            reusable_wait_backoff: Duration::from_millis(1),
            reusable_wait_rounds: 200,
            suspend_watchdog_timeout: Duration::from_secs(30),
            detached_reclaim_hold: Duration::from_millis(50),
            main_thread_block_timeout: Duration::from_secs(300),
            default_stack_bytes: 2 * 1024 * 1024,
        }
    }
}
