//! The process-wide runtime instance: registry, QID cache, lock accountant,
//! and event queue, tied together and reachable as a lazily-initialized
//! global (Design Notes: "Global mutable state ... initialize once via
//! `OnceLock`, never torn down").
//!
//! The first thread to touch the runtime (via [`global`] or [`with_config`])
//! becomes small id 0, the immortal main-thread element. In a real process
//! this is overwhelmingly the actual main thread, since nothing else
//! typically calls into the runtime before `main` starts running; nothing
//! in this port enforces it more strictly than that (see `DESIGN.md`).

use std::sync::OnceLock;

use crate::config::RuntimeConfig;
use crate::element::{Cancelable, MAIN_SMALL_ID, ThreadElement, ThreadKind};
use crate::event_queue::EventQueue;
use crate::lock_accountant::LockAccountant;
use crate::qid::{QidCache, current_qid};
use crate::registry::Registry;

/// Everything the thread runtime needs that is process-wide rather than
/// per-thread.
pub struct Runtime {
    pub config: RuntimeConfig,
    pub registry: Registry,
    pub qid_cache: QidCache,
    pub accountant: LockAccountant,
    pub event_queue: EventQueue,
}

impl Runtime {
    fn new(config: RuntimeConfig) -> Self {
        let registry = Registry::new(config.n_max);
        let qid_cache = QidCache::new(config.n_max * 2);

        let qid = current_qid();
        let id = registry
            .reserve_id()
            .expect("n_max must be large enough to hold at least the main thread");
        debug_assert_eq!(id, MAIN_SMALL_ID);
        let main = std::sync::Arc::new(ThreadElement::new(
            id,
            ThreadKind::Main,
            std::thread::current().id(),
            Cancelable::No,
            qid,
            qid,
        ));
        registry.insert(id, main);
        qid_cache.insert(qid, id);

        let event_queue = EventQueue::new();

        Runtime {
            config,
            registry,
            qid_cache,
            accountant: LockAccountant::new(),
            event_queue,
        }
    }

    /// Resolve the calling thread's element, discovering or widening its
    /// range as needed (section 4.3).
    pub fn current_element(&self) -> std::sync::Arc<ThreadElement> {
        crate::discovery::get_element(&self.registry, &self.qid_cache)
            .expect("discovery only fails when the small-id space is exhausted")
    }
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Build the global runtime with an explicit configuration. Must be called,
/// if at all, before any other API in this crate runs on any thread;
/// subsequent calls are ignored and return the instance built from the
/// first caller's configuration (matching [`OnceLock`]'s semantics).
pub fn with_config(config: RuntimeConfig) -> &'static Runtime {
    RUNTIME.get_or_init(|| Runtime::new(config))
}

/// The global runtime instance, built with [`RuntimeConfig::default`] on
/// first access if [`with_config`] was never called.
pub fn global() -> &'static Runtime {
    RUNTIME.get_or_init(|| Runtime::new(RuntimeConfig::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // `Runtime` is process-global by design, so these tests build their own
    // standalone instances rather than touching `global()`/`with_config()`,
    // which would leak state into every other test in the binary.
    #[test]
    fn new_runtime_registers_main_thread_at_id_zero() {
        let rt = Runtime::new(RuntimeConfig::default());
        let main = rt.registry.get(MAIN_SMALL_ID).unwrap();
        assert!(main.is_main());
    }

    #[test]
    fn current_element_is_stable_across_calls() {
        let rt = Runtime::new(RuntimeConfig::default());
        let a = rt.current_element();
        let b = rt.current_element();
        assert_eq!(a.small_id, b.small_id);
    }
}
