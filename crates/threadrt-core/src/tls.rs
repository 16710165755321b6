//! Thread-local storage (Design Notes: "two APIs").
//!
//! - [`private_set`]/[`private_get`]/[`private_delete`]: a flexible key-value
//!   map keyed by an arbitrary `usize`, each value carrying its own optional
//!   `(free_fn, free_arg)` pair, backed by [`crate::element::ThreadElement::private_map`].
//! - [`Key`]/[`key_create`]/[`key_delete`]/[`slot_get`]/[`slot_set`]: a sparse
//!   two-level array indexed by a key allocated from a single global
//!   registry, with one destructor per key rather than per value. This is
//!   the faster path: no hashing, no per-value allocation.
//!
//! Both drain on thread exit via [`drain_all`], called from
//! [`crate::thread::exit_internal`].

use parking_lot::Mutex;

use crate::element::{PrivateEntry, ThreadElement};
use crate::error::{RuntimeError, RuntimeResult};

/// Keys per inner block of the sparse two-level array.
pub const TLS_L2: usize = 32;
/// Maximum number of outer blocks, i.e. the total key space is
/// `TLS_L1 * TLS_L2`.
pub const TLS_L1: usize = 64;
/// Total number of keys the global registry can hand out.
pub const TLS_MAX_KEYS: usize = TLS_L1 * TLS_L2;

/// A key allocated from the global TLS registry, naming one destructor-bearing
/// slot in every thread's sparse array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key(u32);

struct Slot {
    in_use: bool,
    destructor: Option<fn(usize)>,
}

struct KeyRegistry {
    slots: Vec<Slot>,
}

static REGISTRY: Mutex<Option<KeyRegistry>> = Mutex::new(None);

fn with_registry<R>(f: impl FnOnce(&mut KeyRegistry) -> R) -> R {
    let mut guard = REGISTRY.lock();
    let registry = guard.get_or_insert_with(|| KeyRegistry {
        slots: (0..TLS_MAX_KEYS)
            .map(|_| Slot {
                in_use: false,
                destructor: None,
            })
            .collect(),
    });
    f(registry)
}

/// Allocate a new key with an optional fixed destructor, called with the
/// slot's value on every thread that set one, at that thread's exit.
pub fn key_create(destructor: Option<fn(usize)>) -> RuntimeResult<Key> {
    with_registry(|reg| {
        for (idx, slot) in reg.slots.iter_mut().enumerate() {
            if !slot.in_use {
                slot.in_use = true;
                slot.destructor = destructor;
                return Ok(Key(idx as u32));
            }
        }
        Err(RuntimeError::ResourceExhausted("thread-local key space exhausted"))
    })
}

/// Release a key. Does not clear any thread's stored value for it (matching
/// `pthread_key_delete`'s contract: destructors are not run and existing
/// per-thread values simply become unreachable through this API).
pub fn key_delete(key: Key) {
    with_registry(|reg| {
        if let Some(slot) = reg.slots.get_mut(key.0 as usize) {
            slot.in_use = false;
            slot.destructor = None;
        }
    });
}

fn split(key: Key) -> (usize, usize) {
    let idx = key.0 as usize;
    (idx / TLS_L2, idx % TLS_L2)
}

/// Read this element's value for `key`, or `None` if never set.
pub fn slot_get(element: &ThreadElement, key: Key) -> Option<usize> {
    let (outer, inner) = split(key);
    let slots = element.local_slots.lock();
    slots.get(outer)?.as_ref()?[inner]
}

/// Write this element's value for `key`, allocating the backing block on
/// first use in this outer range.
pub fn slot_set(element: &ThreadElement, key: Key, value: usize) {
    let (outer, inner) = split(key);
    let mut slots = element.local_slots.lock();
    if slots.len() <= outer {
        slots.resize_with(outer + 1, || None);
    }
    let block = slots[outer].get_or_insert_with(|| Box::new([None; TLS_L2]));
    block[inner] = Some(value);
}

/// Set a thread-private value with its own per-value destructor, keyed by an
/// arbitrary caller-chosen `usize` (not allocated from the key registry).
pub fn private_set(
    element: &ThreadElement,
    key: usize,
    value: usize,
    free_fn: Option<fn(usize, usize)>,
    free_arg: usize,
) {
    element.private_map.lock().insert(
        key,
        PrivateEntry {
            value,
            free_fn,
            free_arg,
        },
    );
}

pub fn private_get(element: &ThreadElement, key: usize) -> Option<usize> {
    element.private_map.lock().get(&key).map(|e| e.value)
}

pub fn private_delete(element: &ThreadElement, key: usize) {
    element.private_map.lock().remove(&key);
}

/// Drain both TLS stores at thread exit, invoking every registered
/// destructor/free-routine. Called once from
/// [`crate::thread::exit_internal`], per the Design Notes' "clear
/// thread-private and thread-local values" step, skipping entries marked
/// "keep" (callers that never wanted teardown simply omit a destructor).
pub fn drain_all(element: &ThreadElement) {
    let private_entries: Vec<PrivateEntry> = {
        let mut map = element.private_map.lock();
        map.drain().map(|(_, v)| v).collect()
    };
    for entry in private_entries {
        if let Some(f) = entry.free_fn {
            f(entry.value, entry.free_arg);
        }
    }

    let blocks: Vec<(usize, Box<[Option<usize>; TLS_L2]>)> = {
        let mut slots = element.local_slots.lock();
        slots
            .drain(..)
            .enumerate()
            .filter_map(|(outer, block)| block.map(|b| (outer, b)))
            .collect()
    };
    for (outer, block) in blocks {
        for (inner, value) in block.iter().enumerate() {
            let Some(value) = value else { continue };
            let key = Key((outer * TLS_L2 + inner) as u32);
            let destructor = with_registry(|reg| reg.slots.get(key.0 as usize).and_then(|s| s.destructor));
            if let Some(f) = destructor {
                f(*value);
            }
        }
    }
}
