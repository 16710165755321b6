//! Discovery engine (section 4.3): the hot path that maps "the thread
//! currently running this code" to its [`ThreadElement`].

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::element::{Cancelable, SmallId, ThreadElement, ThreadKind};
use crate::error::RuntimeResult;
use crate::qid::{QidCache, current_qid};
use crate::registry::Registry;

/// `get_element()`: find or create the calling thread's element.
///
/// 1. Compute the QID of a local variable's address.
/// 2. Probe the cache; a hit that still covers the QID wins.
/// 3. Fall back to a full range scan; extend a discovered element's range
///    to cover this QID (created elements have fixed bounds).
/// 4. If nothing matches, allocate a brand-new discovered element.
pub fn get_element(registry: &Registry, cache: &QidCache) -> RuntimeResult<Arc<ThreadElement>> {
    let qid = current_qid();
    get_element_for_qid(registry, cache, qid)
}

fn get_element_for_qid(
    registry: &Registry,
    cache: &QidCache,
    qid: u64,
) -> RuntimeResult<Arc<ThreadElement>> {
    if let Some(id) = cache.lookup(qid)
        && let Some(el) = registry.get(id)
        && el.covers(qid)
    {
        el.last_qid.store(qid, std::sync::atomic::Ordering::Release);
        return Ok(el);
    }

    for el in registry.all() {
        if el.covers(qid) {
            if el.is_discovered() {
                widen_range(&el, qid);
            }
            cache.insert(qid, el.small_id);
            return Ok(el);
        }
    }

    create_discovered(registry, cache, qid)
}

fn widen_range(el: &Arc<ThreadElement>, qid: u64) {
    let mut state = el.state.lock();
    if qid < state.low_qid {
        state.low_qid = qid;
    }
    if qid > state.high_qid {
        state.high_qid = qid;
    }
    if qid > state.top_qid {
        state.top_qid = qid;
    }
}

fn create_discovered(
    registry: &Registry,
    cache: &QidCache,
    qid: u64,
) -> RuntimeResult<Arc<ThreadElement>> {
    let id = registry.reserve_id()?;
    let element = Arc::new(ThreadElement::new(
        id,
        ThreadKind::Discovered,
        std::thread::current().id(),
        Cancelable::No,
        qid,
        qid,
    ));
    registry.insert(id, element.clone());
    cache.insert(qid, id);
    Ok(element)
}

/// Reserve and install an element for a thread the runtime itself is about
/// to spawn, *before* the host thread starts running. The trampoline fills
/// in the real QID range once it is executing (see [`bind_created_thread`]).
pub fn reserve_created(
    registry: &Registry,
    cancelable: Cancelable,
) -> RuntimeResult<(SmallId, Arc<ThreadElement>)> {
    let id = registry.reserve_id()?;
    // Placeholder native id; overwritten once the spawned thread starts by
    // constructing a fresh element via `bind_created_thread`, which is
    // simpler and avoids mutating an immutable field. We still reserve the
    // slot up front so `spawn` can report the assigned small id to the
    // caller before the thread body runs.
    let element = Arc::new(ThreadElement::new(
        id,
        ThreadKind::Created,
        std::thread::current().id(),
        cancelable,
        0,
        0,
    ));
    registry.insert(id, element.clone());
    Ok((id, element))
}

/// Called from inside the trampoline once the new host thread is running:
/// records its real QID range, ties the element to its native thread id,
/// and invalidates any discovered element whose range now overlaps (a dead
/// thread whose stack was reused, per section 4.3).
pub fn bind_created_thread(
    registry: &Registry,
    cache: &QidCache,
    stack_bytes: usize,
    element: &Arc<ThreadElement>,
) {
    let qid = current_qid();
    let low = qid.saturating_sub((stack_bytes as u64) >> crate::qid::PAGE_SHIFT);
    {
        let mut state = element.state.lock();
        state.low_qid = low;
        state.high_qid = qid;
        state.top_qid = qid;
    }
    element
        .last_qid
        .store(qid, std::sync::atomic::Ordering::Release);
    cache.insert(qid, element.small_id);
    // Section 4.1: "the cache is purged of entries whose recorded QID now
    // falls in that range but references a different small_id" — a stale
    // entry from whatever thread previously owned these stack pages.
    cache.purge_stale_range(low, qid, element.small_id);

    for other in registry.others(element.small_id) {
        if !other.is_discovered() {
            continue;
        }
        let overlaps = {
            let st = other.state.lock();
            !(st.high_qid < low || st.low_qid > qid)
        };
        if overlaps {
            let mut st = other.state.lock();
            st.exited = true;
            drop(st);
            crate::diagnostics::warn(
                "discovered_stack_reuse",
                Some(other.small_id),
                "discovered element's QID range collided with a newly created \
thread; the discovered thread's stack was likely reused without the runtime \
observing its exit",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> (Registry, QidCache) {
        (Registry::new(16), QidCache::new(32))
    }

    #[test]
    fn discovers_calling_thread_exactly_once() {
        let (registry, cache) = fresh();
        let a = get_element(&registry, &cache).unwrap();
        let b = get_element(&registry, &cache).unwrap();
        assert_eq!(a.small_id, b.small_id);
    }

    #[test]
    fn different_threads_get_different_elements() {
        let registry = Arc::new(Registry::new(16));
        let cache = Arc::new(QidCache::new(32));
        let r2 = registry.clone();
        let c2 = cache.clone();
        let main_el = get_element(&registry, &cache).unwrap();
        let handle = std::thread::spawn(move || get_element(&r2, &c2).unwrap().small_id);
        let other_id = handle.join().unwrap();
        assert_ne!(main_el.small_id, other_id);
    }

    #[test]
    fn bind_created_thread_invalidates_overlapping_discovered() {
        let config = RuntimeConfig::default();
        let (registry, cache) = fresh();
        // Simulate a discovered element squatting on a QID range.
        let qid = current_qid();
        let (_id, discovered) = {
            let id = registry.reserve_id().unwrap();
            let el = Arc::new(ThreadElement::new(
                id,
                ThreadKind::Discovered,
                std::thread::current().id(),
                Cancelable::No,
                qid,
                qid,
            ));
            registry.insert(id, el.clone());
            (id, el)
        };
        let (_new_id, created) = reserve_created(&registry, Cancelable::Yes).unwrap();
        bind_created_thread(&registry, &cache, config.default_stack_bytes, &created);
        assert!(discovered.state.lock().exited);
    }
}
