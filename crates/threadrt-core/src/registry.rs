//! Element registry (section 4.2): a fixed-length table of thread elements
//! indexed by small id, plus the host `JoinHandle` for created threads.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

use crate::element::{SmallId, ThreadElement};
use crate::error::{RuntimeError, RuntimeResult};

/// Two parallel arrays indexed by small id: the element, and (for created
/// threads) the host join handle. Reads never take the insertion mutex;
/// writes (insert / reclaim) do.
pub struct Registry {
    slots: Vec<RwLock<Option<Arc<ThreadElement>>>>,
    handles: Vec<Mutex<Option<JoinHandle<()>>>>,
    next_id: AtomicU32,
    n_max: usize,
    /// Serializes element creation. Per section 4.2, this must never be held
    /// across an allocation that could itself call back into the runtime —
    /// callers take it only around the slot-table writes, not around
    /// `Arc::new`/`Box::new` of the element's own payload.
    insertion_mutex: Mutex<()>,
    reusable: Mutex<VecDeque<SmallId>>,
}

impl Registry {
    pub fn new(n_max: usize) -> Self {
        let mut slots = Vec::with_capacity(n_max);
        let mut handles = Vec::with_capacity(n_max);
        for _ in 0..n_max {
            slots.push(RwLock::new(None));
            handles.push(Mutex::new(None));
        }
        Registry {
            slots,
            handles,
            next_id: AtomicU32::new(0),
            n_max,
            insertion_mutex: Mutex::new(()),
            reusable: Mutex::new(VecDeque::new()),
        }
    }

    pub fn n_max(&self) -> usize {
        self.n_max
    }

    /// Look up an element by small id without taking the insertion mutex.
    pub fn get(&self, id: SmallId) -> Option<Arc<ThreadElement>> {
        self.slots.get(id as usize)?.read().clone()
    }

    /// Reserve the next small id: a reusable slot if one is available,
    /// otherwise the next unused dense index. Returns `ResourceExhausted`
    /// if the space is full and nothing is reusable; callers that want to
    /// wait for a reusable slot retry with backoff (see `thread::spawn`).
    pub fn reserve_id(&self) -> RuntimeResult<SmallId> {
        let _guard = self.insertion_mutex.lock();
        if let Some(id) = self.reusable.lock().pop_front() {
            return Ok(id);
        }
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        if (id as usize) >= self.n_max {
            // Undo: we can't hand out an id past n_max. Leave next_id
            // saturated so further calls also fail fast without racing
            // the counter back down.
            self.next_id.store(self.n_max as u32, Ordering::Release);
            return Err(RuntimeError::ResourceExhausted("small-id space exhausted"));
        }
        Ok(id)
    }

    /// Publish an element into its reserved slot.
    pub fn insert(&self, id: SmallId, element: Arc<ThreadElement>) {
        let _guard = self.insertion_mutex.lock();
        *self.slots[id as usize].write() = Some(element);
    }

    /// Attach a created thread's join handle to its slot.
    pub fn set_handle(&self, id: SmallId, handle: JoinHandle<()>) {
        *self.handles[id as usize].lock() = Some(handle);
    }

    /// Take ownership of a created thread's join handle (consumed by
    /// `join`).
    pub fn take_handle(&self, id: SmallId) -> Option<JoinHandle<()>> {
        self.handles[id as usize].lock().take()
    }

    /// Return a small id to the reusable pool and clear its slot. Called
    /// once a thread's element has been fully torn down and nothing else
    /// references it.
    pub fn reclaim(&self, id: SmallId) {
        let _guard = self.insertion_mutex.lock();
        *self.slots[id as usize].write() = None;
        self.reusable.lock().push_back(id);
    }

    /// Number of ids currently parked in the reusable pool (used by tests
    /// verifying detached-thread reclamation, section 8 scenario 4).
    pub fn reusable_count(&self) -> usize {
        self.reusable.lock().len()
    }

    /// All currently-live elements other than `exclude`. Used by
    /// suspension (4.8) and deadlock dumping (4.4).
    pub fn others(&self, exclude: SmallId) -> Vec<Arc<ThreadElement>> {
        let mut out = Vec::new();
        for (idx, slot) in self.slots.iter().enumerate() {
            if idx as u32 == exclude {
                continue;
            }
            if let Some(el) = slot.read().clone() {
                out.push(el);
            }
        }
        out
    }

    /// All currently-live elements, used by the discovery engine's QID-range
    /// fallback scan.
    pub fn all(&self) -> Vec<Arc<ThreadElement>> {
        self.slots.iter().filter_map(|s| s.read().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Cancelable, ThreadKind};

    fn dummy(id: SmallId) -> Arc<ThreadElement> {
        Arc::new(ThreadElement::new(
            id,
            ThreadKind::Discovered,
            std::thread::current().id(),
            Cancelable::No,
            0,
            0,
        ))
    }

    #[test]
    fn reserve_insert_get_roundtrip() {
        let reg = Registry::new(8);
        let id = reg.reserve_id().unwrap();
        reg.insert(id, dummy(id));
        assert!(reg.get(id).is_some());
    }

    #[test]
    fn reserve_fails_when_exhausted() {
        let reg = Registry::new(2);
        let a = reg.reserve_id().unwrap();
        reg.insert(a, dummy(a));
        let b = reg.reserve_id().unwrap();
        reg.insert(b, dummy(b));
        assert!(reg.reserve_id().is_err());
    }

    #[test]
    fn reclaim_then_reserve_reuses_id() {
        let reg = Registry::new(2);
        let a = reg.reserve_id().unwrap();
        reg.insert(a, dummy(a));
        reg.reclaim(a);
        assert_eq!(reg.reusable_count(), 1);
        let b = reg.reserve_id().unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.reusable_count(), 0);
    }

    #[test]
    fn others_excludes_given_id() {
        let reg = Registry::new(4);
        let a = reg.reserve_id().unwrap();
        reg.insert(a, dummy(a));
        let b = reg.reserve_id().unwrap();
        reg.insert(b, dummy(b));
        let others = reg.others(a);
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].small_id, b);
    }
}
