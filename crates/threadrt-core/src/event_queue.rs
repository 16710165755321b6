//! External event queue (section 4.14): a small deferred-work timer, not a
//! general-purpose scheduler (explicitly a Non-goal). Used for two things
//! named elsewhere in the spec: running a detached thread's exit callbacks
//! asynchronously when requested, and scheduling a detached element's
//! registry reclamation after its configured hold interval.
//!
//! Implemented as a single background ticker thread holding a min-heap of
//! `(deadline, callback)` pairs. Deliberately built on a plain
//! `std::sync::Mutex`/`Condvar` rather than this crate's own tracked
//! primitives (section 4.12): the runtime singleton constructs its event
//! queue as part of its own bootstrap (see [`crate::runtime::Runtime::new`]),
//! before a calling-thread element necessarily exists to own lock-stack
//! frames against, so tracked locking here would be a reentrant
//! bootstrap hazard rather than a safety net.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send>;

struct Task {
    deadline: Instant,
    seq: u64,
    callback: Callback,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    // Reversed so `BinaryHeap` (a max-heap) pops the *earliest* deadline.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<Task>>,
    cv: Condvar,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
}

/// A deferred-work timer queue with one background ticker thread.
pub struct EventQueue {
    shared: Arc<Shared>,
    ticker: Option<JoinHandle<()>>,
}

impl EventQueue {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        });
        let worker_shared = shared.clone();
        let ticker = std::thread::Builder::new()
            .name("threadrt-event-queue".into())
            .spawn(move || run(worker_shared))
            .expect("spawning the event queue ticker thread must succeed");
        EventQueue {
            shared,
            ticker: Some(ticker),
        }
    }

    /// Run `callback` after `delay`. Order among tasks with the same
    /// deadline is FIFO by submission.
    pub fn schedule(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) {
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let task = Task {
            deadline: Instant::now() + delay,
            seq,
            callback: Box::new(callback),
        };
        self.shared.heap.lock().unwrap().push(task);
        self.shared.cv.notify_one();
    }

    /// Number of tasks still waiting to fire. Exposed for tests.
    pub fn pending_count(&self) -> usize {
        self.shared.heap.lock().unwrap().len()
    }
}

fn run(shared: Arc<Shared>) {
    loop {
        let mut heap = shared.heap.lock().unwrap();
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            match heap.peek() {
                None => {
                    heap = shared.cv.wait(heap).unwrap();
                }
                Some(task) => {
                    let now = Instant::now();
                    if task.deadline <= now {
                        break;
                    }
                    let (guard, _timeout) =
                        shared.cv.wait_timeout(heap, task.deadline - now).unwrap();
                    heap = guard;
                }
            }
        }
        let task = heap.pop().expect("peeked Some above");
        drop(heap);
        (task.callback)();
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cv.notify_all();
        if let Some(handle) = self.ticker.take() {
            let _ = handle.join();
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn schedule_runs_after_delay() {
        let queue = EventQueue::new();
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        queue.schedule(Duration::from_millis(10), move || {
            flag2.store(true, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(100));
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn tasks_fire_in_deadline_order() {
        let queue = EventQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (i, delay_ms) in [30u64, 10, 20].into_iter().enumerate() {
            let order = order.clone();
            queue.schedule(Duration::from_millis(delay_ms), move || {
                order.lock().unwrap().push(i);
            });
        }
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn pending_count_reflects_queued_tasks() {
        let queue = EventQueue::new();
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        queue.schedule(Duration::from_secs(10), || {
            COUNTER.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(queue.pending_count(), 1);
    }
}
