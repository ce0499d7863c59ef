//! Timer used to bound non-blocking connects.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::executor::Job;

/// Scheduler shared by all selectors of a manager.
pub trait Scheduler: Send + Sync + 'static {
    /// Runs `job` once `delay` elapses, unless the returned handle is
    /// cancelled first.
    fn schedule(&self, delay: Duration, job: Box<dyn Job>) -> TimeoutHandle;
}

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Cancellable handle for a scheduled job.
#[derive(Clone)]
pub struct TimeoutHandle {
    state: Arc<AtomicU8>,
}

impl TimeoutHandle {
    fn new() -> TimeoutHandle {
        Self {
            state: Arc::new(AtomicU8::new(PENDING)),
        }
    }

    /// Cancels the timeout. Returns whether the cancel won, i.e. the job has
    /// not fired and never will.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn claim_fire(&self) -> bool {
        self.state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct Entry {
    at: Instant,
    seq: u64,
    handle: TimeoutHandle,
    job: Box<dyn Job>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // reversed so the earliest deadline sits on top of the max-heap
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerInner {
    queue: Mutex<BinaryHeap<Entry>>,
    cv: Condvar,
    shutdown: AtomicBool,
    seq: AtomicU64,
}

/// Single-thread timer implementing [`Scheduler`] with a deadline heap.
pub struct TimerScheduler {
    inner: Arc<TimerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerScheduler {
    pub fn new() -> TimerScheduler {
        let inner = Arc::new(TimerInner {
            queue: Mutex::new(BinaryHeap::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        });
        let thread = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("selnet-timer".into())
                .spawn(move || Self::run(inner))
                .expect("unable to spawn timer thread")
        };
        Self {
            inner,
            thread: Mutex::new(Some(thread)),
        }
    }

    fn run(inner: Arc<TimerInner>) {
        let mut queue = inner.queue.lock();
        loop {
            if inner.shutdown.load(Ordering::Acquire) {
                // discard anything still scheduled
                for entry in queue.drain() {
                    if entry.handle.claim_fire() {
                        entry.job.discard();
                    }
                }
                return;
            }
            let now = Instant::now();
            match queue.peek() {
                None => {
                    inner.cv.wait(&mut queue);
                }
                Some(entry) if entry.at > now => {
                    let deadline = entry.at;
                    inner.cv.wait_until(&mut queue, deadline);
                }
                Some(_) => {
                    let Some(entry) = queue.pop() else {
                        continue;
                    };
                    drop(queue);
                    if entry.handle.claim_fire() {
                        entry.job.run();
                    } else {
                        entry.job.discard();
                    }
                    queue = inner.queue.lock();
                }
            }
        }
    }

    /// Stops the timer thread, discarding pending jobs. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.cv.notify_all();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Scheduler for TimerScheduler {
    fn schedule(&self, delay: Duration, job: Box<dyn Job>) -> TimeoutHandle {
        let handle = TimeoutHandle::new();
        let entry = Entry {
            at: Instant::now() + delay,
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            handle: handle.clone(),
            job,
        };
        self.inner.queue.lock().push(entry);
        self.inner.cv.notify_all();
        handle
    }
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
