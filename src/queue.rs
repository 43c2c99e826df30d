//! Bounded job queue (spec §4.C2).
//!
//! A fixed-capacity FIFO of boxed jobs plus a separate FIFO of
//! pending-admission entries for callers waiting under `Suspend`
//! backpressure. All access is serialized by the lane's mutex; this module
//! holds no locking of its own.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A caller waiting for queue capacity to free up.
pub struct PendingEntry {
    pub job: Job,
    pub admitted_tx: oneshot::Sender<()>,
    pub cancelled: Arc<AtomicBool>,
}

pub struct BoundedJobQueue {
    capacity: usize,
    jobs: VecDeque<Job>,
    pending: VecDeque<PendingEntry>,
}

impl BoundedJobQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "queue_limit must be >= 1");
        Self {
            capacity,
            jobs: VecDeque::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.capacity
    }

    pub fn enqueue(&mut self, job: Job) {
        debug_assert!(!self.is_full());
        self.jobs.push_back(job);
    }

    pub fn dequeue(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    pub fn push_pending(&mut self, entry: PendingEntry) {
        self.pending.push_back(entry);
    }

    /// Promotes the first non-cancelled pending entry onto the job queue,
    /// notifying its caller of admission. Called by a worker right after it
    /// dequeues a job, so capacity freed by that dequeue is handed to the
    /// longest-waiting caller.
    pub fn promote_one_pending(&mut self) {
        while !self.is_full() {
            let Some(entry) = self.pending.pop_front() else {
                return;
            };
            if entry.cancelled.load(Ordering::Acquire) {
                continue;
            }
            self.jobs.push_back(entry.job);
            let _ = entry.admitted_tx.send(());
            return;
        }
    }

    pub fn drain_pending(&mut self) -> Vec<PendingEntry> {
        self.pending.drain(..).collect()
    }

    pub fn drain_jobs(&mut self) -> Vec<Job> {
        self.jobs.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }
}
