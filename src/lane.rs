//! The blocking lane (spec §4.C3): a dedicated OS-thread pool that runs
//! blocking syscalls to completion, with bounded-queue backpressure and
//! deadline-bounded admission.
//!
//! Grounded on the dedicated-thread executor pattern in
//! `oxcrypt-fuse/src/scheduler/executor.rs`: named worker threads pull jobs
//! off a shared queue, run them outside any lock, and report results back
//! through a oneshot channel. The queue itself uses a `parking_lot`
//! `Mutex`/`Condvar` pair in the style of `oxcrypt-mount/src/signal.rs`
//! rather than that executor's `crossbeam_channel` + `event_listener`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::clock::Deadline;
use crate::queue::{BoundedJobQueue, PendingEntry};

/// How the lane behaves when its job queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Fail the caller immediately with `QueueFull`.
    Throw,
    /// Suspend the caller in a pending-admission FIFO until capacity frees
    /// up, subject to the caller's deadline.
    Suspend,
}

#[derive(Debug, Clone)]
pub struct LaneConfig {
    pub workers: usize,
    pub queue_limit: usize,
    pub backpressure: Backpressure,
    pub thread_name_prefix: String,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            queue_limit: 256,
            backpressure: Backpressure::Suspend,
            thread_name_prefix: "laneio-worker".to_string(),
        }
    }
}

impl LaneConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = limit.max(1);
        self
    }

    pub fn with_backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = backpressure;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaneError {
    #[error("lane has been shut down")]
    Shutdown,
    #[error("lane job queue is full")]
    QueueFull,
    #[error("deadline exceeded while waiting for lane admission")]
    DeadlineExceeded,
}

/// The result of a `Lane::run` call: either the operation's own result, or
/// an infrastructure-level failure that never reached the syscall.
#[derive(Debug)]
pub enum LaneOutcome<T, Op> {
    Operation(Result<T, Op>),
    Lane(LaneError),
    /// Cancellation was observed before the job ever ran (rejected at
    /// admission, or while suspended awaiting queue capacity). The job's
    /// closure — and anything it captured — was dropped without running.
    Cancelled,
    /// Cancellation raced the job's completion: by the time the caller's
    /// cancellation was observed, the syscall had already run to
    /// completion on the lane thread (run-once-enqueued). The result is
    /// carried so a caller holding a linear resource (e.g. a checked-out
    /// handle) can still recover it before reporting `Cancelled`.
    CancelledAfterCompletion(Result<T, Op>),
}

/// Declared capabilities of a lane implementation (spec §4.C3). The
/// built-in lane declares both `true`.
#[derive(Debug, Clone, Copy)]
pub struct LaneCapabilities {
    pub executes_on_dedicated_threads: bool,
    pub guarantees_run_once_enqueued: bool,
}

#[derive(Debug, Default)]
pub struct LaneStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    in_flight: AtomicU64,
}

impl LaneStats {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

struct Inner {
    queue: Mutex<BoundedJobQueue>,
    cond: Condvar,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    config: LaneConfig,
    stats: LaneStats,
}

/// A bounded pool of dedicated OS threads executing blocking jobs.
pub struct Lane {
    inner: Arc<Inner>,
}

impl Lane {
    pub fn new(config: LaneConfig) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(BoundedJobQueue::new(config.queue_limit)),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            config,
            stats: LaneStats::default(),
        });
        Lane { inner }
    }

    pub fn capabilities(&self) -> LaneCapabilities {
        LaneCapabilities {
            executes_on_dedicated_threads: true,
            guarantees_run_once_enqueued: true,
        }
    }

    pub fn stats(&self) -> &LaneStats {
        &self.inner.stats
    }

    fn ensure_started(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut workers = self.inner.workers.lock();
        for id in 0..self.inner.config.workers {
            let inner = Arc::clone(&self.inner);
            let name = format!("{}-{id}", self.inner.config.thread_name_prefix);
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(inner))
                .expect("failed to spawn lane worker thread");
            workers.push(handle);
        }
    }

    /// Submits `f` to run on a lane worker thread, suspending the caller
    /// until the result is available (and, under `Suspend` backpressure,
    /// until queue capacity admits the job).
    pub async fn run<T, Op>(
        &self,
        deadline: Option<Deadline>,
        cancel: Option<&CancellationToken>,
        f: impl FnOnce() -> Result<T, Op> + Send + 'static,
    ) -> LaneOutcome<T, Op>
    where
        T: Send + 'static,
        Op: Send + 'static,
    {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return LaneOutcome::Cancelled;
            }
        }

        self.ensure_started();

        if self.inner.shutdown.load(Ordering::Acquire) {
            self.inner.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return LaneOutcome::Lane(LaneError::Shutdown);
        }

        let (result_tx, result_rx) = oneshot::channel::<Result<T, Op>>();
        let job: Box<dyn FnOnce() + Send> = Box::new(move || {
            let outcome = f();
            let _ = result_tx.send(outcome);
        });

        let admission = {
            let mut queue = self.inner.queue.lock();
            if !queue.is_full() {
                queue.enqueue(job);
                self.inner.stats.submitted.fetch_add(1, Ordering::Relaxed);
                self.inner.cond.notify_one();
                None
            } else {
                match self.inner.config.backpressure {
                    Backpressure::Throw => {
                        drop(queue);
                        self.inner.stats.rejected.fetch_add(1, Ordering::Relaxed);
                        return LaneOutcome::Lane(LaneError::QueueFull);
                    }
                    Backpressure::Suspend => {
                        let cancelled = Arc::new(AtomicBool::new(false));
                        let (admitted_tx, admitted_rx) = oneshot::channel();
                        queue.push_pending(PendingEntry {
                            job,
                            admitted_tx,
                            cancelled: Arc::clone(&cancelled),
                        });
                        drop(queue);
                        Some((cancelled, admitted_rx))
                    }
                }
            }
        };

        if let Some((cancelled, admitted_rx)) = admission {
            trace!("lane run suspended awaiting admission");

            let wait = async {
                match deadline {
                    Some(d) => {
                        tokio::time::timeout(d.remaining(), admitted_rx)
                            .await
                            .map_err(|_| LaneError::DeadlineExceeded)
                            .and_then(|r| r.map_err(|_| LaneError::Shutdown))
                    }
                    None => admitted_rx.await.map_err(|_| LaneError::Shutdown),
                }
            };

            let admitted = match cancel {
                Some(token) => tokio::select! {
                    res = wait => res,
                    _ = token.cancelled() => {
                        cancelled.store(true, Ordering::Release);
                        return LaneOutcome::Cancelled;
                    }
                },
                None => wait.await,
            };

            if let Err(e) = admitted {
                cancelled.store(true, Ordering::Release);
                self.inner.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return LaneOutcome::Lane(e);
            }
            self.inner.stats.submitted.fetch_add(1, Ordering::Relaxed);
        }

        match result_rx.await {
            Ok(outcome) => {
                self.inner.stats.completed.fetch_add(1, Ordering::Relaxed);
                if let Some(token) = cancel {
                    if token.is_cancelled() {
                        // The lane guarantees run-once-enqueued: the syscall
                        // above already executed. Hand the result back so
                        // the caller can still settle any linear resource
                        // it carries before reporting cancellation.
                        return LaneOutcome::CancelledAfterCompletion(outcome);
                    }
                }
                LaneOutcome::Operation(outcome)
            }
            Err(_) => LaneOutcome::Lane(LaneError::Shutdown),
        }
    }

    /// Idempotent. Signals shutdown, drains pending callers with
    /// `Shutdown`, and blocks until every in-flight job has completed and
    /// every worker thread has joined.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("lane shutting down");
        {
            let mut queue = self.inner.queue.lock();
            for pending in queue.drain_pending() {
                pending.cancelled.store(true, Ordering::Release);
                let _ = pending.admitted_tx; // dropped, receiver observes Shutdown
            }
            self.inner.cond.notify_all();
        }
        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                warn!("lane worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Lane {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        let job = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(job) = queue.dequeue() {
                    queue.promote_one_pending();
                    break Some(job);
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                inner.cond.wait(&mut queue);
            }
        };
        let Some(job) = job else {
            return;
        };
        inner.stats.in_flight.fetch_add(1, Ordering::AcqRel);
        job();
        inner.stats.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_executes_job_and_returns_result() {
        let lane = Lane::new(LaneConfig::default().with_workers(2));
        let outcome = lane
            .run::<i32, ()>(None, None, || Ok(42))
            .await;
        match outcome {
            LaneOutcome::Operation(Ok(v)) => assert_eq!(v, 42),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn throw_backpressure_rejects_when_full() {
        let lane = Lane::new(
            LaneConfig::default()
                .with_workers(1)
                .with_queue_limit(1)
                .with_backpressure(Backpressure::Throw),
        );
        // occupy the single worker with a slow job so the queue stays full
        let (hold_tx, hold_rx) = std::sync::mpsc::channel::<()>();
        let lane_ref = &lane;
        let slow = lane_ref.run::<(), ()>(None, None, move || {
            let _ = hold_rx.recv();
            Ok(())
        });
        tokio::pin!(slow);
        // give the worker a moment to pick up the slow job
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let fill = lane.run::<(), ()>(None, None, || Ok(()));
        tokio::pin!(fill);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let reject = lane.run::<(), ()>(None, None, || Ok(())).await;
        assert!(matches!(reject, LaneOutcome::Lane(LaneError::QueueFull)));
        let _ = hold_tx.send(());
        let _ = slow.await;
        let _ = fill.await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let lane = Lane::new(LaneConfig::default().with_workers(1));
        lane.shutdown();
        lane.shutdown();
    }
}
