//! The executor actor (spec §4.C7): the top-level coordinator owning a
//! lane, a handle registry, and the streaming-write registry.
//!
//! Grounded on `oxidized-cryptolib`'s `VaultOperationsAsync` as the
//! "facade that owns a lane plus a registry" shape, and on
//! `vault/locks.rs`'s `OnceLock`-backed global singleton for the
//! process-wide default executor and scope counter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::clock::Deadline;
use crate::error::{Error, ExecutorError};
use crate::handle::registry::DestroyOutcome;
use crate::handle::{transaction, HandleId, HandleRegistry};
use crate::lane::{Lane, LaneConfig, LaneOutcome};
use crate::path::ValidPath;
use crate::primitives::{HandleMode, OpError, OpenOptionsFlags, RawHandle};
use crate::write::{StreamingWriteOptions, StreamingWriteRegistry, WriteId};

static SCOPE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_scope() -> u64 {
    SCOPE_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub lane: LaneConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            lane: LaneConfig::default(),
        }
    }
}

/// The top-level coordinator. Each instance owns an independent lane and
/// handle namespace (`scope`); IDs from one executor are rejected by any
/// other.
pub struct Executor {
    scope: u64,
    lane: Lane,
    registry: HandleRegistry,
    writes: StreamingWriteRegistry,
    shut_down: AtomicBool,
    is_default: bool,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        let scope = next_scope();
        Self {
            scope,
            lane: Lane::new(config.lane),
            registry: HandleRegistry::new(scope),
            writes: StreamingWriteRegistry::new(),
            shut_down: AtomicBool::new(false),
            is_default: false,
        }
    }

    /// The process-wide default executor. Its teardown is intentionally
    /// suppressed: `shutdown()` on this instance is a no-op.
    pub fn default_executor() -> &'static Executor {
        static DEFAULT: OnceLock<Executor> = OnceLock::new();
        DEFAULT.get_or_init(|| {
            let mut exec = Executor::new(ExecutorConfig::default());
            exec.is_default = true;
            exec
        })
    }

    pub fn scope(&self) -> u64 {
        self.scope
    }

    pub fn lane(&self) -> &Lane {
        &self.lane
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    pub(crate) fn writes(&self) -> &StreamingWriteRegistry {
        &self.writes
    }

    fn check_not_shut_down(&self) -> Result<(), ExecutorError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ExecutorError::ShutdownInProgress);
        }
        Ok(())
    }

    /// Single-syscall offload: runs `op` on the lane with no handle
    /// involved.
    #[instrument(skip(self, op))]
    pub async fn run<T, Op>(
        &self,
        deadline: Option<Deadline>,
        cancel: Option<&CancellationToken>,
        op: impl FnOnce() -> Result<T, Op> + Send + 'static,
    ) -> Result<T, Error<Op>>
    where
        T: Send + 'static,
        Op: std::error::Error + Send + 'static,
    {
        self.check_not_shut_down()
            .map_err(Error::Executor)?;
        match self.lane.run(deadline, cancel, op).await {
            LaneOutcome::Operation(r) => r.map_err(Error::Operation),
            LaneOutcome::Lane(e) => Err(Error::Lane(e.into())),
            LaneOutcome::Cancelled => Err(Error::Cancelled),
            // No handle is involved in a bare `run`, so there is nothing to
            // reconcile; the completed result is simply discarded in favor
            // of reporting the cancellation the caller observed.
            LaneOutcome::CancelledAfterCompletion(_) => Err(Error::Cancelled),
        }
    }

    /// Opens a file and registers the resulting handle, returning its ID.
    /// The open runs inside a single lane job; the handle never crosses a
    /// suspension boundary before being installed into the registry.
    #[instrument(skip(self), fields(path = %path))]
    pub async fn open_file(
        &self,
        path: &ValidPath,
        mode: HandleMode,
        flags: OpenOptionsFlags,
    ) -> Result<HandleId, Error<OpError>> {
        self.check_not_shut_down().map_err(Error::Executor)?;
        let path = path.clone();
        let outcome = self
            .lane
            .run::<RawHandle, OpError>(None, None, move || RawHandle::open(&path, mode, flags))
            .await;
        match outcome {
            LaneOutcome::Operation(Ok(handle)) => Ok(self.registry.insert(handle)),
            LaneOutcome::Operation(Err(e)) => Err(Error::Operation(e)),
            LaneOutcome::Lane(e) => Err(Error::Lane(e.into())),
            LaneOutcome::Cancelled => Err(Error::Cancelled),
            // The open ran to completion, but the caller that would have
            // received the ID observed cancellation instead. There is no ID
            // to hand back and register under, so close the freshly opened
            // file descriptor directly rather than leaking it.
            LaneOutcome::CancelledAfterCompletion(Ok(handle)) => {
                let outcome = self
                    .lane
                    .run::<(), OpError>(None, None, move || handle.close())
                    .await;
                if let LaneOutcome::Operation(Err(e)) = outcome {
                    warn!(error = %e, "failed to close handle opened after cancellation");
                }
                Err(Error::Cancelled)
            }
            LaneOutcome::CancelledAfterCompletion(Err(_)) => Err(Error::Cancelled),
        }
    }

    /// Runs `body` with exclusive access to the handle, via the
    /// transaction engine (spec §4.C6).
    pub async fn transaction<T, Op>(
        &self,
        id: HandleId,
        deadline: Option<Deadline>,
        cancel: Option<&CancellationToken>,
        body: impl FnOnce(&mut RawHandle) -> Result<T, Op> + Send + 'static,
    ) -> Result<T, Error<Op>>
    where
        T: Send + 'static,
        Op: std::error::Error + Send + 'static,
    {
        self.check_not_shut_down().map_err(Error::Executor)?;
        transaction::run(&self.registry, &self.lane, id, deadline, cancel, body).await
    }

    /// Convenience wrapper over `transaction` with no deadline or
    /// cancellation token.
    pub async fn with_handle<T, Op>(
        &self,
        id: HandleId,
        body: impl FnOnce(&mut RawHandle) -> Result<T, Op> + Send + 'static,
    ) -> Result<T, Error<Op>>
    where
        T: Send + 'static,
        Op: std::error::Error + Send + 'static,
    {
        self.transaction(id, None, None, body).await
    }

    pub fn is_valid(&self, id: HandleId) -> bool {
        self.registry.is_valid(id)
    }

    pub fn is_open(&self, id: HandleId) -> bool {
        self.registry.is_open(id)
    }

    pub fn open_count(&self) -> usize {
        self.registry.open_count()
    }

    /// Marks a handle destroyed. If it is currently idle, closes it on the
    /// lane before returning. If it is checked out, closing is deferred to
    /// the transaction's check-in. Idempotent.
    #[instrument(skip(self))]
    pub async fn destroy(&self, id: HandleId) {
        match self.registry.destroy(id) {
            DestroyOutcome::NoOp | DestroyOutcome::Deferred => {}
            DestroyOutcome::NeedsClose(handle) => {
                let outcome = self
                    .lane
                    .run::<(), OpError>(None, None, move || handle.close())
                    .await;
                if let LaneOutcome::Operation(Err(e)) = outcome {
                    warn!(error = %e, "failed to close destroyed handle");
                }
            }
        }
    }

    /// Opens a streaming write entry for `path` (spec §4.C11).
    pub async fn open_write(
        &self,
        path: &ValidPath,
        options: StreamingWriteOptions,
    ) -> Result<WriteId, Error<OpError>> {
        self.check_not_shut_down().map_err(Error::Executor)?;
        self.writes.open(&self.lane, path, options).await
    }

    pub async fn write_chunk(&self, id: WriteId, bytes: Vec<u8>) -> Result<(), Error<OpError>> {
        self.writes.write_chunk(&self.lane, id, bytes).await
    }

    pub async fn commit_write(&self, id: WriteId) -> Result<(), Error<OpError>> {
        self.writes.commit(&self.lane, id).await
    }

    pub async fn abort_write(&self, id: WriteId) -> Result<(), Error<OpError>> {
        self.writes.abort(&self.lane, id).await
    }

    /// Starts a recursive directory walk rooted at `path` (spec §4.C9).
    pub fn walk(
        &self,
        path: ValidPath,
        options: crate::walk::WalkOptions,
    ) -> crate::walk::RecursiveWalk<'_> {
        crate::walk::RecursiveWalk::new(self, path, options)
    }

    /// Opens a lazy pull-based iterator over one directory's entries (spec
    /// §4.C8).
    pub fn entries(&self, path: ValidPath) -> crate::iter::DirectoryIterator<'_> {
        crate::iter::DirectoryIterator::new(self, path)
    }

    /// Idempotent. Resumes every waiting handle caller, closes every
    /// remaining handle, tears down in-flight streaming writes, and waits
    /// for the lane to drain. A no-op on the process-wide default
    /// executor.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.is_default {
            debug!("shutdown on default executor is a no-op");
            return;
        }
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for (_, handle) in self.registry.drain_present() {
            let outcome = self
                .lane
                .run::<(), OpError>(None, None, move || handle.close())
                .await;
            if let LaneOutcome::Operation(Err(e)) = outcome {
                warn!(error = %e, "failed to close handle during shutdown");
            }
        }
        self.writes.abort_all(&self.lane).await;
        self.lane.shutdown();
    }
}

impl From<crate::lane::LaneError> for crate::error::LaneError {
    fn from(e: crate::lane::LaneError) -> Self {
        match e {
            crate::lane::LaneError::Shutdown => crate::error::LaneError::Shutdown,
            crate::lane::LaneError::QueueFull => crate::error::LaneError::QueueFull,
            crate::lane::LaneError::DeadlineExceeded => crate::error::LaneError::DeadlineExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scope_mismatch_is_rejected_across_executors() {
        let dir = tempfile::tempdir().unwrap();
        let path = ValidPath::new(dir.path().join("f")).unwrap();
        std::fs::write(path.as_path(), b"hi").unwrap();

        let a = Executor::new(ExecutorConfig::default());
        let b = Executor::new(ExecutorConfig::default());
        let id = a
            .open_file(&path, HandleMode::Read, OpenOptionsFlags::default())
            .await
            .unwrap();

        let result = b.with_handle(id, |h| h.read(8)).await;
        assert!(matches!(
            result,
            Err(Error::Handle(crate::error::HandleError::ScopeMismatch))
        ));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_closes_open_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = ValidPath::new(dir.path().join("f")).unwrap();
        std::fs::write(path.as_path(), b"hi").unwrap();

        let exec = Executor::new(ExecutorConfig::default());
        let id = exec
            .open_file(&path, HandleMode::Read, OpenOptionsFlags::default())
            .await
            .unwrap();
        assert!(exec.is_open(id));

        exec.shutdown().await;
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn default_executor_shutdown_is_a_no_op() {
        let exec = Executor::default_executor();
        exec.shutdown().await;
        assert!(exec.check_not_shut_down().is_ok());
    }
}
