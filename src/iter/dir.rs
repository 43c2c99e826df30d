//! Pull-based directory iterator (spec §4.C8).

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::Error;
use crate::executor::Executor;
use crate::lane::LaneOutcome;
use crate::path::ValidPath;
use crate::primitives::{self, DirHandle, EntryType, OpError};

pub const DEFAULT_BATCH_SIZE: usize = 64;

/// One entry read from a directory.
#[derive(Debug, Clone)]
pub struct Entry {
    pub path: ValidPath,
    pub kind: EntryType,
}

enum State {
    Unopened,
    Open(DirHandle),
    Finished,
}

/// A lazy, on-demand async sequence of directory entries. Each `next()`
/// call that needs fresh entries issues exactly one lane job reading up to
/// `batch_size` entries at once.
pub struct DirectoryIterator<'a> {
    executor: &'a Executor,
    path: ValidPath,
    state: State,
    buffer: std::collections::VecDeque<Entry>,
    batch_size: usize,
    cancel: Option<CancellationToken>,
}

impl<'a> DirectoryIterator<'a> {
    pub fn new(executor: &'a Executor, path: ValidPath) -> Self {
        Self {
            executor,
            path,
            state: State::Unopened,
            buffer: std::collections::VecDeque::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            cancel: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Returns the next entry, or `None` at end-of-stream. The underlying
    /// OS directory handle is always closed before end-of-stream or a
    /// terminal error is returned.
    pub async fn next(&mut self) -> Result<Option<Entry>, Error<OpError>> {
        loop {
            if let Some(token) = &self.cancel {
                if token.is_cancelled() {
                    self.close_on_error().await;
                    self.state = State::Finished;
                    return Err(Error::Cancelled);
                }
            }

            if let Some(entry) = self.buffer.pop_front() {
                return Ok(Some(entry));
            }

            match std::mem::replace(&mut self.state, State::Finished) {
                State::Unopened => {
                    let path = self.path.clone();
                    let outcome = self
                        .executor
                        .lane()
                        .run::<DirHandle, OpError>(None, None, move || DirHandle::open(&path))
                        .await;
                    match outcome {
                        LaneOutcome::Operation(Ok(handle)) => {
                            self.state = State::Open(handle);
                        }
                        LaneOutcome::Operation(Err(e)) => return Err(Error::Operation(e)),
                        LaneOutcome::Lane(e) => return Err(Error::Lane(e.into())),
                        LaneOutcome::Cancelled => return Err(Error::Cancelled),
                        LaneOutcome::CancelledAfterCompletion(_) => return Err(Error::Cancelled),
                    }
                }
                State::Open(handle) => {
                    let batch_size = self.batch_size;
                    let outcome = self
                        .executor
                        .lane()
                        .run::<(DirHandle, Vec<primitives::RawEntry>), OpError>(
                            None,
                            None,
                            move || {
                                let mut handle = handle;
                                let batch = handle.next_batch(batch_size)?;
                                Ok((handle, batch))
                            },
                        )
                        .await;
                    match outcome {
                        LaneOutcome::Operation(Ok((handle, raw))) => {
                            if raw.is_empty() {
                                self.close_handle(handle).await;
                                self.state = State::Finished;
                                return Ok(None);
                            }
                            for e in raw {
                                let kind = e.kind;
                                let path = ValidPath::new(e.parent.as_path().join(&e.name))
                                    .expect("joined path derived from a valid parent is valid");
                                self.buffer.push_back(Entry { path, kind });
                            }
                            self.state = State::Open(handle);
                        }
                        LaneOutcome::Operation(Err(e)) => return Err(Error::Operation(e)),
                        LaneOutcome::Lane(e) => return Err(Error::Lane(e.into())),
                        LaneOutcome::Cancelled => return Err(Error::Cancelled),
                        LaneOutcome::CancelledAfterCompletion(_) => return Err(Error::Cancelled),
                    }
                }
                State::Finished => {
                    self.state = State::Finished;
                    return Ok(None);
                }
            }
        }
    }

    /// Explicit termination barrier: after this returns, no I/O from this
    /// iterator is in flight, regardless of whether the sequence was
    /// exhausted.
    pub async fn terminate(&mut self) {
        if let State::Open(handle) = std::mem::replace(&mut self.state, State::Finished) {
            self.close_handle(handle).await;
        }
    }

    async fn close_handle(&self, handle: DirHandle) {
        let outcome = self
            .executor
            .lane()
            .run::<(), OpError>(None, None, move || handle.close())
            .await;
        if let LaneOutcome::Operation(Err(e)) = outcome {
            trace!(error = %e, "error closing directory handle");
        }
    }

    async fn close_on_error(&mut self) {
        if let State::Open(handle) = std::mem::replace(&mut self.state, State::Finished) {
            self.close_handle(handle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, ExecutorConfig};

    #[tokio::test]
    async fn lists_all_entries_across_multiple_batches() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let executor = Executor::new(ExecutorConfig::default());
        let mut iter = executor
            .entries(ValidPath::new(dir.path().to_path_buf()).unwrap())
            .with_batch_size(1);

        let mut names = std::collections::HashSet::new();
        while let Some(entry) = iter.next().await.unwrap() {
            names.insert(entry.path.file_name().unwrap().to_string_lossy().into_owned());
        }
        assert_eq!(
            names,
            std::collections::HashSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
        );
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn terminate_before_exhaustion_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        let executor = Executor::new(ExecutorConfig::default());
        let mut iter = executor.entries(ValidPath::new(dir.path().to_path_buf()).unwrap());
        iter.terminate().await;
        iter.terminate().await;
        assert!(iter.next().await.unwrap().is_none());
        executor.shutdown().await;
    }
}
