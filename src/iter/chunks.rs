//! Byte-chunk iterator (spec §4.C10): a lazy async sequence of owned byte
//! chunks read from a file through a registered handle.

use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::executor::Executor;
use crate::handle::HandleId;
use crate::path::ValidPath;
use crate::primitives::{HandleMode, OpError, OpenOptionsFlags};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

enum State {
    Open(HandleId),
    Finished,
}

/// Reads a file in fixed-size owned chunks. Opens its own handle and
/// destroys it through the owning executor on EOF, error, explicit
/// termination, or drop — whichever comes first.
pub struct ByteChunkIterator<'a> {
    executor: &'a Executor,
    state: State,
    chunk_size: usize,
    cancel: Option<CancellationToken>,
}

impl<'a> ByteChunkIterator<'a> {
    pub async fn open(
        executor: &'a Executor,
        path: &ValidPath,
    ) -> Result<ByteChunkIterator<'a>, Error<OpError>> {
        let id = executor
            .open_file(path, HandleMode::Read, OpenOptionsFlags::default())
            .await?;
        Ok(Self {
            executor,
            state: State::Open(id),
            chunk_size: DEFAULT_CHUNK_SIZE,
            cancel: None,
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub async fn next(&mut self) -> Result<Option<Vec<u8>>, Error<OpError>> {
        let id = match self.state {
            State::Finished => return Ok(None),
            State::Open(id) => id,
        };

        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                self.executor.destroy(id).await;
                self.state = State::Finished;
                return Err(Error::Cancelled);
            }
        }

        let chunk_size = self.chunk_size;
        let result = self
            .executor
            .transaction(id, None, self.cancel.as_ref(), move |handle| {
                handle.read(chunk_size)
            })
            .await;

        match result {
            Ok(bytes) if bytes.is_empty() => {
                self.executor.destroy(id).await;
                self.state = State::Finished;
                Ok(None)
            }
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) => {
                self.executor.destroy(id).await;
                self.state = State::Finished;
                Err(e)
            }
        }
    }

    /// Explicit termination barrier; idempotent.
    pub async fn terminate(&mut self) {
        if let State::Open(id) = std::mem::replace(&mut self.state, State::Finished) {
            self.executor.destroy(id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, ExecutorConfig};

    #[tokio::test]
    async fn reads_file_in_fixed_size_chunks_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        let path = ValidPath::new(dir.path().join("f")).unwrap();
        std::fs::write(path.as_path(), vec![0u8; 10]).unwrap();

        let executor = Executor::new(ExecutorConfig::default());
        let mut iter = ByteChunkIterator::open(&executor, &path)
            .await
            .unwrap()
            .with_chunk_size(4);

        let mut total = 0;
        while let Some(chunk) = iter.next().await.unwrap() {
            total += chunk.len();
        }
        assert_eq!(total, 10);
        assert!(iter.next().await.unwrap().is_none());
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn terminate_destroys_the_underlying_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = ValidPath::new(dir.path().join("f")).unwrap();
        std::fs::write(path.as_path(), b"data").unwrap();

        let executor = Executor::new(ExecutorConfig::default());
        let mut iter = ByteChunkIterator::open(&executor, &path).await.unwrap();
        iter.terminate().await;
        assert_eq!(executor.open_count(), 0);
        executor.shutdown().await;
    }
}
