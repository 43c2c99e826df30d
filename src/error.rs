//! Unified error taxonomy.
//!
//! Every fallible async operation in this crate returns `Result<T,
//! Error<Op>>`, where `Op` is the operation-specific error type of the
//! underlying syscall. Handle, executor, and lane failures are carried in
//! their own variants so callers can match on infrastructure failures
//! without losing the original operation error's type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("handle id does not belong to this executor")]
    ScopeMismatch,
    #[error("handle id is not registered")]
    InvalidId,
    #[error("handle has already been closed")]
    HandleClosed,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor is shutting down")]
    ShutdownInProgress,
    #[error("no handle registered for this id")]
    HandleNotFound,
    #[error("operation is not valid in the current state")]
    InvalidState,
}

#[derive(Debug, Error)]
pub enum LaneError {
    #[error("lane has been shut down")]
    Shutdown,
    #[error("lane job queue is full")]
    QueueFull,
    #[error("deadline exceeded while waiting for lane admission")]
    DeadlineExceeded,
}

/// The unified error wrapper returned by every public async operation.
#[derive(Debug, Error)]
pub enum Error<Op: std::error::Error> {
    #[error(transparent)]
    Operation(Op),
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Lane(#[from] LaneError),
    #[error("operation was cancelled")]
    Cancelled,
}

impl<Op: std::error::Error> Error<Op> {
    pub fn operation(op: Op) -> Self {
        Error::Operation(op)
    }

    /// Retags the operation-error channel, used when one subsystem's
    /// result feeds into another's error type (e.g. directory-iterator
    /// errors becoming walker errors).
    pub fn map_operation<Op2: std::error::Error>(self, f: impl FnOnce(Op) -> Op2) -> Error<Op2> {
        match self {
            Error::Operation(op) => Error::Operation(f(op)),
            Error::Handle(e) => Error::Handle(e),
            Error::Executor(e) => Error::Executor(e),
            Error::Lane(e) => Error::Lane(e),
            Error::Cancelled => Error::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
