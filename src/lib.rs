//! Async I/O core for a filesystem library.
//!
//! This crate bridges blocking filesystem syscalls into a cooperative
//! async model without starving the scheduler, leaking OS handles, or
//! violating the single-ownership of file handles. It owns no virtual
//! filesystem abstraction and does no encryption, mounting, or network
//! I/O — those are layers a caller builds on top.
//!
//! The pieces:
//!
//! - [`lane`] — a bounded pool of dedicated OS threads running blocking
//!   syscalls to completion.
//! - [`handle`] — a scoped registry of non-copyable file handles behind
//!   opaque IDs, serialized per-handle by a fair waiter queue.
//! - [`executor`] — the top-level coordinator: [`executor::Executor`].
//! - [`iter`] — lazy async iterators over directory entries and file byte
//!   chunks.
//! - [`walk`] — a bounded-concurrency recursive directory walker.
//! - [`write`] — a streaming write engine with atomic commit.

pub mod clock;
pub mod error;
pub mod executor;
pub mod handle;
pub mod iter;
pub mod lane;
pub mod path;
pub mod primitives;
pub mod queue;
pub mod walk;
pub mod write;

pub use error::Error;
pub use executor::{Executor, ExecutorConfig};
pub use handle::HandleId;
pub use iter::{ByteChunkIterator, DirectoryIterator, Entry};
pub use lane::{Backpressure, Lane, LaneConfig};
pub use path::ValidPath;
pub use primitives::{EntryType, HandleMode, OpError, OpenOptionsFlags};
pub use walk::{RecursiveWalk, UndecodableAction, WalkOptions, WalkStats};
pub use write::{CommitMode, Durability, StreamingWriteOptions, WriteId};

/// The process-wide default executor. Its `shutdown()` is a no-op; it is
/// meant to live for the lifetime of the process.
pub fn default_executor() -> &'static Executor {
    Executor::default_executor()
}
