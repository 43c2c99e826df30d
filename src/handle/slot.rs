//! Handle slot (spec §4.C4).
//!
//! The source pattern smuggles a non-copyable handle across a suspension
//! point by erasing it to a raw address and reconstructing it on the other
//! side, because the source language cannot otherwise prove a linear value
//! survives the trip through an `@unchecked Sendable` closure. Rust's move
//! semantics already prove that: a `RawHandle` can be moved directly into
//! the lane job closure and moved back out through the job's result, with
//! the borrow checker enforcing that the caller's async frame (which holds
//! the `HandleSlot`) outlives the awaited job. No address erasure or
//! unsafe code is needed to satisfy the same invariant.
//!
//! `HandleSlot` still exists as a distinct type, matching the module
//! boundary described in the spec, but it is a plain owned cell.

use crate::primitives::RawHandle;

/// An owned cell that temporarily holds a handle while it crosses a lane
/// transaction.
#[derive(Default)]
pub struct HandleSlot {
    handle: Option<RawHandle>,
}

impl HandleSlot {
    pub fn new(handle: RawHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub fn empty() -> Self {
        Self { handle: None }
    }

    pub fn is_occupied(&self) -> bool {
        self.handle.is_some()
    }

    /// Takes ownership of the handle out of the slot, leaving it empty.
    /// Panics if the slot is already empty — this is a documented
    /// precondition violation (the caller moved the handle out twice),
    /// not a recoverable runtime condition.
    pub fn take(&mut self) -> RawHandle {
        self.handle.take().expect("handle slot is already empty")
    }

    pub fn put(&mut self, handle: RawHandle) {
        debug_assert!(self.handle.is_none(), "handle slot already occupied");
        self.handle = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ValidPath;
    use crate::primitives::{HandleMode, OpenOptionsFlags};

    fn open_handle(dir: &tempfile::TempDir) -> RawHandle {
        let path = ValidPath::new(dir.path().join("f")).unwrap();
        RawHandle::open(
            &path,
            HandleMode::Write,
            OpenOptionsFlags {
                create: true,
                truncate: true,
                append: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn empty_slot_reports_unoccupied() {
        let slot = HandleSlot::empty();
        assert!(!slot.is_occupied());
    }

    #[test]
    fn take_then_put_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut slot = HandleSlot::new(open_handle(&dir));
        assert!(slot.is_occupied());
        let handle = slot.take();
        assert!(!slot.is_occupied());
        slot.put(handle);
        assert!(slot.is_occupied());
    }

    #[test]
    #[should_panic(expected = "already empty")]
    fn take_on_empty_slot_panics() {
        let mut slot = HandleSlot::empty();
        slot.take();
    }
}
