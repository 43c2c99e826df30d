//! Scoped handle registry (spec §4.C5).
//!
//! Grounded on the check-out/check-in admission protocol in
//! `oxcrypt-fuse/src/scheduler/per_file.rs`'s `PerFileOrdering` (an
//! in-flight flag plus a FIFO of pending waiters, `try_start` /
//! `complete`) and on the `DashMap`-keyed registry-of-`Arc` shape in
//! `oxidized-cryptolib/src/vault/locks.rs`'s `VaultLockManager`. Unlike
//! `PerFileOrdering`, an entry here additionally carries the linear
//! `RawHandle` itself (not just an ordering token), and a `Destroyed`
//! state with no way back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::HandleError;
use crate::primitives::RawHandle;

/// Why a check-out attempt did not yield a handle.
#[derive(Debug)]
pub enum CheckOutFailure {
    Handle(HandleError),
    Cancelled,
}

/// Opaque identifier for a registered handle. The `scope` field ties an ID
/// to the executor instance that issued it; presenting an ID to a
/// different executor fails with `ScopeMismatch` rather than silently
/// operating on an unrelated handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId {
    pub raw: u64,
    pub scope: u64,
}

enum EntryState {
    Present(RawHandle),
    CheckedOut,
    Destroyed,
}

struct Waiter {
    resume: oneshot::Sender<()>,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

struct HandleEntry {
    state: Mutex<EntryState>,
    waiters: Mutex<VecDeque<Waiter>>,
}

/// Outcome of `check_in` for a handle that was marked for destruction
/// while checked out: the caller must close it on the lane and remove the
/// entry, since the registry itself performs no I/O.
pub enum CheckInOutcome {
    Restored,
    NeedsClose(RawHandle),
}

/// Outcome of `destroy` for a handle that was present (not checked out):
/// the caller must close it on the lane.
pub enum DestroyOutcome {
    NoOp,
    Deferred,
    NeedsClose(RawHandle),
}

pub struct HandleRegistry {
    scope: u64,
    next_id: AtomicU64,
    entries: DashMap<u64, Arc<HandleEntry>>,
}

impl HandleRegistry {
    pub fn new(scope: u64) -> Self {
        Self {
            scope,
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
        }
    }

    pub fn scope(&self) -> u64 {
        self.scope
    }

    pub fn open_count(&self) -> usize {
        self.entries.len()
    }

    /// Installs a freshly opened handle, returning its newly minted ID.
    /// IDs are strictly increasing within a registry's lifetime.
    pub fn insert(&self, handle: RawHandle) -> HandleId {
        let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            raw,
            Arc::new(HandleEntry {
                state: Mutex::new(EntryState::Present(handle)),
                waiters: Mutex::new(VecDeque::new()),
            }),
        );
        HandleId {
            raw,
            scope: self.scope,
        }
    }

    fn validate_scope(&self, id: HandleId) -> Result<(), HandleError> {
        if id.scope != self.scope {
            return Err(HandleError::ScopeMismatch);
        }
        Ok(())
    }

    fn entry(&self, id: HandleId) -> Result<Arc<HandleEntry>, HandleError> {
        self.validate_scope(id)?;
        self.entries
            .get(&id.raw)
            .map(|e| Arc::clone(e.value()))
            .ok_or(HandleError::InvalidId)
    }

    pub fn is_valid(&self, id: HandleId) -> bool {
        if self.validate_scope(id).is_err() {
            return false;
        }
        match self.entries.get(&id.raw) {
            None => false,
            Some(e) => !matches!(*e.state.lock(), EntryState::Destroyed),
        }
    }

    pub fn is_open(&self, id: HandleId) -> bool {
        self.is_valid(id)
    }

    /// Checks out the handle for `id`, suspending the caller in a FIFO
    /// waiter queue if another transaction currently holds it. Retries
    /// after every resume since the entry may have been destroyed while
    /// this caller waited.
    pub async fn check_out(
        &self,
        id: HandleId,
        cancel: Option<&CancellationToken>,
    ) -> Result<RawHandle, CheckOutFailure> {
        loop {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(CheckOutFailure::Cancelled);
                }
            }
            let entry = self.entry(id).map_err(CheckOutFailure::Handle)?;
            let cancelled_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let wait_rx = {
                let mut state = entry.state.lock();
                match &mut *state {
                    EntryState::Destroyed => return Err(CheckOutFailure::Handle(HandleError::InvalidId)),
                    EntryState::Present(_) => {
                        let EntryState::Present(handle) =
                            std::mem::replace(&mut *state, EntryState::CheckedOut)
                        else {
                            unreachable!()
                        };
                        return Ok(handle);
                    }
                    EntryState::CheckedOut => {
                        let (tx, rx) = oneshot::channel();
                        entry.waiters.lock().push_back(Waiter {
                            resume: tx,
                            cancelled: Arc::clone(&cancelled_flag),
                        });
                        rx
                    }
                }
            };
            // A send error means the entry was torn down (destroy resumed
            // every waiter by dropping their senders); loop to observe the
            // Destroyed state and return InvalidId.
            match cancel {
                Some(token) => tokio::select! {
                    _ = wait_rx => {}
                    _ = token.cancelled() => {
                        cancelled_flag.store(true, Ordering::Release);
                        return Err(CheckOutFailure::Cancelled);
                    }
                },
                None => {
                    let _ = wait_rx.await;
                }
            }
        }
    }

    /// Returns a checked-out handle. If the entry was marked `Destroyed`
    /// while checked out, the caller is responsible for closing it.
    pub fn check_in(&self, id: HandleId, handle: RawHandle) -> CheckInOutcome {
        let Ok(entry) = self.entry_allow_destroyed(id) else {
            return CheckInOutcome::Restored;
        };
        let mut state = entry.state.lock();
        match &*state {
            EntryState::CheckedOut => {
                *state = EntryState::Present(handle);
                drop(state);
                resume_next(&entry);
                CheckInOutcome::Restored
            }
            EntryState::Destroyed => {
                drop(state);
                self.entries.remove(&id.raw);
                CheckInOutcome::NeedsClose(handle)
            }
            EntryState::Present(_) => {
                unreachable!("check_in on an entry nobody checked out")
            }
        }
    }

    fn entry_allow_destroyed(&self, id: HandleId) -> Result<Arc<HandleEntry>, HandleError> {
        self.entries
            .get(&id.raw)
            .map(|e| Arc::clone(e.value()))
            .ok_or(HandleError::InvalidId)
    }

    /// Marks an entry destroyed. Idempotent: destroying an unknown or
    /// already-destroyed ID is a no-op.
    pub fn destroy(&self, id: HandleId) -> DestroyOutcome {
        let Some(entry) = self.entries.get(&id.raw).map(|e| Arc::clone(e.value())) else {
            return DestroyOutcome::NoOp;
        };
        let mut state = entry.state.lock();
        match &mut *state {
            EntryState::Destroyed => DestroyOutcome::NoOp,
            EntryState::Present(_) => {
                let EntryState::Present(handle) =
                    std::mem::replace(&mut *state, EntryState::Destroyed)
                else {
                    unreachable!()
                };
                drop(state);
                self.entries.remove(&id.raw);
                DestroyOutcome::NeedsClose(handle)
            }
            EntryState::CheckedOut => {
                *state = EntryState::Destroyed;
                drop(state);
                resume_all(&entry);
                DestroyOutcome::Deferred
            }
        }
    }

    /// Closes every remaining handle in registration order is not
    /// guaranteed; used by executor shutdown, which tolerates arbitrary
    /// order since callers have already been told the executor is going
    /// away.
    pub fn drain_present(&self) -> Vec<(HandleId, RawHandle)> {
        let mut out = Vec::new();
        let keys: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        for raw in keys {
            if let Some((_, entry)) = self.entries.remove(&raw) {
                let mut state = entry.state.lock();
                if let EntryState::Present(_) = &*state {
                    let EntryState::Present(handle) =
                        std::mem::replace(&mut *state, EntryState::Destroyed)
                    else {
                        unreachable!()
                    };
                    out.push((
                        HandleId {
                            raw,
                            scope: self.scope,
                        },
                        handle,
                    ));
                } else {
                    drop(state);
                    resume_all(&entry);
                }
            }
        }
        out
    }
}

fn resume_next(entry: &HandleEntry) {
    let mut waiters = entry.waiters.lock();
    while let Some(w) = waiters.pop_front() {
        if w.cancelled.load(Ordering::Acquire) {
            continue;
        }
        let _ = w.resume.send(());
        return;
    }
}

fn resume_all(entry: &HandleEntry) {
    let mut waiters = entry.waiters.lock();
    for w in waiters.drain(..) {
        let _ = w.resume.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ValidPath;
    use crate::primitives::{HandleMode, OpenOptionsFlags};

    fn open_handle(dir: &tempfile::TempDir, name: &str) -> RawHandle {
        let path = ValidPath::new(dir.path().join(name)).unwrap();
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
    fn inserted_ids_are_strictly_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HandleRegistry::new(1);
        let id1 = registry.insert(open_handle(&dir, "a"));
        let id2 = registry.insert(open_handle(&dir, "b"));
        assert!(id1.raw < id2.raw);
    }

    #[test]
    fn wrong_scope_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = HandleRegistry::new(1);
        let b = HandleRegistry::new(2);
        let id = a.insert(open_handle(&dir, "a"));
        assert!(!b.is_valid(id));
    }

    #[tokio::test]
    async fn check_out_then_check_in_restores_present() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HandleRegistry::new(1);
        let id = registry.insert(open_handle(&dir, "a"));

        let handle = registry.check_out(id, None).await.unwrap();
        assert!(registry.is_valid(id), "checked-out handle is still valid");
        match registry.check_in(id, handle) {
            CheckInOutcome::Restored => {}
            CheckInOutcome::NeedsClose(_) => panic!("expected Restored"),
        }
        assert!(registry.is_valid(id));
    }

    #[tokio::test]
    async fn destroy_while_checked_out_defers_close() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HandleRegistry::new(1);
        let id = registry.insert(open_handle(&dir, "a"));

        let handle = registry.check_out(id, None).await.unwrap();
        assert!(matches!(registry.destroy(id), DestroyOutcome::Deferred));
        match registry.check_in(id, handle) {
            CheckInOutcome::NeedsClose(_) => {}
            CheckInOutcome::Restored => panic!("expected NeedsClose after destroy"),
        }
        assert!(!registry.is_valid(id));
    }

    #[tokio::test]
    async fn second_checkout_waits_until_first_checks_in() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(HandleRegistry::new(1));
        let id = registry.insert(open_handle(&dir, "a"));

        let first = registry.check_out(id, None).await.unwrap();

        let registry2 = Arc::clone(&registry);
        let waiter = tokio::spawn(async move { registry2.check_out(id, None).await });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        registry.check_in(id, first);
        let second = waiter.await.unwrap().unwrap();
        let _ = registry.check_in(id, second);
    }
}
