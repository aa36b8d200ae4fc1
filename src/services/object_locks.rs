//! Per-object mutual exclusion.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Arena of per-object async locks.
///
/// Entries are created on first use and kept for the lifetime of the
/// process, so two callers asking for the same id always get the same
/// mutex. Different ids never contend.
///
/// The arena also records which objects have an assembly running in this
/// process, so a `merging` row with no live assembler can be told apart
/// from one that is still being written.
#[derive(Clone, Default)]
pub struct ObjectLocks {
    inner: Arc<Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>>,
    merging: Arc<Mutex<HashSet<i64>>>,
}

/// Marks an assembly of one object as running until dropped.
pub struct MergeTicket {
    id: i64,
    merging: Arc<Mutex<HashSet<i64>>>,
}

impl Drop for MergeTicket {
    fn drop(&mut self) {
        let mut set = self.merging.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.id);
    }
}

impl ObjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, id: i64) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(id).or_default().clone()
    }

    /// Wait for exclusive access to object `id`.
    pub async fn lock(&self, id: i64) -> OwnedMutexGuard<()> {
        self.handle(id).lock_owned().await
    }

    /// Record that an assembly of `id` has started. Take this while holding
    /// the object's lock, before the lock is released.
    pub fn begin_merge(&self, id: i64) -> MergeTicket {
        let mut set = self.merging.lock().unwrap_or_else(|e| e.into_inner());
        set.insert(id);
        MergeTicket {
            id,
            merging: self.merging.clone(),
        }
    }

    /// Whether an assembly of `id` is running in this process.
    pub fn merge_in_flight(&self, id: i64) -> bool {
        let set = self.merging.lock().unwrap_or_else(|e| e.into_inner());
        set.contains(&id)
    }
}
