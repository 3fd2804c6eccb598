//! Shared sync state
//!
//! The cache index and the in-flight set are the only state mutated from
//! several tasks. Both sit behind one mutex that is never held across an
//! `.await` or while touching the filesystem. Filesystem mutations of the
//! cache (install, evict, rename) are serialized by a second lock that
//! network code never takes. Lock order: disk, then state.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use crate::cache::{CacheEntry, CacheIndex};

/// Everything guarded by the state lock
#[derive(Debug, Default)]
pub struct SharedState {
    pub index: CacheIndex,
    /// Storage paths whose content is currently arriving
    pub in_flight: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct SyncState {
    state: Mutex<SharedState>,
    disk: Mutex<()>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the index and in-flight set
    pub fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap()
    }

    /// Serialize a filesystem mutation of the cache
    pub fn lock_disk(&self) -> MutexGuard<'_, ()> {
        self.disk.lock().unwrap()
    }

    /// Copy of every entry, for rendering
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.lock().index.snapshot()
    }

    pub fn in_flight(&self) -> HashSet<String> {
        self.lock().in_flight.clone()
    }
}
