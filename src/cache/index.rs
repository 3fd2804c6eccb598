//! Cache Index
//!
//! In-memory map from cached file name to the remote blob it holds and its
//! download state. The engine is the only writer (behind its state lock).

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::remote::FileRecord;

/// Identity of the remote blob a cache entry was fetched from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteIdentity {
    pub storage_path: String,
    pub blob_url: String,
}

impl From<&FileRecord> for RemoteIdentity {
    fn from(record: &FileRecord) -> Self {
        Self {
            storage_path: record.storage_path.clone(),
            blob_url: record.blob_url.clone(),
        }
    }
}

/// Where a cache entry is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DownloadState {
    /// Known remotely, no local content (e.g. after a failed download)
    Absent,
    /// Fetch in progress; `progress` is in [0, 1]
    Downloading { progress: f64 },
    /// Fully downloaded and installed
    Present,
}

/// A cached (or soon to be cached) file
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub file_name: String,
    /// Set iff `state` is `Present`
    pub local_path: Option<PathBuf>,
    pub remote: RemoteIdentity,
    /// Owner of the originating record
    pub owner_id: String,
    pub state: DownloadState,
}

impl CacheEntry {
    pub fn downloading(record: &FileRecord) -> Self {
        Self {
            file_name: record.file_name.clone(),
            local_path: None,
            remote: record.into(),
            owner_id: record.owner_id.clone(),
            state: DownloadState::Downloading { progress: 0.0 },
        }
    }

    pub fn absent(record: &FileRecord) -> Self {
        Self {
            state: DownloadState::Absent,
            ..Self::downloading(record)
        }
    }

    pub fn present(record: &FileRecord, local_path: PathBuf) -> Self {
        Self {
            local_path: Some(local_path),
            state: DownloadState::Present,
            ..Self::downloading(record)
        }
    }

    pub fn is_present(&self) -> bool {
        self.state == DownloadState::Present
    }

    pub fn is_downloading(&self) -> bool {
        matches!(self.state, DownloadState::Downloading { .. })
    }
}

/// File name -> entry, with a reverse lookup by storage path
#[derive(Debug, Default, Clone)]
pub struct CacheIndex {
    entries: BTreeMap<String, CacheEntry>,
    by_storage_path: HashMap<String, String>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, file_name: &str) -> Option<&CacheEntry> {
        self.entries.get(file_name)
    }

    /// Find the entry holding a given blob, whatever name it is cached under
    pub fn by_storage_path(&self, storage_path: &str) -> Option<&CacheEntry> {
        self.by_storage_path
            .get(storage_path)
            .and_then(|name| self.entries.get(name))
    }

    /// Insert or replace the entry for `entry.file_name`.
    ///
    /// Returns the entry that previously occupied the name.
    pub fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        let previous = self.remove(&entry.file_name);
        // A blob lives under one name at a time
        if let Some(stale_name) = self.by_storage_path.get(&entry.remote.storage_path).cloned() {
            self.entries.remove(&stale_name);
        }
        self.by_storage_path
            .insert(entry.remote.storage_path.clone(), entry.file_name.clone());
        self.entries.insert(entry.file_name.clone(), entry);
        previous
    }

    pub fn remove(&mut self, file_name: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(file_name)?;
        if self.by_storage_path.get(&entry.remote.storage_path) == Some(&entry.file_name) {
            self.by_storage_path.remove(&entry.remote.storage_path);
        }
        Some(entry)
    }

    /// Update the progress of a downloading entry if it still belongs to `storage_path`
    pub fn set_progress(&mut self, file_name: &str, storage_path: &str, progress: f64) {
        if let Some(entry) = self.entries.get_mut(file_name) {
            if entry.remote.storage_path == storage_path && entry.is_downloading() {
                entry.state = DownloadState::Downloading {
                    progress: progress.clamp(0.0, 1.0),
                };
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Owned copy of every entry, ordered by file name
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
