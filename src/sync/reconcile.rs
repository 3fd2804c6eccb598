//! Reconciler
//!
//! Diffs a full observed record set against the cache index and produces
//! the actions that bring the cache in line with it. Pure: it reads the
//! index and the in-flight set and never fails, so it can run again on every
//! delivery, including duplicate and out-of-order ones.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};

use crate::cache::{CacheEntry, CacheIndex, CacheStore, DownloadState};
use crate::remote::FileRecord;

/// Which slice of the cache a record set is authoritative for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileMode {
    /// One-shot listing of the local user's own records
    Owner,
    /// Live feed of records other owners shared with the local user
    Recipient,
}

/// Move cached content to the name its record now carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    pub from: String,
    pub to: String,
    pub storage_path: String,
}

/// Actions computed by one reconciliation pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcilePlan {
    pub to_download: Vec<FileRecord>,
    pub to_evict: Vec<String>,
    pub to_rename: Vec<Rename>,
    /// Records that lost their cache slot to another record of the same name
    pub shadowed: Vec<FileRecord>,
    /// Records whose file name cannot be used as a cache key
    pub rejected: Vec<FileRecord>,
}

impl ReconcilePlan {
    /// True when applying the plan would change nothing
    pub fn is_empty(&self) -> bool {
        self.to_download.is_empty() && self.to_evict.is_empty() && self.to_rename.is_empty()
    }
}

/// Newest record wins a contested name; ids break ties
fn supersedes(candidate: &FileRecord, current: &FileRecord) -> bool {
    (candidate.created_at, &candidate.id) > (current.created_at, &current.id)
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    mode: ReconcileMode,
    user_id: String,
    protected: HashSet<String>,
}

impl Reconciler {
    pub fn new(mode: ReconcileMode, user_id: &str) -> Self {
        Self {
            mode,
            user_id: user_id.to_string(),
            protected: HashSet::new(),
        }
    }

    pub fn owner(user_id: &str) -> Self {
        Self::new(ReconcileMode::Owner, user_id)
    }

    pub fn recipient(user_id: &str) -> Self {
        Self::new(ReconcileMode::Recipient, user_id)
    }

    /// Names that must survive this pass even if the record set omits them
    pub fn with_protected(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.protected.extend(names);
        self
    }

    pub fn mode(&self) -> ReconcileMode {
        self.mode
    }

    /// Whether this pass is authoritative for an entry
    fn in_scope(&self, entry: &CacheEntry) -> bool {
        match self.mode {
            ReconcileMode::Owner => entry.owner_id == self.user_id,
            ReconcileMode::Recipient => entry.owner_id != self.user_id,
        }
    }

    pub fn reconcile(
        &self,
        observed: &[FileRecord],
        index: &CacheIndex,
        in_flight: &HashSet<String>,
    ) -> ReconcilePlan {
        let mut plan = ReconcilePlan::default();

        // One record per cache key
        let mut winners: BTreeMap<&str, &FileRecord> = BTreeMap::new();
        for record in observed {
            if CacheStore::validate_name(&record.file_name).is_err() {
                plan.rejected.push(record.clone());
                continue;
            }
            match winners.entry(record.file_name.as_str()) {
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
                Entry::Occupied(mut slot) => {
                    let current = *slot.get();
                    if current.storage_path == record.storage_path {
                        continue;
                    }
                    if supersedes(record, current) {
                        plan.shadowed.push(current.clone());
                        slot.insert(record);
                    } else {
                        plan.shadowed.push(record.clone());
                    }
                }
            }
        }

        let observed_paths: HashSet<&str> =
            winners.values().map(|r| r.storage_path.as_str()).collect();

        // Names a download or rename will overwrite atomically
        let mut replaced: HashSet<&str> = HashSet::new();
        // Old names of blobs that are being fetched again under a new name
        let mut stale: Vec<&str> = Vec::new();

        for record in winners.values() {
            let name = record.file_name.as_str();
            let path = record.storage_path.as_str();

            if in_flight.contains(path) {
                continue;
            }

            let occupant = index.get(name);
            if let Some(occupant) = occupant {
                if occupant.remote.storage_path == path {
                    if occupant.state == DownloadState::Absent {
                        plan.to_download.push((*record).clone());
                        replaced.insert(name);
                    }
                    continue;
                }
                if !self.in_scope(occupant) {
                    plan.shadowed.push((*record).clone());
                    continue;
                }
                if occupant.is_downloading() {
                    // Slot busy; revisit once that fetch settles
                    continue;
                }
            }

            let target_in_use = occupant
                .map_or(false, |o| observed_paths.contains(o.remote.storage_path.as_str()));

            match index.by_storage_path(path) {
                Some(existing) if existing.is_downloading() => {}
                Some(existing) if existing.is_present() && !target_in_use => {
                    plan.to_rename.push(Rename {
                        from: existing.file_name.clone(),
                        to: record.file_name.clone(),
                        storage_path: record.storage_path.clone(),
                    });
                    replaced.insert(name);
                }
                existing => {
                    if let Some(existing) = existing {
                        stale.push(existing.file_name.as_str());
                    }
                    plan.to_download.push((*record).clone());
                    replaced.insert(name);
                }
            }
        }

        let rename_sources: HashSet<&str> = plan.to_rename.iter().map(|r| r.from.as_str()).collect();

        for entry in index.iter() {
            let name = entry.file_name.as_str();
            let path = entry.remote.storage_path.as_str();
            let is_stale = stale.contains(&name);

            if !self.in_scope(entry)
                || entry.is_downloading()
                || in_flight.contains(path)
                || (observed_paths.contains(path) && !is_stale)
                || self.protected.contains(name)
                || replaced.contains(name)
                || rename_sources.contains(name)
            {
                continue;
            }
            plan.to_evict.push(entry.file_name.clone());
        }

        plan
    }
}
