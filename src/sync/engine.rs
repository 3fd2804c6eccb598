//! Sync Engine
//!
//! Owns the shared cache state and wires the pieces together: snapshots from
//! the metadata store go through the reconciler, the resulting plan is
//! applied (evictions, renames, downloads), and everything observers care
//! about comes out of one `SyncEvent` channel.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::download::{DownloadManager, DownloadObserver};
use super::publish::{Publisher, RetryPolicy};
use super::reconcile::{ReconcileMode, ReconcilePlan, Reconciler, Rename};
use super::sharing::{MutationOutcome, SharingMutator};
use super::state::SyncState;
use crate::cache::{CacheEntry, CacheStore, DownloadState};
use crate::error::{SyncError, SyncResult};
use crate::remote::{
    BlobStore, FileRecord, MetadataClient, OrphanedUpload, SnapshotCallback, Subscription,
};

/// Default bound on concurrent fetches
const DEFAULT_MAX_DOWNLOADS: usize = 4;

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// `None` bounds fetches only by de-duplication
    pub max_concurrent_downloads: Option<usize>,
    pub upload_retry: RetryPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: Some(DEFAULT_MAX_DOWNLOADS),
            upload_retry: RetryPolicy::default(),
        }
    }
}

/// Everything an observer of the cache needs to know, in delivery order
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Progress { file_name: String, progress: f64 },
    Downloaded { entry: CacheEntry },
    DownloadFailed { file_name: String, error: String },
    Evicted { file_name: String },
    Renamed { from: String, to: String },
    Reconciled {
        mode: ReconcileMode,
        downloads: usize,
        evictions: usize,
        renames: usize,
    },
    Published { record: FileRecord },
}

/// Generation 0 is never superseded
const ALWAYS_RELEVANT: u64 = 0;

#[derive(Clone)]
struct EventSink {
    events: mpsc::UnboundedSender<SyncEvent>,
    current: Arc<AtomicU64>,
}

impl EventSink {
    fn send(&self, generation: u64, event: SyncEvent) {
        if generation != ALWAYS_RELEVANT && self.current.load(Ordering::SeqCst) != generation {
            debug!(generation, "Dropping event from stale subscription");
            return;
        }
        // A dropped receiver means nobody is listening
        let _ = self.events.send(event);
    }
}

/// Routes one pass's download callbacks into the event channel.
///
/// Once a download settles, any record set observed after the pass that
/// started it is applied again, since that pass may have skipped names the
/// download was holding.
struct EventObserver {
    sink: EventSink,
    generation: u64,
    observed_in: u64,
    engine: Weak<Inner>,
}

impl DownloadObserver for EventObserver {
    fn on_progress(&self, file_name: &str, progress: f64) {
        self.sink.send(
            self.generation,
            SyncEvent::Progress {
                file_name: file_name.to_string(),
                progress,
            },
        );
    }

    fn on_complete(&self, file_name: &str, result: SyncResult<CacheEntry>) {
        let event = match result {
            Ok(entry) => SyncEvent::Downloaded { entry },
            Err(e) => SyncEvent::DownloadFailed {
                file_name: file_name.to_string(),
                error: e.to_string(),
            },
        };
        self.sink.send(self.generation, event);

        if let Some(inner) = self.engine.upgrade() {
            SyncEngine { inner }.revisit(self.observed_in);
        }
    }
}

/// Names published while an owner listing was outstanding.
///
/// The listing cannot contain them yet, so they must not be evicted on its
/// account. The last successful listing is kept for replay, so completions
/// after it are remembered until a newer listing ends.
#[derive(Debug, Default)]
struct PublishLog {
    seq: u64,
    next_ticket: u64,
    pending: HashMap<u64, String>,
    completed: Vec<(u64, String)>,
    /// Start positions of listings still in progress
    listings: Vec<u64>,
    /// Start position of the listing kept for replay
    replay: Option<u64>,
}

impl PublishLog {
    fn begin_listing(&mut self) -> u64 {
        self.listings.push(self.seq);
        self.seq
    }

    /// Close a listing; a successful one becomes the replayable listing
    fn end_listing(&mut self, since: u64, succeeded: bool) {
        if let Some(i) = self.listings.iter().position(|s| *s == since) {
            self.listings.swap_remove(i);
        }
        if succeeded {
            self.replay = Some(since);
        }
        self.prune();
    }

    /// Names a listing that started at `since` may be missing
    fn protected_since(&self, since: u64) -> HashSet<String> {
        let mut names: HashSet<String> = self.pending.values().cloned().collect();
        names.extend(
            self.completed
                .iter()
                .filter(|(seq, _)| *seq > since)
                .map(|(_, name)| name.clone()),
        );
        names
    }

    fn start(&mut self, file_name: &str) -> u64 {
        self.next_ticket += 1;
        self.pending.insert(self.next_ticket, file_name.to_string());
        self.next_ticket
    }

    fn finish(&mut self, ticket: u64, succeeded: bool) {
        if let Some(name) = self.pending.remove(&ticket) {
            if succeeded && (!self.listings.is_empty() || self.replay.is_some()) {
                self.seq += 1;
                self.completed.push((self.seq, name));
            }
        }
    }

    fn prune(&mut self) {
        match self.listings.iter().copied().chain(self.replay).min() {
            Some(floor) => self.completed.retain(|(seq, _)| *seq > floor),
            None => self.completed.clear(),
        }
    }
}

/// Newest full record set seen for one mode
#[derive(Debug, Clone)]
struct ObservedSet {
    seq: u64,
    records: Vec<FileRecord>,
    generation: u64,
    /// Publish log position of the owner listing it came from
    listed_since: Option<u64>,
}

/// Files found in the cache root at startup that no entry has claimed yet
#[derive(Debug, Default)]
struct Leftovers {
    names: HashSet<String>,
    passed: HashSet<ReconcileMode>,
}

struct ActiveSubscription {
    generation: u64,
    subscription: Subscription,
    consumer: JoinHandle<()>,
}

struct Inner {
    user_id: String,
    metadata: Arc<dyn MetadataClient>,
    blobs: Arc<dyn BlobStore>,
    cache: Arc<CacheStore>,
    state: Arc<SyncState>,
    downloads: DownloadManager,
    publisher: Publisher,
    sharing: SharingMutator,
    publish_log: Mutex<PublishLog>,
    sink: EventSink,
    generation: Arc<AtomicU64>,
    active: Mutex<Option<ActiveSubscription>>,
    observed: Mutex<HashMap<ReconcileMode, ObservedSet>>,
    observed_seq: AtomicU64,
    leftovers: Mutex<Leftovers>,
}

/// Local cache synchronization for one user
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    /// Build an engine and the receiving end of its event channel
    pub fn new(
        user_id: &str,
        metadata: Arc<dyn MetadataClient>,
        blobs: Arc<dyn BlobStore>,
        cache: CacheStore,
        options: EngineOptions,
    ) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let generation = Arc::new(AtomicU64::new(ALWAYS_RELEVANT));
        let cache = Arc::new(cache);
        let state = Arc::new(SyncState::new());

        let downloads = DownloadManager::new(
            state.clone(),
            cache.clone(),
            blobs.clone(),
            options.max_concurrent_downloads,
        );
        let publisher = Publisher::new(
            metadata.clone(),
            blobs.clone(),
            cache.clone(),
            state.clone(),
            options.upload_retry,
        );

        let leftovers: HashSet<String> = match cache.list() {
            Ok(names) => names.into_iter().collect(),
            Err(e) => {
                warn!(cache_dir = %cache.cache_dir().display(), error = %e, "Cannot list cached files");
                HashSet::new()
            }
        };
        if !leftovers.is_empty() {
            info!(count = leftovers.len(), "Found cached files from an earlier run");
        }

        let inner = Inner {
            user_id: user_id.to_string(),
            sharing: SharingMutator::new(metadata.clone()),
            metadata,
            blobs,
            cache,
            state,
            downloads,
            publisher,
            publish_log: Mutex::new(PublishLog::default()),
            sink: EventSink {
                events,
                current: generation.clone(),
            },
            generation,
            active: Mutex::new(None),
            observed: Mutex::new(HashMap::new()),
            observed_seq: AtomicU64::new(0),
            leftovers: Mutex::new(Leftovers {
                names: leftovers,
                passed: HashSet::new(),
            }),
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    /// Current entries, ordered by file name
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.inner.state.snapshot()
    }

    /// Open the cached content of a present entry
    pub fn open(&self, file_name: &str) -> SyncResult<File> {
        let present = self
            .inner
            .state
            .lock()
            .index
            .get(file_name)
            .map_or(false, CacheEntry::is_present);
        if !present {
            return Err(SyncError::NotFound(file_name.to_string()));
        }
        self.inner.cache.open(file_name)
    }

    pub fn cache_dir(&self) -> &Path {
        self.inner.cache.cache_dir()
    }

    /// Start following the records shared with this user.
    ///
    /// Replaces any previous subscription. Snapshots are applied by a single
    /// consumer task; when several queue up only the newest is applied.
    pub async fn subscribe_recipient(&self) -> SyncResult<()> {
        self.unsubscribe();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<FileRecord>>();
        let on_change: SnapshotCallback = Arc::new(move |records| {
            let _ = tx.send(records);
        });
        let subscription = self
            .inner
            .metadata
            .subscribe(&self.inner.user_id, on_change)
            .await?;

        let weak = Arc::downgrade(&self.inner);
        let consumer = tokio::spawn(async move {
            while let Some(mut records) = rx.recv().await {
                while let Ok(newer) = rx.try_recv() {
                    records = newer;
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                let engine = SyncEngine { inner };
                let seq = engine.observe(ReconcileMode::Recipient, &records, generation, None);
                let reconciler = Reconciler::recipient(engine.user_id());
                engine.apply(&records, &reconciler, generation, seq);
            }
            debug!(generation, "Snapshot consumer stopped");
        });

        *self.inner.active.lock().unwrap() = Some(ActiveSubscription {
            generation,
            subscription,
            consumer,
        });
        info!(user = %self.inner.user_id, generation, "Following shared files");
        Ok(())
    }

    /// Stop following shared files. Downloads already running finish quietly.
    pub fn unsubscribe(&self) {
        let active = self.inner.active.lock().unwrap().take();
        if let Some(active) = active {
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            self.inner
                .observed
                .lock()
                .unwrap()
                .remove(&ReconcileMode::Recipient);
            active.subscription.cancel();
            active.consumer.abort();
            info!(user = %self.inner.user_id, generation = active.generation, "Stopped following shared files");
        }
    }

    /// Reconcile this user's own files against a fresh listing
    pub async fn refresh_owned(&self) -> SyncResult<ReconcilePlan> {
        let since = self.inner.publish_log.lock().unwrap().begin_listing();
        let listed = self.inner.metadata.list_owned(&self.inner.user_id).await;

        // Closing the listing and storing it for replay happen under one lock
        // so no publish lands between them unprotected
        let (records, protected, seq) = {
            let mut log = self.inner.publish_log.lock().unwrap();
            let protected = log.protected_since(since);
            log.end_listing(since, listed.is_ok());
            let records = listed?;
            let seq = self.observe(ReconcileMode::Owner, &records, ALWAYS_RELEVANT, Some(since));
            (records, protected, seq)
        };

        let reconciler = Reconciler::owner(&self.inner.user_id).with_protected(protected);
        Ok(self.apply(&records, &reconciler, ALWAYS_RELEVANT, seq))
    }

    /// Apply a full record set delivered outside a subscription
    pub fn apply_records(&self, records: &[FileRecord], mode: ReconcileMode) -> ReconcilePlan {
        let seq = self.observe(mode, records, ALWAYS_RELEVANT, None);
        let reconciler = Reconciler::new(mode, &self.inner.user_id);
        self.apply(records, &reconciler, ALWAYS_RELEVANT, seq)
    }

    /// Remember the newest record set for a mode; returns its sequence number
    fn observe(
        &self,
        mode: ReconcileMode,
        records: &[FileRecord],
        generation: u64,
        listed_since: Option<u64>,
    ) -> u64 {
        let seq = self.inner.observed_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.observed.lock().unwrap().insert(
            mode,
            ObservedSet {
                seq,
                records: records.to_vec(),
                generation,
                listed_since,
            },
        );
        seq
    }

    /// Apply again every record set observed after `observed_in`
    fn revisit(&self, observed_in: u64) {
        let mut due: Vec<(ReconcileMode, ObservedSet)> = self
            .inner
            .observed
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, set)| set.seq > observed_in)
            .map(|(mode, set)| (*mode, set.clone()))
            .collect();
        due.sort_by_key(|(_, set)| set.seq);

        for (mode, set) in due {
            if set.generation != ALWAYS_RELEVANT
                && self.inner.generation.load(Ordering::SeqCst) != set.generation
            {
                continue;
            }
            let mut reconciler = Reconciler::new(mode, &self.inner.user_id);
            if let Some(since) = set.listed_since {
                let protected = self.inner.publish_log.lock().unwrap().protected_since(since);
                reconciler = reconciler.with_protected(protected);
            }
            debug!(mode = ?mode, seq = set.seq, "Reapplying newest record set after download settled");
            self.apply(&set.records, &reconciler, set.generation, set.seq);
        }
    }

    /// Keep stored record sets in step with a local rename or delete
    fn amend_observed(&self, record_id: &str, new_name: Option<&str>) {
        let mut observed = self.inner.observed.lock().unwrap();
        for set in observed.values_mut() {
            match new_name {
                Some(name) => set
                    .records
                    .iter_mut()
                    .filter(|r| r.id == record_id)
                    .for_each(|r| r.file_name = name.to_string()),
                None => set.records.retain(|r| r.id != record_id),
            }
        }
    }

    /// Remove startup leftovers nobody claimed once both modes have had a pass
    fn sweep_leftovers(&self, mode: ReconcileMode) {
        let names = {
            let mut leftovers = self.inner.leftovers.lock().unwrap();
            if leftovers.names.is_empty() {
                return;
            }
            leftovers.passed.insert(mode);
            if leftovers.passed.len() < 2 {
                return;
            }
            std::mem::take(&mut leftovers.names)
        };

        let _disk = self.inner.state.lock_disk();
        for name in names {
            if self.inner.state.lock().index.get(&name).is_some() {
                continue;
            }
            match self.inner.cache.remove(&name) {
                Ok(true) => info!(file = %name, "Removed cached file no record claims"),
                Ok(false) => {}
                Err(e) => warn!(file = %name, error = %e, "Failed to remove unclaimed file"),
            }
        }
    }

    /// Drop an unclaimed startup leftover under `file_name`
    fn discard_leftover(&self, file_name: &str) {
        if !self.inner.leftovers.lock().unwrap().names.remove(file_name) {
            return;
        }
        let _disk = self.inner.state.lock_disk();
        if self.inner.state.lock().index.get(file_name).is_some() {
            return;
        }
        match self.inner.cache.remove(file_name) {
            Ok(_) => debug!(file = file_name, "Removed copy left from an earlier run"),
            Err(e) => warn!(file = file_name, error = %e, "Failed to remove unclaimed file"),
        }
    }

    fn apply(
        &self,
        records: &[FileRecord],
        reconciler: &Reconciler,
        generation: u64,
        observed_in: u64,
    ) -> ReconcilePlan {
        let (plan, evictions) = {
            let state = self.inner.state.lock();
            let plan = reconciler.reconcile(records, &state.index, &state.in_flight);
            let evictions: Vec<(String, String)> = plan
                .to_evict
                .iter()
                .filter_map(|name| {
                    state
                        .index
                        .get(name)
                        .map(|e| (name.clone(), e.remote.storage_path.clone()))
                })
                .collect();
            (plan, evictions)
        };

        for record in &plan.rejected {
            warn!(id = %record.id, file = ?record.file_name, "Ignoring record with unusable file name");
        }
        for record in &plan.shadowed {
            debug!(id = %record.id, file = %record.file_name, owner = %record.owner_id, "Record shadowed by another with the same name");
        }

        let evicted = evictions
            .iter()
            .filter(|(name, path)| self.evict(name, Some(path.as_str()), generation))
            .count();
        let renamed = plan
            .to_rename
            .iter()
            .filter(|rename| self.apply_rename(rename, generation))
            .count();

        let observer: Arc<dyn DownloadObserver> = Arc::new(EventObserver {
            sink: self.inner.sink.clone(),
            generation,
            observed_in,
            engine: Arc::downgrade(&self.inner),
        });
        let started = plan
            .to_download
            .iter()
            .filter(|record| self.inner.downloads.schedule((*record).clone(), observer.clone()))
            .count();

        if plan.is_empty() {
            debug!(mode = ?reconciler.mode(), records = records.len(), "Cache already in sync");
        } else {
            info!(
                mode = ?reconciler.mode(),
                records = records.len(),
                downloads = started,
                evictions = evicted,
                renames = renamed,
                "Reconciled cache"
            );
        }
        self.inner.sink.send(
            generation,
            SyncEvent::Reconciled {
                mode: reconciler.mode(),
                downloads: started,
                evictions: evicted,
                renames: renamed,
            },
        );
        self.sweep_leftovers(reconciler.mode());
        plan
    }

    /// Drop a cached file unless it is busy or now holds a different blob
    fn evict(&self, file_name: &str, expected_path: Option<&str>, generation: u64) -> bool {
        let _disk = self.inner.state.lock_disk();
        {
            let mut state = self.inner.state.lock();
            let shared = &*state;
            let evictable = shared.index.get(file_name).map_or(false, |e| {
                !e.is_downloading()
                    && !shared.in_flight.contains(&e.remote.storage_path)
                    && expected_path.map_or(true, |p| p == e.remote.storage_path)
            });
            if !evictable {
                return false;
            }
            state.index.remove(file_name);
        }

        if let Err(e) = self.inner.cache.remove(file_name) {
            warn!(file = file_name, error = %e, "Failed to remove evicted file");
        }
        info!(file = file_name, "Evicted from cache");
        self.inner.sink.send(
            generation,
            SyncEvent::Evicted {
                file_name: file_name.to_string(),
            },
        );
        true
    }

    /// Move a present entry to its record's new name
    fn apply_rename(&self, rename: &Rename, generation: u64) -> bool {
        let _disk = self.inner.state.lock_disk();
        let entry = {
            let state = self.inner.state.lock();
            let target_busy = state
                .index
                .get(&rename.to)
                .map_or(false, CacheEntry::is_downloading);
            match state.index.get(&rename.from) {
                Some(e) if !target_busy && e.is_present() && e.remote.storage_path == rename.storage_path => {
                    e.clone()
                }
                _ => return false,
            }
        };

        let moved = self.inner.cache.rename(&rename.from, &rename.to);

        let mut state = self.inner.state.lock();
        let unchanged = state
            .index
            .get(&rename.from)
            .map_or(false, |e| e.remote.storage_path == rename.storage_path);
        if unchanged {
            state.index.remove(&rename.from);
        }
        match moved {
            Ok(local_path) => {
                if !state.index.get(&rename.to).map_or(false, CacheEntry::is_downloading) {
                    state.index.insert(CacheEntry {
                        file_name: rename.to.clone(),
                        local_path: Some(local_path),
                        state: DownloadState::Present,
                        ..entry
                    });
                }
                drop(state);
                info!(from = %rename.from, to = %rename.to, "Renamed cached file");
                self.inner.sink.send(
                    generation,
                    SyncEvent::Renamed {
                        from: rename.from.clone(),
                        to: rename.to.clone(),
                    },
                );
                true
            }
            Err(e) => {
                // Without its content the entry is refetched on the next pass
                warn!(from = %rename.from, to = %rename.to, error = %e, "Failed to rename cached file");
                false
            }
        }
    }

    /// Publish a local file under `file_name`
    pub async fn publish(&self, source: &Path, file_name: &str) -> SyncResult<FileRecord> {
        let ticket = self.inner.publish_log.lock().unwrap().start(file_name);
        let result = self
            .inner
            .publisher
            .publish(&self.inner.user_id, source, file_name)
            .await;
        self.publish_done(ticket, result)
    }

    /// Publish several files concurrently; results keep the input order
    pub async fn publish_all(&self, files: &[(PathBuf, String)]) -> Vec<SyncResult<FileRecord>> {
        futures::future::join_all(files.iter().map(|(source, name)| self.publish(source, name)))
            .await
    }

    /// Finish a publish that failed with `Inconsistent`
    pub async fn retry_metadata(&self, orphan: OrphanedUpload) -> SyncResult<FileRecord> {
        let ticket = self
            .inner
            .publish_log
            .lock()
            .unwrap()
            .start(&orphan.record.file_name);
        let result = self.inner.publisher.retry_metadata(orphan).await;
        self.publish_done(ticket, result)
    }

    fn publish_done(&self, ticket: u64, result: SyncResult<FileRecord>) -> SyncResult<FileRecord> {
        self.inner
            .publish_log
            .lock()
            .unwrap()
            .finish(ticket, result.is_ok());
        if let Ok(record) = &result {
            self.inner.sink.send(
                ALWAYS_RELEVANT,
                SyncEvent::Published {
                    record: record.clone(),
                },
            );
        }
        result
    }

    fn ensure_owner(&self, record: &FileRecord, action: &str) -> SyncResult<()> {
        if record.owner_id != self.inner.user_id {
            return Err(SyncError::Rejected(format!(
                "only the owner can {} '{}'",
                action, record.file_name
            )));
        }
        Ok(())
    }

    /// Rename one of this user's records and its cached copy
    pub async fn rename(&self, record: &FileRecord, new_name: &str) -> SyncResult<()> {
        CacheStore::validate_name(new_name)?;
        self.ensure_owner(record, "rename")?;
        if new_name == record.file_name {
            return Ok(());
        }

        if self.inner.state.lock().index.get(new_name).is_some() {
            return Err(SyncError::Conflict(new_name.to_string()));
        }
        let owned = self.inner.metadata.list_owned(&self.inner.user_id).await?;
        if owned
            .iter()
            .any(|r| r.file_name == new_name && r.id != record.id)
        {
            return Err(SyncError::Conflict(new_name.to_string()));
        }

        self.inner.metadata.rename(&record.id, new_name).await?;
        info!(id = %record.id, from = %record.file_name, to = new_name, "Renamed record");

        self.amend_observed(&record.id, Some(new_name));
        let moved = self.apply_rename(
            &Rename {
                from: record.file_name.clone(),
                to: new_name.to_string(),
                storage_path: record.storage_path.clone(),
            },
            ALWAYS_RELEVANT,
        );
        if !moved {
            // A copy from an earlier run may be stale; the next pass fetches the new name
            self.discard_leftover(&record.file_name);
        }
        Ok(())
    }

    /// Delete one of this user's records, its blob and its cached copy.
    ///
    /// Anything already gone counts as deleted. A blob that cannot be removed
    /// is logged and left behind since the record no longer points at it.
    pub async fn delete(&self, record: &FileRecord) -> SyncResult<()> {
        self.ensure_owner(record, "delete")?;

        match self.inner.metadata.delete(&record.id).await {
            Ok(()) => info!(id = %record.id, file = %record.file_name, "Deleted record"),
            Err(e) if e.is_not_found() => debug!(id = %record.id, "Record already deleted"),
            Err(e) => return Err(e),
        }

        match self.inner.blobs.delete(&record.storage_path).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(storage_path = %record.storage_path, error = %e, "Blob left behind"),
        }

        self.amend_observed(&record.id, None);
        if !self.evict(&record.file_name, Some(record.storage_path.as_str()), ALWAYS_RELEVANT) {
            self.discard_leftover(&record.file_name);
        }
        Ok(())
    }

    pub async fn grant(&self, record_id: &str, recipient_id: &str) -> SyncResult<MutationOutcome> {
        self.inner.sharing.grant(record_id, recipient_id).await
    }

    pub async fn revoke(&self, record_id: &str, recipient_id: &str) -> SyncResult<MutationOutcome> {
        self.inner.sharing.revoke(record_id, recipient_id).await
    }

    /// Wait for every scheduled download to settle
    pub async fn wait_idle(&self) {
        self.inner.downloads.wait_idle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{InMemoryBlobStore, InMemoryMetadataStore};
    use std::io::Read;
    use std::time::Duration;

    struct World {
        dir: tempfile::TempDir,
        metadata: Arc<InMemoryMetadataStore>,
        blobs: Arc<InMemoryBlobStore>,
    }

    impl World {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                metadata: Arc::new(InMemoryMetadataStore::new()),
                blobs: Arc::new(InMemoryBlobStore::new()),
            }
        }

        /// An engine for `user` with its own cache directory
        fn engine(&self, user: &str, device: &str) -> (SyncEngine, mpsc::UnboundedReceiver<SyncEvent>) {
            let cache = CacheStore::with_root(self.dir.path().join(device).join(user)).unwrap();
            SyncEngine::new(
                user,
                self.metadata.clone(),
                self.blobs.clone(),
                cache,
                EngineOptions {
                    max_concurrent_downloads: Some(2),
                    upload_retry: RetryPolicy::immediate(3),
                },
            )
        }

        fn source(&self, name: &str, content: &str) -> PathBuf {
            let path = self.dir.path().join(format!("src-{name}"));
            std::fs::write(&path, content).unwrap();
            path
        }
    }

    async fn wait_for(
        rx: &mut mpsc::UnboundedReceiver<SyncEvent>,
        matches: impl Fn(&SyncEvent) -> bool,
    ) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn downloaded(rx: &mut mpsc::UnboundedReceiver<SyncEvent>, name: &str) -> CacheEntry {
        match wait_for(rx, |e| matches!(e, SyncEvent::Downloaded { entry } if entry.file_name == name)).await {
            SyncEvent::Downloaded { entry } => entry,
            _ => unreachable!(),
        }
    }

    /// Let queued snapshots and downloads run, then collect what was emitted
    async fn drain(engine: &SyncEngine, rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.wait_idle().await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn read(engine: &SyncEngine, name: &str) -> String {
        let mut s = String::new();
        engine.open(name).unwrap().read_to_string(&mut s).unwrap();
        s
    }

    fn state_of(engine: &SyncEngine, name: &str) -> Option<DownloadState> {
        engine
            .snapshot()
            .into_iter()
            .find(|e| e.file_name == name)
            .map(|e| e.state)
    }

    #[tokio::test]
    async fn test_publish_share_download_then_delete() {
        let world = World::new();
        let (owner, _owner_events) = world.engine("U1", "phone");
        let (recipient, mut events) = world.engine("U2", "laptop");
        recipient.subscribe_recipient().await.unwrap();

        let record = owner
            .publish(&world.source("report", "Q3 numbers"), "report.pdf")
            .await
            .unwrap();
        assert_eq!(record.owner_id, "U1");
        assert!(record.authorized_recipients.is_empty());

        owner.grant(&record.id, "U2").await.unwrap();
        let entry = downloaded(&mut events, "report.pdf").await;
        assert_eq!(entry.state, DownloadState::Present);
        assert_eq!(read(&recipient, "report.pdf"), "Q3 numbers");
        assert_eq!(world.blobs.download_calls(), 1);

        // Unrelated mutations redeliver the same set; nothing new happens
        owner
            .publish(&world.source("other", "x"), "other.txt")
            .await
            .unwrap();
        drain(&recipient, &mut events).await;
        assert_eq!(world.blobs.download_calls(), 1);

        owner.delete(&record).await.unwrap();
        wait_for(&mut events, |e| {
            matches!(e, SyncEvent::Evicted { file_name } if file_name == "report.pdf")
        })
        .await;
        assert_eq!(state_of(&recipient, "report.pdf"), None);
        assert!(!recipient.cache_dir().join("report.pdf").exists());
        assert_eq!(state_of(&owner, "report.pdf"), None);
        assert!(!world.blobs.contains(&record.storage_path));
    }

    #[tokio::test]
    async fn test_own_upload_is_not_downloaded_again() {
        let world = World::new();
        let (owner, _events) = world.engine("U1", "phone");

        owner
            .publish(&world.source("a", "alpha"), "a.txt")
            .await
            .unwrap();
        let plan = owner.refresh_owned().await.unwrap();

        assert!(plan.is_empty(), "{plan:?}");
        assert_eq!(world.blobs.download_calls(), 0);
        assert_eq!(state_of(&owner, "a.txt"), Some(DownloadState::Present));
    }

    #[tokio::test]
    async fn test_owner_devices_converge_through_listing() {
        let world = World::new();
        let (phone, _phone_events) = world.engine("U1", "phone");
        let (laptop, _laptop_events) = world.engine("U1", "laptop");

        let record = phone
            .publish(&world.source("n", "notes"), "notes.md")
            .await
            .unwrap();

        let plan = laptop.refresh_owned().await.unwrap();
        assert_eq!(plan.to_download.len(), 1);
        laptop.wait_idle().await;
        assert_eq!(read(&laptop, "notes.md"), "notes");

        phone.delete(&record).await.unwrap();
        let plan = laptop.refresh_owned().await.unwrap();
        assert_eq!(plan.to_evict, vec!["notes.md".to_string()]);
        assert_eq!(state_of(&laptop, "notes.md"), None);
    }

    async fn reconciled(rx: &mut mpsc::UnboundedReceiver<SyncEvent>, downloads: usize) {
        wait_for(rx, |e| {
            matches!(e, SyncEvent::Reconciled { downloads: n, .. } if *n == downloads)
        })
        .await;
    }

    #[tokio::test]
    async fn test_revoke_during_download_ends_evicted() {
        let world = World::new();
        let (owner, _owner_events) = world.engine("U1", "phone");
        let (recipient, mut events) = world.engine("U2", "laptop");
        let record = owner.publish(&world.source("b", "bravo"), "b.txt").await.unwrap();
        recipient.subscribe_recipient().await.unwrap();
        world.blobs.hold_downloads();

        owner.grant(&record.id, "U2").await.unwrap();
        reconciled(&mut events, 1).await;
        owner.revoke(&record.id, "U2").await.unwrap();
        // b.txt is still arriving, so this pass leaves it alone
        reconciled(&mut events, 0).await;
        assert!(matches!(state_of(&recipient, "b.txt"), Some(DownloadState::Downloading { .. })));

        world.blobs.release_downloads();
        wait_for(&mut events, |e| {
            matches!(e, SyncEvent::Evicted { file_name } if file_name == "b.txt")
        })
        .await;
        recipient.wait_idle().await;

        assert!(recipient.snapshot().is_empty());
        assert!(!recipient.cache_dir().join("b.txt").exists());
    }

    #[tokio::test]
    async fn test_newer_record_for_busy_name_follows_download() {
        let world = World::new();
        let (first, _e1) = world.engine("U1", "one");
        let (second, _e3) = world.engine("U3", "three");
        let (recipient, mut events) = world.engine("U2", "laptop");
        let older = first.publish(&world.source("1", "from U1"), "r.pdf").await.unwrap();
        let newer = second.publish(&world.source("3", "from U3"), "r.pdf").await.unwrap();
        recipient.subscribe_recipient().await.unwrap();
        world.blobs.hold_downloads();

        first.grant(&older.id, "U2").await.unwrap();
        reconciled(&mut events, 1).await;
        second.grant(&newer.id, "U2").await.unwrap();
        reconciled(&mut events, 0).await;

        world.blobs.release_downloads();
        wait_for(&mut events, |e| {
            matches!(e, SyncEvent::Downloaded { entry } if entry.remote.storage_path == newer.storage_path)
        })
        .await;
        recipient.wait_idle().await;

        assert_eq!(read(&recipient, "r.pdf"), "from U3");
        assert_eq!(world.blobs.download_calls(), 2);
        assert!(recipient
            .apply_records(&world.metadata.records(), ReconcileMode::Recipient)
            .is_empty());
    }

    #[tokio::test]
    async fn test_replayed_listing_keeps_later_uploads() {
        let world = World::new();
        let (phone, _phone_events) = world.engine("U1", "phone");
        let (laptop, _laptop_events) = world.engine("U1", "laptop");
        phone.publish(&world.source("n", "notes"), "notes.md").await.unwrap();
        world.blobs.hold_downloads();

        assert_eq!(laptop.refresh_owned().await.unwrap().to_download.len(), 1);
        laptop.refresh_owned().await.unwrap();
        // Published after the newest listing, which therefore lacks it
        laptop.publish(&world.source("l", "late"), "late.txt").await.unwrap();

        world.blobs.release_downloads();
        laptop.wait_idle().await;

        assert_eq!(read(&laptop, "notes.md"), "notes");
        assert_eq!(read(&laptop, "late.txt"), "late");
    }

    #[tokio::test]
    async fn test_restart_removes_files_no_record_claims() {
        let world = World::new();
        let (owner, _owner_events) = world.engine("U1", "phone");
        let gone = owner.publish(&world.source("a", "alpha"), "a.txt").await.unwrap();
        let kept = owner.publish(&world.source("b", "bravo"), "b.txt").await.unwrap();
        owner.grant(&gone.id, "U2").await.unwrap();
        owner.grant(&kept.id, "U2").await.unwrap();

        {
            let (recipient, mut events) = world.engine("U2", "laptop");
            recipient.subscribe_recipient().await.unwrap();
            drain(&recipient, &mut events).await;
            assert_eq!(read(&recipient, "a.txt"), "alpha");
            recipient.unsubscribe();
        }

        // Deleted while the laptop was off
        owner.delete(&gone).await.unwrap();

        let (recipient, mut events) = world.engine("U2", "laptop");
        assert!(recipient.cache_dir().join("a.txt").exists());
        assert!(recipient.snapshot().is_empty());

        // U2 owns nothing; one mode alone does not settle leftovers
        recipient.apply_records(&[], ReconcileMode::Owner);
        assert!(recipient.cache_dir().join("a.txt").exists());

        recipient.subscribe_recipient().await.unwrap();
        drain(&recipient, &mut events).await;

        assert!(!recipient.cache_dir().join("a.txt").exists());
        assert_eq!(read(&recipient, "b.txt"), "bravo");
        let names: Vec<String> = recipient.snapshot().into_iter().map(|e| e.file_name).collect();
        assert_eq!(names, vec!["b.txt"]);
    }

    #[tokio::test]
    async fn test_fresh_engine_cleans_up_after_rename_and_delete() {
        let world = World::new();
        let (a, b) = {
            let (owner, _events) = world.engine("U1", "phone");
            (
                owner.publish(&world.source("a", "a"), "a.txt").await.unwrap(),
                owner.publish(&world.source("b", "b"), "b.txt").await.unwrap(),
            )
        };

        let (owner, _events) = world.engine("U1", "phone");
        assert!(owner.snapshot().is_empty());
        owner.rename(&a, "c.txt").await.unwrap();
        owner.delete(&b).await.unwrap();

        assert!(!owner.cache_dir().join("a.txt").exists());
        assert!(!owner.cache_dir().join("b.txt").exists());

        owner.refresh_owned().await.unwrap();
        owner.wait_idle().await;
        assert_eq!(read(&owner, "c.txt"), "a");
    }

    #[tokio::test]
    async fn test_rename_moves_cached_copies() {
        let world = World::new();
        let (owner, _owner_events) = world.engine("U1", "phone");
        let (recipient, mut events) = world.engine("U2", "laptop");
        recipient.subscribe_recipient().await.unwrap();

        let record = owner
            .publish(&world.source("d", "draft body"), "draft.txt")
            .await
            .unwrap();
        owner.grant(&record.id, "U2").await.unwrap();
        downloaded(&mut events, "draft.txt").await;

        owner.rename(&record, "final.txt").await.unwrap();
        wait_for(&mut events, |e| {
            matches!(e, SyncEvent::Renamed { to, .. } if to == "final.txt")
        })
        .await;

        assert_eq!(read(&recipient, "final.txt"), "draft body");
        assert_eq!(state_of(&recipient, "draft.txt"), None);
        assert_eq!(read(&owner, "final.txt"), "draft body");
        assert_eq!(world.blobs.download_calls(), 1);

        // Only the owner may rename
        let renamed = world.metadata.get(&record.id).unwrap();
        assert!(matches!(
            recipient.rename(&renamed, "mine.txt").await,
            Err(SyncError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_to_taken_name_conflicts() {
        let world = World::new();
        let (owner, _events) = world.engine("U1", "phone");
        let a = owner.publish(&world.source("a", "a"), "a.txt").await.unwrap();
        owner.publish(&world.source("b", "b"), "b.txt").await.unwrap();

        assert!(matches!(owner.rename(&a, "b.txt").await, Err(SyncError::Conflict(_))));
        assert!(matches!(owner.rename(&a, "../b").await, Err(SyncError::InvalidName(_))));
        assert_eq!(world.metadata.get(&a.id).unwrap().file_name, "a.txt");
    }

    #[tokio::test]
    async fn test_newest_record_wins_shared_name() {
        let world = World::new();
        let (first, _e1) = world.engine("U1", "one");
        let (second, _e3) = world.engine("U3", "three");
        let (recipient, mut events) = world.engine("U2", "laptop");
        recipient.subscribe_recipient().await.unwrap();

        let older = first.publish(&world.source("1", "from U1"), "report.pdf").await.unwrap();
        let newer = second.publish(&world.source("3", "from U3"), "report.pdf").await.unwrap();

        first.grant(&older.id, "U2").await.unwrap();
        downloaded(&mut events, "report.pdf").await;
        assert_eq!(read(&recipient, "report.pdf"), "from U1");

        second.grant(&newer.id, "U2").await.unwrap();
        let entry = downloaded(&mut events, "report.pdf").await;
        assert_eq!(entry.remote.storage_path, newer.storage_path);
        assert_eq!(read(&recipient, "report.pdf"), "from U3");
    }

    #[tokio::test]
    async fn test_cancelled_subscription_stops_delivery() {
        let world = World::new();
        let (owner, _owner_events) = world.engine("U1", "phone");
        let (recipient, mut events) = world.engine("U2", "laptop");

        recipient.subscribe_recipient().await.unwrap();
        recipient.unsubscribe();
        assert_eq!(world.metadata.live_subscriptions(), 0);

        let record = owner.publish(&world.source("a", "a"), "a.txt").await.unwrap();
        owner.grant(&record.id, "U2").await.unwrap();

        let events_seen = drain(&recipient, &mut events).await;
        assert!(!events_seen
            .iter()
            .any(|e| matches!(e, SyncEvent::Downloaded { .. })));
        assert!(recipient.snapshot().is_empty());
        assert_eq!(world.blobs.download_calls(), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_downloads_once() {
        let world = World::new();
        let (owner, _owner_events) = world.engine("U1", "phone");
        let (recipient, mut events) = world.engine("U2", "laptop");

        recipient.subscribe_recipient().await.unwrap();
        recipient.subscribe_recipient().await.unwrap();
        assert_eq!(world.metadata.live_subscriptions(), 1);

        let record = owner.publish(&world.source("a", "a"), "a.txt").await.unwrap();
        owner.grant(&record.id, "U2").await.unwrap();
        downloaded(&mut events, "a.txt").await;

        let rest = drain(&recipient, &mut events).await;
        assert!(!rest.iter().any(|e| matches!(e, SyncEvent::Downloaded { .. })));
        assert_eq!(world.blobs.download_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_download_is_retried_next_pass() {
        let world = World::new();
        let (owner, _owner_events) = world.engine("U1", "phone");
        let (recipient, mut events) = world.engine("U2", "laptop");
        recipient.subscribe_recipient().await.unwrap();

        let record = owner.publish(&world.source("a", "abcdef"), "a.txt").await.unwrap();
        world.blobs.break_download(&record.storage_path, 2);
        owner.grant(&record.id, "U2").await.unwrap();

        wait_for(&mut events, |e| matches!(e, SyncEvent::DownloadFailed { .. })).await;
        recipient.wait_idle().await;
        assert_eq!(state_of(&recipient, "a.txt"), Some(DownloadState::Absent));
        assert!(!recipient.cache_dir().join("a.txt").exists());

        // Any later delivery picks it up again
        owner.grant(&record.id, "U3").await.unwrap();
        downloaded(&mut events, "a.txt").await;
        assert_eq!(read(&recipient, "a.txt"), "abcdef");
    }

    #[tokio::test]
    async fn test_publish_all_keeps_input_order() {
        let world = World::new();
        let (owner, _events) = world.engine("U1", "phone");
        let files = vec![
            (world.source("a", "a"), "a.txt".to_string()),
            (world.source("bad", "x"), "..".to_string()),
            (world.source("b", "b"), "b.txt".to_string()),
        ];

        let results = owner.publish_all(&files).await;
        assert_eq!(results[0].as_ref().unwrap().file_name, "a.txt");
        assert!(matches!(results[1], Err(SyncError::InvalidName(_))));
        assert_eq!(results[2].as_ref().unwrap().file_name, "b.txt");
    }

    #[tokio::test]
    async fn test_retry_metadata_after_inconsistent_publish() {
        let world = World::new();
        let (owner, mut events) = world.engine("U1", "phone");
        world.metadata.fail_next_creates(1);

        let err = owner
            .publish(&world.source("a", "alpha"), "a.txt")
            .await
            .unwrap_err();
        let SyncError::Inconsistent { orphan, .. } = err else {
            panic!("expected Inconsistent");
        };

        let record = owner.retry_metadata(*orphan).await.unwrap();
        assert_eq!(world.blobs.upload_attempts(), 1);
        assert_eq!(read(&owner, "a.txt"), "alpha");
        wait_for(&mut events, |e| {
            matches!(e, SyncEvent::Published { record: r } if r.id == record.id)
        })
        .await;
    }

    #[test]
    fn test_publish_log_protects_names_finished_during_listing() {
        let mut log = PublishLog::default();
        let early = log.start("early.txt");
        log.finish(early, true);

        let since = log.begin_listing();
        let during = log.start("during.txt");
        let running = log.start("running.txt");
        let failed = log.start("failed.txt");
        log.finish(during, true);
        log.finish(failed, false);

        let protected = log.protected_since(since);
        log.end_listing(since, false);
        assert!(protected.contains("during.txt"));
        assert!(protected.contains("running.txt"));
        assert!(!protected.contains("early.txt"));
        assert!(!protected.contains("failed.txt"));

        log.finish(running, true);
        assert!(log.completed.is_empty());
    }

    #[test]
    fn test_publish_log_remembers_completions_for_replayed_listing() {
        let mut log = PublishLog::default();
        let first = log.begin_listing();
        log.end_listing(first, true);

        let late = log.start("late.txt");
        log.finish(late, true);
        assert!(log.protected_since(first).contains("late.txt"));

        // A newer listing saw it, so it no longer needs remembering
        let second = log.begin_listing();
        log.end_listing(second, true);
        assert!(log.completed.is_empty());
        assert!(log.protected_since(second).is_empty());
    }
}
