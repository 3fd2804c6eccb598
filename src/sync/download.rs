//! Download Manager
//!
//! Executes the fetch half of a reconciliation plan. Each fetch is its own
//! tokio task, de-duplicated by storage path through the shared in-flight
//! set, optionally bounded by a semaphore. Bytes stream into a staged temp
//! file that is installed atomically only once the blob is complete.

use std::io::Write;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::state::SyncState;
use crate::cache::{CacheEntry, CacheStore, StagedFile};
use crate::error::{SyncError, SyncResult};
use crate::remote::{BlobDownload, BlobStore, FileRecord};

/// Receives per-download progress and completion
pub trait DownloadObserver: Send + Sync {
    /// `progress` is in [0, 1]
    fn on_progress(&self, file_name: &str, progress: f64);

    fn on_complete(&self, file_name: &str, result: SyncResult<CacheEntry>);
}

#[derive(Clone)]
pub struct DownloadManager {
    state: Arc<SyncState>,
    cache: Arc<CacheStore>,
    blobs: Arc<dyn BlobStore>,
    permits: Option<Arc<Semaphore>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl DownloadManager {
    /// `max_concurrent` of `None` leaves fetches bounded only by de-duplication
    pub fn new(
        state: Arc<SyncState>,
        cache: Arc<CacheStore>,
        blobs: Arc<dyn BlobStore>,
        max_concurrent: Option<usize>,
    ) -> Self {
        Self {
            state,
            cache,
            blobs,
            permits: max_concurrent.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Start fetching `record` unless its blob is already in flight.
    ///
    /// Returns whether a download was started. Must be called from within a
    /// tokio runtime.
    pub fn schedule(&self, record: FileRecord, observer: Arc<dyn DownloadObserver>) -> bool {
        if let Err(e) = CacheStore::validate_name(&record.file_name) {
            warn!(storage_path = %record.storage_path, error = %e, "Refusing download");
            return false;
        }

        let previous = {
            let mut state = self.state.lock();
            if state.in_flight.contains(&record.storage_path) {
                debug!(file = %record.file_name, "Already downloading");
                return false;
            }
            let previous = state.index.get(&record.file_name).cloned();
            if previous.as_ref().map_or(false, CacheEntry::is_downloading) {
                debug!(file = %record.file_name, "Name busy with another download");
                return false;
            }
            state.in_flight.insert(record.storage_path.clone());
            state.index.insert(CacheEntry::downloading(&record));
            previous
        };

        debug!(file = %record.file_name, storage_path = %record.storage_path, "Download scheduled");

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(record, previous, observer).await });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        true
    }

    /// Wait until every scheduled download has settled
    pub async fn wait_idle(&self) {
        loop {
            let handles = std::mem::take(&mut *self.tasks.lock().unwrap());
            if handles.is_empty() {
                return;
            }
            for joined in futures::future::join_all(handles).await {
                if let Err(e) = joined {
                    warn!(error = %e, "Download task aborted");
                }
            }
        }
    }

    async fn run(
        &self,
        record: FileRecord,
        previous: Option<CacheEntry>,
        observer: Arc<dyn DownloadObserver>,
    ) {
        let result = match self.fetch(&record, observer.as_ref()).await {
            Ok(staged) => self.install(&record, staged),
            Err(e) => Err(e),
        };

        match &result {
            Ok(entry) => info!(
                file = %entry.file_name,
                storage_path = %record.storage_path,
                "Download complete"
            ),
            Err(e) => {
                warn!(file = %record.file_name, error = %e, "Download failed");
                self.roll_back(&record, previous);
            }
        }

        observer.on_complete(&record.file_name, result);
    }

    /// Stream the blob into a staged file
    async fn fetch(
        &self,
        record: &FileRecord,
        observer: &dyn DownloadObserver,
    ) -> SyncResult<StagedFile> {
        let _permit = match &self.permits {
            Some(permits) => Some(
                permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| SyncError::Rejected("download pool closed".into()))?,
            ),
            None => None,
        };

        let BlobDownload {
            content_length,
            mut stream,
        } = self
            .blobs
            .download(&record.storage_path, &record.blob_url)
            .await?;

        let mut staged = self.cache.stage()?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            staged.write_all(&chunk)?;

            if let Some(total) = content_length.filter(|total| *total > 0) {
                let progress = (staged.len() as f64 / total as f64).min(1.0);
                self.state.lock().index.set_progress(
                    &record.file_name,
                    &record.storage_path,
                    progress,
                );
                observer.on_progress(&record.file_name, progress);
            }
        }

        if let Some(total) = content_length {
            if staged.len() != total {
                return Err(SyncError::TransientNetwork(format!(
                    "short read for {}: {} of {} bytes",
                    record.storage_path,
                    staged.len(),
                    total
                )));
            }
        }
        staged.finish()?;
        Ok(staged)
    }

    /// Move complete content into place and mark the entry present
    fn install(&self, record: &FileRecord, staged: StagedFile) -> SyncResult<CacheEntry> {
        let _disk = self.state.lock_disk();

        if !self.owns_slot(record) {
            return Err(SyncError::NotFound(format!(
                "download of '{}' was superseded",
                record.file_name
            )));
        }

        let local_path = self.cache.install(&record.file_name, staged)?;
        let entry = CacheEntry::present(record, local_path);

        let mut state = self.state.lock();
        state.index.insert(entry.clone());
        state.in_flight.remove(&record.storage_path);
        Ok(entry)
    }

    /// Release the in-flight slot and put back whatever the name held before
    fn roll_back(&self, record: &FileRecord, previous: Option<CacheEntry>) {
        let mut state = self.state.lock();
        state.in_flight.remove(&record.storage_path);

        let still_ours = state.index.get(&record.file_name).map_or(false, |e| {
            e.is_downloading() && e.remote.storage_path == record.storage_path
        });
        if !still_ours {
            return;
        }
        match previous {
            Some(previous) => state.index.insert(previous),
            None => state.index.insert(CacheEntry::absent(record)),
        };
    }

    fn owns_slot(&self, record: &FileRecord) -> bool {
        self.state
            .lock()
            .index
            .get(&record.file_name)
            .map_or(false, |e| {
                e.is_downloading() && e.remote.storage_path == record.storage_path
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DownloadState;
    use crate::remote::InMemoryBlobStore;
    use std::io::Read;
    use std::path::PathBuf;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        progress: Mutex<Vec<(String, f64)>>,
        results: Mutex<Vec<(String, Result<CacheEntry, String>)>>,
    }

    impl DownloadObserver for Recorder {
        fn on_progress(&self, file_name: &str, progress: f64) {
            self.progress
                .lock()
                .unwrap()
                .push((file_name.to_string(), progress));
        }

        fn on_complete(&self, file_name: &str, result: SyncResult<CacheEntry>) {
            self.results
                .lock()
                .unwrap()
                .push((file_name.to_string(), result.map_err(|e| e.to_string())));
        }
    }

    fn record(name: &str, path: &str) -> FileRecord {
        FileRecord {
            id: format!("id-{path}"),
            file_name: name.to_string(),
            blob_url: format!("mem://{path}"),
            storage_path: path.to_string(),
            owner_id: "U1".to_string(),
            authorized_recipients: ["U2".to_string()].into(),
            created_at: 1,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        state: Arc<SyncState>,
        cache: Arc<CacheStore>,
        blobs: Arc<InMemoryBlobStore>,
        manager: DownloadManager,
    }

    fn fixture(chunk_size: usize, max_concurrent: Option<usize>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(SyncState::new());
        let cache = Arc::new(CacheStore::with_root(dir.path().to_path_buf()).unwrap());
        let blobs = Arc::new(InMemoryBlobStore::with_chunk_size(chunk_size));
        let manager = DownloadManager::new(
            state.clone(),
            cache.clone(),
            blobs.clone(),
            max_concurrent,
        );
        Fixture {
            _dir: dir,
            state,
            cache,
            blobs,
            manager,
        }
    }

    fn read(cache: &CacheStore, name: &str) -> String {
        let mut s = String::new();
        cache.open(name).unwrap().read_to_string(&mut s).unwrap();
        s
    }

    #[tokio::test]
    async fn test_download_installs_and_reports_progress() {
        let fx = fixture(4, None);
        fx.blobs.insert("U1/a/report.pdf", "0123456789abcdef");
        let recorder = Arc::new(Recorder::default());

        assert!(fx
            .manager
            .schedule(record("report.pdf", "U1/a/report.pdf"), recorder.clone()));
        fx.manager.wait_idle().await;

        assert_eq!(read(&fx.cache, "report.pdf"), "0123456789abcdef");
        let entry = fx.state.lock().index.get("report.pdf").cloned().unwrap();
        assert_eq!(entry.state, DownloadState::Present);
        assert!(fx.state.in_flight().is_empty());

        let progress = recorder.progress.lock().unwrap();
        assert_eq!(progress.len(), 4);
        assert_eq!(progress.last().unwrap().1, 1.0);
        assert!(recorder.results.lock().unwrap()[0].1.is_ok());
    }

    #[tokio::test]
    async fn test_second_schedule_of_in_flight_blob_is_noop() {
        let fx = fixture(1024, None);
        fx.blobs.insert("p/a", "payload");
        fx.blobs.hold_downloads();
        let recorder = Arc::new(Recorder::default());

        assert!(fx.manager.schedule(record("a.txt", "p/a"), recorder.clone()));
        assert!(!fx.manager.schedule(record("a.txt", "p/a"), recorder.clone()));

        fx.blobs.release_downloads();
        fx.manager.wait_idle().await;

        assert_eq!(fx.blobs.download_calls(), 1);
        assert_eq!(recorder.results.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broken_stream_keeps_previous_content() {
        let fx = fixture(2, None);
        let old = record("notes.txt", "p/old");
        let mut staged = fx.cache.stage().unwrap();
        staged.write_all(b"old notes").unwrap();
        let path = fx.cache.install("notes.txt", staged).unwrap();
        fx.state.lock().index.insert(CacheEntry::present(&old, path));

        fx.blobs.insert("p/new", "new notes, longer");
        fx.blobs.break_download("p/new", 6);
        let recorder = Arc::new(Recorder::default());

        assert!(fx.manager.schedule(record("notes.txt", "p/new"), recorder.clone()));
        fx.manager.wait_idle().await;

        assert_eq!(read(&fx.cache, "notes.txt"), "old notes");
        let entry = fx.state.lock().index.get("notes.txt").cloned().unwrap();
        assert_eq!(entry.remote.storage_path, "p/old");
        assert!(entry.is_present());
        assert!(fx.state.in_flight().is_empty());
        assert!(recorder.results.lock().unwrap()[0].1.is_err());

        // No partial temp files left behind
        let files: Vec<PathBuf> = std::fs::read_dir(fx.cache.cache_dir())
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_blob_leaves_entry_absent() {
        let fx = fixture(1024, None);
        let recorder = Arc::new(Recorder::default());

        assert!(fx.manager.schedule(record("gone.txt", "p/gone"), recorder.clone()));
        fx.manager.wait_idle().await;

        let entry = fx.state.lock().index.get("gone.txt").cloned().unwrap();
        assert_eq!(entry.state, DownloadState::Absent);
        assert!(entry.local_path.is_none());
        assert!(!fx.cache.exists("gone.txt").unwrap());
        assert!(fx.state.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_pool_limit_bounds_active_fetches() {
        let fx = fixture(1024, Some(1));
        fx.blobs.insert("p/a", "a");
        fx.blobs.insert("p/b", "b");
        fx.blobs.hold_downloads();
        let recorder = Arc::new(Recorder::default());

        assert!(fx.manager.schedule(record("a.txt", "p/a"), recorder.clone()));
        assert!(fx.manager.schedule(record("b.txt", "p/b"), recorder.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.blobs.download_calls(), 1);

        fx.blobs.release_downloads();
        fx.manager.wait_idle().await;
        assert_eq!(fx.blobs.download_calls(), 2);
        assert_eq!(read(&fx.cache, "a.txt"), "a");
        assert_eq!(read(&fx.cache, "b.txt"), "b");
    }

    #[tokio::test]
    async fn test_unsafe_name_is_never_scheduled() {
        let fx = fixture(1024, None);
        let recorder = Arc::new(Recorder::default());

        assert!(!fx.manager.schedule(record("../secret", "p/x"), recorder));
        assert!(fx.state.in_flight().is_empty());
        assert!(fx.state.lock().index.is_empty());
    }
}
