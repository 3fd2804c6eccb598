//! Upload / Publish Pipeline
//!
//! One async pipeline per published file:
//! `Staged -> BlobUploaded -> MetadataWritten -> Cached`.
//! Every failure leaves through the returned `SyncError`; a blob that made it
//! to the store without a metadata record comes back as `Inconsistent` so the
//! caller can retry only the record write.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::state::SyncState;
use crate::cache::{CacheEntry, CacheStore, StagedFile};
use crate::error::{SyncError, SyncResult};
use crate::remote::{BlobStore, FileRecord, MetadataClient, NewRecord, OrphanedUpload, UploadedBlob};

/// Backoff delays between upload attempts (milliseconds)
const BACKOFF_MS: [u64; 3] = [500, 1000, 2000];

/// Upload attempts before giving up
const MAX_ATTEMPTS: u32 = 3;

/// Bounded retry for blob uploads; only transient failures are retried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            backoff: BACKOFF_MS.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        }
    }
}

impl RetryPolicy {
    /// Retry without sleeping in between
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Vec::new(),
        }
    }

    fn delay(&self, attempt: usize) -> Duration {
        self.backoff
            .get(attempt)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or_default()
    }
}

/// Where a publish currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStage {
    Staged,
    BlobUploaded,
    MetadataWritten,
    Cached,
}

/// Bookkeeping for one publish; lives only as long as the call
#[derive(Debug)]
pub struct PendingUpload {
    pub local_source_path: PathBuf,
    pub file_name: String,
    pub retries_remaining: u32,
}

/// Read access to a user-supplied file, released when dropped
struct SourceAccess {
    path: PathBuf,
    file: File,
}

impl SourceAccess {
    fn open(path: &Path) -> SyncResult<Self> {
        let file = File::open(path)?;
        trace!(path = %path.display(), "Source access acquired");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn read_all(mut self) -> SyncResult<Vec<u8>> {
        let mut data = Vec::new();
        self.file.read_to_end(&mut data)?;
        Ok(data)
    }
}

impl Drop for SourceAccess {
    fn drop(&mut self) {
        trace!(path = %self.path.display(), "Source access released");
    }
}

/// Holds a file name for the duration of one publish
struct NameReservation<'a> {
    names: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        self.names.lock().unwrap().remove(&self.name);
    }
}

/// Content type from the file extension
pub fn content_type_for(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "pdf" => "application/pdf",
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

pub struct Publisher {
    metadata: Arc<dyn MetadataClient>,
    blobs: Arc<dyn BlobStore>,
    cache: Arc<CacheStore>,
    state: Arc<SyncState>,
    retry: RetryPolicy,
    publishing: Mutex<HashSet<String>>,
}

impl Publisher {
    pub fn new(
        metadata: Arc<dyn MetadataClient>,
        blobs: Arc<dyn BlobStore>,
        cache: Arc<CacheStore>,
        state: Arc<SyncState>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            metadata,
            blobs,
            cache,
            state,
            retry,
            publishing: Mutex::new(HashSet::new()),
        }
    }

    /// Publish a local file as `file_name` owned by `owner_id`
    pub async fn publish(
        &self,
        owner_id: &str,
        source: &Path,
        file_name: &str,
    ) -> SyncResult<FileRecord> {
        CacheStore::validate_name(file_name)?;
        let _reservation = self.reserve(file_name)?;

        if self.state.lock().index.get(file_name).is_some() {
            return Err(SyncError::Conflict(file_name.to_string()));
        }
        let owned = self.metadata.list_owned(owner_id).await?;
        if owned.iter().any(|r| r.file_name == file_name) {
            return Err(SyncError::Conflict(file_name.to_string()));
        }

        let mut pending = PendingUpload {
            local_source_path: source.to_path_buf(),
            file_name: file_name.to_string(),
            retries_remaining: self.retry.max_attempts.saturating_sub(1),
        };

        let data = SourceAccess::open(&pending.local_source_path)?.read_all()?;
        let mut staged = self.cache.stage()?;
        staged.write_all(&data)?;
        staged.finish()?;
        log_stage(file_name, PublishStage::Staged);

        let storage_path = format!("{}/{}/{}", owner_id, Uuid::new_v4(), file_name);
        let uploaded = self
            .upload_with_retry(&mut pending, &storage_path, Bytes::from(data), owner_id)
            .await?;
        log_stage(file_name, PublishStage::BlobUploaded);

        let new_record = NewRecord {
            file_name: file_name.to_string(),
            blob_url: uploaded.blob_url,
            storage_path: uploaded.storage_path,
            owner_id: owner_id.to_string(),
            authorized_recipients: Default::default(),
        };
        self.write_record(new_record, Some(staged)).await
    }

    /// Write the metadata record for a blob that is already uploaded
    pub async fn retry_metadata(&self, orphan: OrphanedUpload) -> SyncResult<FileRecord> {
        let OrphanedUpload {
            record,
            storage_path,
            staged,
        } = orphan;
        debug!(storage_path = %storage_path, "Retrying metadata write");
        let _reservation = self.reserve(&record.file_name)?;
        self.write_record(record, staged).await
    }

    fn reserve(&self, file_name: &str) -> SyncResult<NameReservation<'_>> {
        if !self.publishing.lock().unwrap().insert(file_name.to_string()) {
            return Err(SyncError::Conflict(file_name.to_string()));
        }
        Ok(NameReservation {
            names: &self.publishing,
            name: file_name.to_string(),
        })
    }

    async fn upload_with_retry(
        &self,
        pending: &mut PendingUpload,
        storage_path: &str,
        data: Bytes,
        owner_id: &str,
    ) -> SyncResult<UploadedBlob> {
        let content_type = content_type_for(&pending.file_name);
        let mut attempt = 0;
        loop {
            match self
                .blobs
                .upload(storage_path, data.clone(), content_type, owner_id)
                .await
            {
                Ok(uploaded) => return Ok(uploaded),
                Err(e) if !e.is_retryable() || pending.retries_remaining == 0 => {
                    warn!(
                        file = %pending.file_name,
                        attempts = attempt + 1,
                        error = %e,
                        "Upload failed"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        file = %pending.file_name,
                        attempt = attempt + 1,
                        max = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying upload"
                    );
                    tokio::time::sleep(delay).await;
                    pending.retries_remaining -= 1;
                    attempt += 1;
                }
            }
        }
    }

    /// Steps from the record write onward
    async fn write_record(
        &self,
        record: NewRecord,
        staged: Option<StagedFile>,
    ) -> SyncResult<FileRecord> {
        let storage_path = record.storage_path.clone();

        // Our own blob is not a download candidate for a concurrent owner refresh
        self.state.lock().in_flight.insert(storage_path.clone());

        let created = match self.metadata.create(record.clone()).await {
            Ok(created) => created,
            Err(e) => {
                self.state.lock().in_flight.remove(&storage_path);
                warn!(
                    file = %record.file_name,
                    storage_path = %storage_path,
                    error = %e,
                    "Metadata write failed after upload"
                );
                return Err(SyncError::Inconsistent {
                    reason: e.to_string(),
                    orphan: Box::new(OrphanedUpload {
                        record,
                        storage_path,
                        staged,
                    }),
                });
            }
        };
        log_stage(&created.file_name, PublishStage::MetadataWritten);

        match staged {
            Some(staged) => self.install(&created, staged),
            None => self.state.lock().in_flight.remove(&storage_path),
        };

        info!(
            file = %created.file_name,
            id = %created.id,
            storage_path = %created.storage_path,
            "Published file"
        );
        Ok(created)
    }

    /// Materialize the upload as a present entry.
    ///
    /// A failed install is not fatal: the record exists, so the next owner
    /// refresh fetches the blob instead.
    fn install(&self, record: &FileRecord, staged: StagedFile) -> bool {
        let _disk = self.state.lock_disk();
        let installed = self.cache.install(&record.file_name, staged);

        let mut state = self.state.lock();
        state.in_flight.remove(&record.storage_path);
        match installed {
            Ok(local_path) => {
                state.index.insert(CacheEntry::present(record, local_path));
                drop(state);
                log_stage(&record.file_name, PublishStage::Cached);
                true
            }
            Err(e) => {
                warn!(file = %record.file_name, error = %e, "Could not cache published file");
                false
            }
        }
    }
}

fn log_stage(file_name: &str, stage: PublishStage) {
    debug!(file = file_name, stage = ?stage, "Publish stage reached");
}
