//! In-process metadata and blob stores
//!
//! Authoritative fakes for tests and local experiments. Both support fault
//! injection so failure paths can be exercised deterministically.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
    BlobDownload, BlobStore, FileRecord, MetadataClient, NewRecord, SnapshotCallback,
    Subscription, UploadedBlob,
};
use crate::error::{SyncError, SyncResult};

struct Subscriber {
    recipient_id: String,
    token: CancellationToken,
    callback: SnapshotCallback,
}

#[derive(Default)]
struct MetadataState {
    records: BTreeMap<String, FileRecord>,
    next_id: u64,
    clock: u64,
    subscribers: Vec<Subscriber>,
    fail_creates: usize,
    fail_lists: usize,
}

impl MetadataState {
    fn shared_with(&self, recipient_id: &str) -> Vec<FileRecord> {
        self.records
            .values()
            .filter(|r| r.authorized_recipients.contains(recipient_id))
            .cloned()
            .collect()
    }
}

/// Metadata store held in memory.
///
/// Every mutation notifies every live subscription with its full current
/// set, whether or not the mutation touched that recipient.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    state: Mutex<MetadataState>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` `create` calls fail with a transient error
    pub fn fail_next_creates(&self, n: usize) {
        self.state.lock().unwrap().fail_creates = n;
    }

    /// Make the next `n` `list_owned` calls fail with a transient error
    pub fn fail_next_lists(&self, n: usize) {
        self.state.lock().unwrap().fail_lists = n;
    }

    /// Current content of the store
    pub fn records(&self) -> Vec<FileRecord> {
        self.state.lock().unwrap().records.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<FileRecord> {
        self.state.lock().unwrap().records.get(id).cloned()
    }

    /// Number of subscriptions that are still delivering
    pub fn live_subscriptions(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.subscribers.retain(|s| !s.token.is_cancelled());
        state.subscribers.len()
    }

    /// Apply a mutation, then deliver snapshots outside the lock
    fn mutate<T>(&self, f: impl FnOnce(&mut MetadataState) -> SyncResult<T>) -> SyncResult<T> {
        let (result, deliveries) = {
            let mut state = self.state.lock().unwrap();
            let result = f(&mut *state)?;
            state.subscribers.retain(|s| !s.token.is_cancelled());
            let deliveries: Vec<_> = state
                .subscribers
                .iter()
                .map(|s| {
                    (
                        s.token.clone(),
                        s.callback.clone(),
                        state.shared_with(&s.recipient_id),
                    )
                })
                .collect();
            (result, deliveries)
        };

        for (token, callback, records) in deliveries {
            if !token.is_cancelled() {
                callback(records);
            }
        }
        Ok(result)
    }

    fn record_mut<'a>(state: &'a mut MetadataState, id: &str) -> SyncResult<&'a mut FileRecord> {
        state
            .records
            .get_mut(id)
            .ok_or_else(|| SyncError::NotFound(format!("record {id}")))
    }
}

#[async_trait]
impl MetadataClient for InMemoryMetadataStore {
    async fn list_owned(&self, owner_id: &str) -> SyncResult<Vec<FileRecord>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_lists > 0 {
            state.fail_lists -= 1;
            return Err(SyncError::TransientNetwork("injected list failure".into()));
        }
        Ok(state
            .records
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn subscribe(
        &self,
        recipient_id: &str,
        on_change: SnapshotCallback,
    ) -> SyncResult<Subscription> {
        let token = CancellationToken::new();
        let initial = {
            let mut state = self.state.lock().unwrap();
            state.subscribers.push(Subscriber {
                recipient_id: recipient_id.to_string(),
                token: token.clone(),
                callback: on_change.clone(),
            });
            state.shared_with(recipient_id)
        };
        debug!(recipient = recipient_id, "Subscription registered");

        // Live feeds start with the current state
        on_change(initial);
        Ok(Subscription::new(token))
    }

    async fn create(&self, record: NewRecord) -> SyncResult<FileRecord> {
        self.mutate(|state| {
            if state.fail_creates > 0 {
                state.fail_creates -= 1;
                return Err(SyncError::TransientNetwork("injected create failure".into()));
            }
            state.next_id += 1;
            state.clock += 1;
            let created = FileRecord {
                id: format!("rec-{}", state.next_id),
                file_name: record.file_name,
                blob_url: record.blob_url,
                storage_path: record.storage_path,
                owner_id: record.owner_id,
                authorized_recipients: record.authorized_recipients,
                created_at: state.clock,
            };
            state.records.insert(created.id.clone(), created.clone());
            trace!(id = %created.id, name = %created.file_name, "Record created");
            Ok(created)
        })
    }

    async fn rename(&self, id: &str, new_name: &str) -> SyncResult<()> {
        self.mutate(|state| {
            Self::record_mut(state, id)?.file_name = new_name.to_string();
            Ok(())
        })
    }

    async fn delete(&self, id: &str) -> SyncResult<()> {
        self.mutate(|state| {
            state
                .records
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| SyncError::NotFound(format!("record {id}")))
        })
    }

    async fn grant_access(&self, id: &str, recipient_id: &str) -> SyncResult<()> {
        self.mutate(|state| {
            Self::record_mut(state, id)?
                .authorized_recipients
                .insert(recipient_id.to_string());
            Ok(())
        })
    }

    async fn revoke_access(&self, id: &str, recipient_id: &str) -> SyncResult<()> {
        self.mutate(|state| {
            Self::record_mut(state, id)?
                .authorized_recipients
                .remove(recipient_id);
            Ok(())
        })
    }
}

struct StoredBlob {
    data: Bytes,
    content_type: String,
    owner_tag: String,
}

/// Blob store held in memory
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, StoredBlob>>,
    /// Errors returned by the next uploads, in order
    upload_failures: Mutex<VecDeque<SyncError>>,
    /// storage path -> bytes delivered before the stream breaks
    broken_downloads: Mutex<HashMap<String, usize>>,
    chunk_size: usize,
    gate: watch::Sender<bool>,
    upload_attempts: AtomicUsize,
    download_calls: AtomicUsize,
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::with_chunk_size(64 * 1024)
    }

    /// Downloads are streamed in chunks of this size
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            blobs: Mutex::new(HashMap::new()),
            upload_failures: Mutex::new(VecDeque::new()),
            broken_downloads: Mutex::new(HashMap::new()),
            chunk_size: chunk_size.max(1),
            gate,
            upload_attempts: AtomicUsize::new(0),
            download_calls: AtomicUsize::new(0),
        }
    }

    /// Store a blob directly, bypassing upload accounting
    pub fn insert(&self, storage_path: &str, data: impl Into<Bytes>) {
        self.blobs.lock().unwrap().insert(
            storage_path.to_string(),
            StoredBlob {
                data: data.into(),
                content_type: "application/octet-stream".to_string(),
                owner_tag: String::new(),
            },
        );
    }

    pub fn contains(&self, storage_path: &str) -> bool {
        self.blobs.lock().unwrap().contains_key(storage_path)
    }

    pub fn owner_tag(&self, storage_path: &str) -> Option<String> {
        self.blobs
            .lock()
            .unwrap()
            .get(storage_path)
            .map(|b| b.owner_tag.clone())
    }

    pub fn content_type(&self, storage_path: &str) -> Option<String> {
        self.blobs
            .lock()
            .unwrap()
            .get(storage_path)
            .map(|b| b.content_type.clone())
    }

    /// Queue errors for the next uploads
    pub fn fail_uploads(&self, errors: impl IntoIterator<Item = SyncError>) {
        self.upload_failures.lock().unwrap().extend(errors);
    }

    /// Break the next download of `storage_path` after `after_bytes` bytes
    pub fn break_download(&self, storage_path: &str, after_bytes: usize) {
        self.broken_downloads
            .lock()
            .unwrap()
            .insert(storage_path.to_string(), after_bytes);
    }

    /// Hold every download stream until [`release_downloads`](Self::release_downloads)
    pub fn hold_downloads(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_downloads(&self) {
        self.gate.send_replace(true);
    }

    pub fn upload_attempts(&self) -> usize {
        self.upload_attempts.load(Ordering::SeqCst)
    }

    /// Number of network fetches started
    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(
        &self,
        storage_path: &str,
        data: Bytes,
        content_type: &str,
        owner_tag: &str,
    ) -> SyncResult<UploadedBlob> {
        self.upload_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.upload_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let size = data.len() as u64;
        self.blobs.lock().unwrap().insert(
            storage_path.to_string(),
            StoredBlob {
                data,
                content_type: content_type.to_string(),
                owner_tag: owner_tag.to_string(),
            },
        );
        Ok(UploadedBlob {
            storage_path: storage_path.to_string(),
            blob_url: format!("mem://{storage_path}"),
            size,
        })
    }

    async fn download(&self, storage_path: &str, _blob_url: &str) -> SyncResult<BlobDownload> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);

        let data = self
            .blobs
            .lock()
            .unwrap()
            .get(storage_path)
            .map(|b| b.data.clone())
            .ok_or_else(|| SyncError::NotFound(format!("blob {storage_path}")))?;
        let break_after = self.broken_downloads.lock().unwrap().remove(storage_path);

        let mut chunks: Vec<SyncResult<Bytes>> = Vec::new();
        let limit = break_after.unwrap_or(data.len()).min(data.len());
        let mut offset = 0;
        while offset < limit {
            let end = (offset + self.chunk_size).min(limit);
            chunks.push(Ok(data.slice(offset..end)));
            offset = end;
        }
        if break_after.is_some() {
            chunks.push(Err(SyncError::TransientNetwork(
                "connection reset mid-download".into(),
            )));
        }

        let mut gate = self.gate.subscribe();
        let stream = futures::stream::once(async move {
            let _ = gate.wait_for(|open| *open).await;
        })
        .map(move |()| futures::stream::iter(std::mem::take(&mut chunks)))
        .flatten();

        Ok(BlobDownload {
            content_length: Some(data.len() as u64),
            stream: Box::pin(stream),
        })
    }

    async fn delete(&self, storage_path: &str) -> SyncResult<()> {
        self.blobs
            .lock()
            .unwrap()
            .remove(storage_path)
            .map(|_| ())
            .ok_or_else(|| SyncError::NotFound(format!("blob {storage_path}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_record(name: &str) -> NewRecord {
        NewRecord {
            file_name: name.to_string(),
            blob_url: format!("mem://U1/{name}"),
            storage_path: format!("U1/{name}"),
            owner_id: "U1".to_string(),
            authorized_recipients: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_subscription_receives_full_set_on_every_change() {
        let store = InMemoryMetadataStore::new();
        let seen: Arc<Mutex<Vec<usize>>> = Arc::default();
        let sink = seen.clone();

        let sub = store
            .subscribe("U2", Arc::new(move |records| sink.lock().unwrap().push(records.len())))
            .await
            .unwrap();

        let a = store.create(new_record("a.txt")).await.unwrap();
        store.grant_access(&a.id, "U2").await.unwrap();
        // Irrelevant change still delivers the (unchanged) full set
        store.create(new_record("b.txt")).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![0, 0, 1, 1]);

        sub.cancel();
        store.create(new_record("c.txt")).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 4);
        assert_eq!(store.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_grants_both_survive() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let rec = store.create(new_record("a.txt")).await.unwrap();

        let (s1, s2) = (store.clone(), store.clone());
        let (id1, id2) = (rec.id.clone(), rec.id.clone());
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { s1.grant_access(&id1, "U2").await }),
            tokio::spawn(async move { s2.grant_access(&id2, "U3").await }),
        );
        r1.unwrap().unwrap();
        r2.unwrap().unwrap();

        let recipients = store.get(&rec.id).unwrap().authorized_recipients;
        assert!(recipients.contains("U2") && recipients.contains("U3"));
    }

    #[tokio::test]
    async fn test_mutating_missing_record_is_not_found() {
        let store = InMemoryMetadataStore::new();
        assert!(store.delete("nope").await.unwrap_err().is_not_found());
        assert!(store.grant_access("nope", "U2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_broken_download_yields_partial_then_error() {
        let blobs = InMemoryBlobStore::with_chunk_size(2);
        blobs.insert("p", &b"abcdef"[..]);
        blobs.break_download("p", 3);

        let download = blobs.download("p", "mem://p").await.unwrap();
        let items: Vec<_> = download.stream.collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok() && items[1].is_ok());
        assert!(items[2].as_ref().unwrap_err().is_retryable());

        // Only the next download breaks
        let again: Vec<_> = blobs.download("p", "mem://p").await.unwrap().stream.collect().await;
        assert!(again.iter().all(|c| c.is_ok()));
        assert_eq!(blobs.download_calls(), 2);
    }
}
