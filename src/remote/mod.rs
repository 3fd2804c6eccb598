//! Remote collaborators
//!
//! The metadata store (authoritative `FileRecord`s) and the blob store
//! (file content addressed by storage path) are reached only through the
//! traits in this module, so the engine can run against fakes in tests.

pub mod http;
pub mod memory;

use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cache::StagedFile;
use crate::error::SyncResult;

pub use http::HttpMetadataClient;
pub use memory::{InMemoryBlobStore, InMemoryMetadataStore};

/// Authoritative metadata for a shared file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Issued by the metadata store
    pub id: String,
    /// Display name and cache key (not unique across owners)
    pub file_name: String,
    /// Resolvable download locator
    pub blob_url: String,
    /// Blob store key; unique per blob
    pub storage_path: String,
    pub owner_id: String,
    #[serde(default)]
    pub authorized_recipients: BTreeSet<String>,
    /// Milliseconds since epoch (or a store-issued logical clock)
    pub created_at: u64,
}

/// A record before the store has issued its id and timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRecord {
    pub file_name: String,
    pub blob_url: String,
    pub storage_path: String,
    pub owner_id: String,
    #[serde(default)]
    pub authorized_recipients: BTreeSet<String>,
}

/// A blob that was uploaded but whose metadata record was never written
#[derive(Debug)]
pub struct OrphanedUpload {
    pub record: NewRecord,
    pub storage_path: String,
    /// Local copy of the uploaded content, if it is still around
    pub staged: Option<StagedFile>,
}

/// Callback receiving the full current record set on every change
pub type SnapshotCallback = Arc<dyn Fn(Vec<FileRecord>) + Send + Sync>;

/// Handle for a live subscription. Cancelling (or dropping) it stops delivery.
#[derive(Debug)]
pub struct Subscription {
    token: CancellationToken,
}

impl Subscription {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// The remote record collection
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// One-shot listing of the records an owner created
    async fn list_owned(&self, owner_id: &str) -> SyncResult<Vec<FileRecord>>;

    /// Live feed of the records shared with a recipient.
    ///
    /// `on_change` always receives the complete current set, never a delta,
    /// and may be invoked from any thread.
    async fn subscribe(
        &self,
        recipient_id: &str,
        on_change: SnapshotCallback,
    ) -> SyncResult<Subscription>;

    async fn create(&self, record: NewRecord) -> SyncResult<FileRecord>;

    async fn rename(&self, id: &str, new_name: &str) -> SyncResult<()>;

    async fn delete(&self, id: &str) -> SyncResult<()>;

    /// Add one recipient (set union on the store side)
    async fn grant_access(&self, id: &str, recipient_id: &str) -> SyncResult<()>;

    /// Remove one recipient (set difference on the store side)
    async fn revoke_access(&self, id: &str, recipient_id: &str) -> SyncResult<()>;
}

/// A boxed stream of blob bytes
pub type ByteStream = Pin<Box<dyn Stream<Item = SyncResult<Bytes>> + Send>>;

/// An opened blob download
pub struct BlobDownload {
    /// Total size, when the store reports it
    pub content_length: Option<u64>,
    pub stream: ByteStream,
}

/// Result of a successful blob upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedBlob {
    pub storage_path: String,
    pub blob_url: String,
    pub size: u64,
}

/// Content storage addressed by storage path
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(
        &self,
        storage_path: &str,
        data: Bytes,
        content_type: &str,
        owner_tag: &str,
    ) -> SyncResult<UploadedBlob>;

    async fn download(&self, storage_path: &str, blob_url: &str) -> SyncResult<BlobDownload>;

    async fn delete(&self, storage_path: &str) -> SyncResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_wire_shape() {
        let json = r#"{
            "id": "rec-1",
            "fileName": "report.pdf",
            "blobUrl": "https://f000.example.com/file/bucket/U1/x/report.pdf",
            "storagePath": "U1/x/report.pdf",
            "ownerId": "U1",
            "authorizedRecipients": ["U3", "U2", "U2"],
            "createdAt": 1700000000000
        }"#;
        let record: FileRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.file_name, "report.pdf");
        assert_eq!(record.authorized_recipients.len(), 2);
        assert_eq!(
            record.authorized_recipients.iter().next().map(String::as_str),
            Some("U2")
        );
    }

    #[test]
    fn test_missing_recipients_default_to_empty() {
        let json = r#"{
            "id": "rec-1",
            "fileName": "a.txt",
            "blobUrl": "u",
            "storagePath": "p",
            "ownerId": "U1",
            "createdAt": 5
        }"#;
        let record: FileRecord = serde_json::from_str(json).unwrap();
        assert!(record.authorized_recipients.is_empty());
    }

    #[test]
    fn test_dropping_subscription_cancels_token() {
        let token = CancellationToken::new();
        let sub = Subscription::new(token.clone());
        assert!(!token.is_cancelled());
        drop(sub);
        assert!(token.is_cancelled());
    }
}
