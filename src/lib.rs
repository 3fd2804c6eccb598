//! sharecache - local file cache synchronization for shared documents
//!
//! Keeps a per-user on-disk cache of shared files consistent with an
//! authoritative remote metadata feed, downloads and uploads blobs, and
//! reconciles repeated full-snapshot change notifications.

pub mod b2;
pub mod cache;
pub mod config;
pub mod error;
pub mod remote;
pub mod sync;

pub use cache::{CacheEntry, CacheIndex, CacheStore, DownloadState, RemoteIdentity};
pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use remote::{BlobStore, FileRecord, MetadataClient, NewRecord, Subscription};
pub use sync::{EngineOptions, ReconcileMode, ReconcilePlan, Reconciler, SyncEngine, SyncEvent};
