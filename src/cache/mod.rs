//! Local cache layer
//!
//! `file_cache` owns the bytes on disk, `index` tracks what the engine
//! believes each cached name corresponds to remotely.

pub mod file_cache;
pub mod index;

pub use file_cache::{CacheStore, StagedFile};
pub use index::{CacheEntry, CacheIndex, DownloadState, RemoteIdentity};
