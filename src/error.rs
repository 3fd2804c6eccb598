//! Sync Error Types
//!
//! One taxonomy shared by the cache store, the remote adapters and the engine.
//! Callers branch on the variant: only `TransientNetwork` is worth retrying.

use crate::remote::OrphanedUpload;

/// Errors produced by cache and sync operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Transient network failure: {0}")]
    TransientNetwork(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("A file named '{0}' already exists for this owner")]
    Conflict(String),

    #[error("Invalid file name: {0:?}")]
    InvalidName(String),

    #[error("Blob '{}' was uploaded but its metadata record could not be written: {reason}", .orphan.storage_path)]
    Inconsistent {
        orphan: Box<OrphanedUpload>,
        reason: String,
    },

    #[error("Rejected by remote: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }

    /// Whether the remote object vanished
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            return SyncError::TransientNetwork(e.to_string());
        }
        match e.status().map(|s| s.as_u16()) {
            Some(404) => SyncError::NotFound(e.to_string()),
            Some(408 | 429 | 500..=599) => SyncError::TransientNetwork(e.to_string()),
            _ => SyncError::Rejected(e.to_string()),
        }
    }
}

/// Result alias for sync operations
pub type SyncResult<T> = std::result::Result<T, SyncError>;
