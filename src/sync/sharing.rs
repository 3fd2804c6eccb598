//! Sharing Mutator
//!
//! Grants and revokes are single-recipient set operations on the store, so
//! concurrent changes from different callers compose instead of overwriting
//! each other.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::SyncResult;
use crate::remote::MetadataClient;

/// Result of a sharing change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied,
    /// The record no longer exists; nothing to change
    RecordGone,
}

pub struct SharingMutator {
    metadata: Arc<dyn MetadataClient>,
}

impl SharingMutator {
    pub fn new(metadata: Arc<dyn MetadataClient>) -> Self {
        Self { metadata }
    }

    pub async fn grant(&self, record_id: &str, recipient_id: &str) -> SyncResult<MutationOutcome> {
        let result = self.metadata.grant_access(record_id, recipient_id).await;
        Self::outcome("grant", record_id, recipient_id, result)
    }

    pub async fn revoke(&self, record_id: &str, recipient_id: &str) -> SyncResult<MutationOutcome> {
        let result = self.metadata.revoke_access(record_id, recipient_id).await;
        Self::outcome("revoke", record_id, recipient_id, result)
    }

    fn outcome(
        action: &str,
        record_id: &str,
        recipient_id: &str,
        result: SyncResult<()>,
    ) -> SyncResult<MutationOutcome> {
        match result {
            Ok(()) => {
                info!(action = action, id = record_id, recipient = recipient_id, "Sharing updated");
                Ok(MutationOutcome::Applied)
            }
            Err(e) if e.is_not_found() => {
                warn!(action = action, id = record_id, "Record vanished before sharing change");
                Ok(MutationOutcome::RecordGone)
            }
            Err(e) => Err(e),
        }
    }
}
