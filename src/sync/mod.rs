//! Synchronization
//!
//! Reconciliation, downloads, publishing and sharing, tied together by
//! [`SyncEngine`].

pub mod download;
pub mod engine;
pub mod publish;
pub mod reconcile;
pub mod sharing;
mod state;

pub use download::{DownloadManager, DownloadObserver};
pub use engine::{EngineOptions, SyncEngine, SyncEvent};
pub use publish::{PendingUpload, PublishStage, Publisher, RetryPolicy};
pub use reconcile::{ReconcileMode, ReconcilePlan, Reconciler, Rename};
pub use sharing::{MutationOutcome, SharingMutator};
pub use state::SyncState;
