//! HTTP Metadata Client
//!
//! JSON adapter for a document service exposing the record collection:
//!
//! - `GET    /records?ownerId={id}`            one-shot owner listing
//! - `GET    /records?recipient={id}`          records shared with a recipient
//! - `POST   /records`                          create, returns the stored record
//! - `PATCH  /records/{id}`                     `{"fileName": ...}`
//! - `DELETE /records/{id}`
//! - `PUT    /records/{id}/recipients/{rid}`    set union on the server
//! - `DELETE /records/{id}/recipients/{rid}`    set difference on the server
//!
//! The service has no push channel, so subscriptions poll and deliver the
//! full result set on every tick.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{FileRecord, MetadataClient, NewRecord, SnapshotCallback, Subscription};
use crate::error::{SyncError, SyncResult};

/// HTTP client timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RenameRequest<'a> {
    file_name: &'a str,
}

/// Map a non-success HTTP status to the sync error taxonomy
fn status_error(status: u16, body: &str) -> SyncError {
    match status {
        404 => SyncError::NotFound(body.to_string()),
        409 => SyncError::Conflict(body.to_string()),
        408 | 429 | 500..=599 => SyncError::TransientNetwork(format!("HTTP {}: {}", status, body)),
        _ => SyncError::Rejected(format!("HTTP {}: {}", status, body)),
    }
}

/// Metadata client for the records service
#[derive(Clone)]
pub struct HttpMetadataClient {
    http_client: Client,
    base_url: String,
    poll_interval: Duration,
}

impl HttpMetadataClient {
    /// Create a client for the service at `base_url`
    pub fn new(base_url: &str, poll_interval: Duration) -> SyncResult<Self> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Rejected(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval,
        })
    }

    fn record_url(&self, id: &str) -> String {
        format!("{}/records/{}", self.base_url, urlencoding::encode(id))
    }

    fn recipient_url(&self, id: &str, recipient_id: &str) -> String {
        format!(
            "{}/recipients/{}",
            self.record_url(id),
            urlencoding::encode(recipient_id)
        )
    }

    /// Turn a non-success response into an error
    async fn check(response: Response) -> SyncResult<Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }

    async fn query(&self, key: &str, value: &str) -> SyncResult<Vec<FileRecord>> {
        let response = self
            .http_client
            .get(format!("{}/records", self.base_url))
            .query(&[(key, value)])
            .send()
            .await?;

        let records: Vec<FileRecord> = Self::check(response).await?.json().await?;
        debug!(key = key, value = value, count = records.len(), "Queried records");
        Ok(records)
    }
}

#[async_trait]
impl MetadataClient for HttpMetadataClient {
    async fn list_owned(&self, owner_id: &str) -> SyncResult<Vec<FileRecord>> {
        self.query("ownerId", owner_id).await
    }

    async fn subscribe(
        &self,
        recipient_id: &str,
        on_change: SnapshotCallback,
    ) -> SyncResult<Subscription> {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let client = self.clone();
        let recipient_id = recipient_id.to_string();

        info!(recipient = %recipient_id, interval_ms = self.poll_interval.as_millis() as u64, "Polling subscription started");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        match client.query("recipient", &recipient_id).await {
                            Ok(records) if !task_token.is_cancelled() => on_change(records),
                            Ok(_) => break,
                            Err(e) => {
                                warn!(recipient = %recipient_id, error = %e, "Subscription poll failed");
                            }
                        }
                    }
                }
            }
            debug!(recipient = %recipient_id, "Polling subscription stopped");
        });

        Ok(Subscription::new(token))
    }

    async fn create(&self, record: NewRecord) -> SyncResult<FileRecord> {
        let response = self
            .http_client
            .post(format!("{}/records", self.base_url))
            .json(&record)
            .send()
            .await?;

        let created: FileRecord = Self::check(response).await?.json().await?;
        info!(id = %created.id, name = %created.file_name, "Record created");
        Ok(created)
    }

    async fn rename(&self, id: &str, new_name: &str) -> SyncResult<()> {
        let response = self
            .http_client
            .patch(self.record_url(id))
            .json(&RenameRequest { file_name: new_name })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> SyncResult<()> {
        let response = self.http_client.delete(self.record_url(id)).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn grant_access(&self, id: &str, recipient_id: &str) -> SyncResult<()> {
        let response = self
            .http_client
            .put(self.recipient_url(id, recipient_id))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn revoke_access(&self, id: &str, recipient_id: &str) -> SyncResult<()> {
        let response = self
            .http_client
            .delete(self.recipient_url(id, recipient_id))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
