//! Backblaze B2 API Client
//!
//! Blob store backend: uploads, streams and deletes blobs addressed by
//! storage path (the B2 file name) inside one bucket.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{debug, error, info, warn};

use super::errors::B2Error;
use super::types::{FileInfo, ListFilesResponse, UploadUrl};
use crate::error::{SyncError, SyncResult};
use crate::remote::{BlobDownload, BlobStore, UploadedBlob};

/// B2 API base URL for authorization (v3 for nested apiInfo structure)
const B2_AUTH_URL: &str = "https://api.backblazeb2.com/b2api/v3/b2_authorize_account";

/// HTTP client timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of retries for retryable errors
const MAX_RETRIES: u32 = 3;

/// Backoff between retries, in milliseconds
const BACKOFF_MS: [u64; 3] = [500, 1000, 2000];

/// Auth state that can be refreshed (interior mutability)
struct AuthState {
    auth_token: String,
    api_url: String,
    download_url: String,
}

/// B2 API client for making authenticated requests
#[derive(Clone)]
pub struct B2Client {
    /// HTTP client for making requests
    http_client: Client,
    /// B2 account ID
    account_id: String,
    /// Mutable auth state (refreshable on 401)
    auth_state: Arc<RwLock<AuthState>>,
    /// Stored credentials for re-authorization
    key_id: String,
    key: String,
    /// Bucket ID to operate on
    bucket_id: String,
    /// Bucket name (part of download URLs)
    bucket_name: String,
}

/// Response from b2_authorize_account API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeAccountResponse {
    account_id: String,
    authorization_token: String,
    api_info: ApiInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiInfo {
    storage_api: StorageApiInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageApiInfo {
    api_url: String,
    download_url: String,
}

/// Response from b2_list_buckets API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListBucketsResponse {
    buckets: Vec<BucketInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketInfo {
    bucket_id: String,
    bucket_name: String,
}

/// Request body for b2_list_file_names API
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListFileNamesRequest {
    bucket_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    prefix: Option<String>,
    max_file_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_file_name: Option<String>,
}

/// Basic auth header for b2_authorize_account
fn basic_auth(key_id: &str, key: &str) -> String {
    let credentials = format!("{}:{}", key_id, key);
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(credentials)
    )
}

/// Send a request and turn non-success statuses into B2 errors
async fn send_checked(request: RequestBuilder) -> Result<Response, B2Error> {
    let response = request.send().await?;
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(B2Error::from_status(status, &body))
}

impl B2Client {
    /// Get current auth token
    fn auth_token(&self) -> String {
        self.auth_state.read().unwrap().auth_token.clone()
    }

    /// Get current API URL
    fn api_url(&self) -> String {
        self.auth_state.read().unwrap().api_url.clone()
    }

    /// Get current download URL
    fn download_url(&self) -> String {
        self.auth_state.read().unwrap().download_url.clone()
    }

    /// Refresh the auth token by re-authorizing with B2
    pub async fn refresh_auth(&self) -> Result<(), B2Error> {
        info!("Refreshing B2 auth token...");

        let response = send_checked(
            self.http_client
                .get(B2_AUTH_URL)
                .header("Authorization", basic_auth(&self.key_id, &self.key)),
        )
        .await?;

        let auth_response: AuthorizeAccountResponse = response.json().await?;

        let mut state = self.auth_state.write().unwrap();
        state.auth_token = auth_response.authorization_token;
        state.api_url = auth_response.api_info.storage_api.api_url;
        state.download_url = auth_response.api_info.storage_api.download_url;

        info!("B2 auth token refreshed successfully");
        Ok(())
    }

    /// Execute an operation with retry logic and exponential backoff
    async fn with_retry<F, Fut, T>(&self, operation: &str, path: &str, f: F) -> Result<T, B2Error>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, B2Error>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_retryable() || attempt == MAX_RETRIES => {
                    error!(operation = operation, path = path, error = %e, "B2 operation failed");
                    return Err(e);
                }
                Err(e) => {
                    // Handle auth expiry by refreshing token
                    if matches!(e, B2Error::AuthExpired) {
                        warn!(operation = operation, "Auth expired, refreshing token...");
                        if let Err(refresh_err) = self.refresh_auth().await {
                            error!(error = %refresh_err, "Failed to refresh auth token");
                        }
                    }

                    let delay = BACKOFF_MS.get(attempt as usize).copied().unwrap_or(2000);
                    warn!(
                        operation = operation,
                        attempt = attempt + 1,
                        max = MAX_RETRIES,
                        delay_ms = delay,
                        error = %e,
                        "Retrying B2 operation"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Authorize with B2 and create a new client for the specified bucket
    ///
    /// # Arguments
    /// * `key_id` - B2 application key ID
    /// * `key` - B2 application key
    /// * `bucket_name` - Name of the bucket holding shared blobs
    pub async fn authorize(key_id: &str, key: &str, bucket_name: &str) -> Result<Self, B2Error> {
        info!(bucket = bucket_name, "Authorizing with B2 API...");

        let http_client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        let response = send_checked(
            http_client
                .get(B2_AUTH_URL)
                .header("Authorization", basic_auth(key_id, key)),
        )
        .await?;
        let auth_response: AuthorizeAccountResponse = response.json().await?;

        let api_url = auth_response.api_info.storage_api.api_url;
        let download_url = auth_response.api_info.storage_api.download_url;
        debug!(api_url = %api_url, download_url = %download_url, "B2 authorization successful");

        let mut client = Self {
            http_client,
            account_id: auth_response.account_id,
            auth_state: Arc::new(RwLock::new(AuthState {
                auth_token: auth_response.authorization_token,
                api_url,
                download_url,
            })),
            key_id: key_id.to_string(),
            key: key.to_string(),
            bucket_id: String::new(),
            bucket_name: bucket_name.to_string(),
        };

        client.bucket_id = client.get_bucket_id(bucket_name).await?;

        info!(bucket_name = bucket_name, bucket_id = %client.bucket_id, "B2 client ready");
        Ok(client)
    }

    /// Look up bucket ID from bucket name
    async fn get_bucket_id(&self, bucket_name: &str) -> Result<String, B2Error> {
        let url = format!("{}/b2api/v2/b2_list_buckets", self.api_url());

        let response = send_checked(
            self.http_client
                .post(&url)
                .header("Authorization", self.auth_token())
                .json(&serde_json::json!({
                    "accountId": self.account_id,
                    "bucketName": bucket_name
                })),
        )
        .await?;
        let list_response: ListBucketsResponse = response.json().await?;

        list_response
            .buckets
            .into_iter()
            .find(|b| b.bucket_name == bucket_name)
            .map(|b| b.bucket_id)
            .ok_or_else(|| B2Error::NotFound(format!("bucket '{}'", bucket_name)))
    }

    /// List files in the bucket with an optional prefix
    pub async fn list_file_names(&self, prefix: Option<&str>) -> Result<Vec<FileInfo>, B2Error> {
        let url = format!("{}/b2api/v2/b2_list_file_names", self.api_url());
        let mut all_files = Vec::new();
        let mut start_file_name: Option<String> = None;

        loop {
            let request = ListFileNamesRequest {
                bucket_id: self.bucket_id.clone(),
                prefix: prefix.map(String::from),
                max_file_count: 1000,
                start_file_name: start_file_name.clone(),
            };

            debug!(prefix = ?prefix, start = ?start_file_name, "Listing files from B2");

            let list_response: ListFilesResponse = self
                .with_retry("list_file_names", prefix.unwrap_or(""), || {
                    let request = self
                        .http_client
                        .post(&url)
                        .header("Authorization", self.auth_token())
                        .json(&request);
                    async move {
                        match send_checked(request).await {
                            Ok(response) => response.json::<ListFilesResponse>().await.map_err(B2Error::from),
                            Err(e) => Err(e),
                        }
                    }
                })
                .await?;

            all_files.extend(list_response.files);

            match list_response.next_file_name {
                Some(next) => start_file_name = Some(next),
                None => break,
            }
        }

        debug!(count = all_files.len(), "Listed files from B2");
        Ok(all_files)
    }

    /// Look up a single file by its exact name
    pub async fn get_file_info(&self, file_name: &str) -> Result<FileInfo, B2Error> {
        // B2 has no direct "get file by name" call; list with the exact name as prefix
        self.list_file_names(Some(file_name))
            .await?
            .into_iter()
            .find(|f| f.file_name == file_name)
            .ok_or_else(|| B2Error::NotFound(file_name.to_string()))
    }

    /// Public download URL for a file name
    pub fn blob_url(&self, file_name: &str) -> String {
        format!(
            "{}/file/{}/{}",
            self.download_url(),
            self.bucket_name,
            urlencoding::encode(file_name)
        )
    }

    /// Get an upload URL for uploading files to B2
    async fn get_upload_url(&self) -> Result<UploadUrl, B2Error> {
        let url = format!("{}/b2api/v2/b2_get_upload_url", self.api_url());

        let response = send_checked(
            self.http_client
                .post(&url)
                .header("Authorization", self.auth_token())
                .json(&serde_json::json!({ "bucketId": self.bucket_id })),
        )
        .await?;

        let upload_url: UploadUrl = response.json().await?;
        debug!(url = %upload_url.upload_url, "Got B2 upload URL");
        Ok(upload_url)
    }

    /// Upload a file to B2 (single attempt)
    ///
    /// # Arguments
    /// * `file_name` - Full file path within the bucket
    /// * `data` - File content bytes
    /// * `content_type` - MIME type
    /// * `owner_tag` - Stored as `X-Bz-Info-owner`
    pub async fn upload_file(
        &self,
        file_name: &str,
        data: Bytes,
        content_type: &str,
        owner_tag: &str,
    ) -> Result<FileInfo, B2Error> {
        let upload_url = self.get_upload_url().await?;

        let mut hasher = Sha1::new();
        hasher.update(&data);
        let hash = format!("{:x}", hasher.finalize());

        info!(
            file = file_name,
            size = data.len(),
            content_type = content_type,
            "Uploading file to B2"
        );

        let response = send_checked(
            self.http_client
                .post(&upload_url.upload_url)
                .header("Authorization", &upload_url.authorization_token)
                .header("X-Bz-File-Name", urlencoding::encode(file_name).as_ref())
                .header("Content-Type", content_type)
                .header("Content-Length", data.len())
                .header("X-Bz-Content-Sha1", &hash)
                .header("X-Bz-Info-owner", urlencoding::encode(owner_tag).as_ref())
                .body(data),
        )
        .await?;

        let info: FileInfo = response.json().await?;
        info!(file = file_name, file_id = ?info.file_id, "File uploaded to B2");
        Ok(info)
    }

    /// Delete a file version from B2 (permanent delete)
    pub async fn delete_file(&self, file_name: &str, file_id: &str) -> Result<(), B2Error> {
        let url = format!("{}/b2api/v2/b2_delete_file_version", self.api_url());

        info!(file = file_name, file_id = file_id, "Deleting file from B2");

        send_checked(
            self.http_client
                .post(&url)
                .header("Authorization", self.auth_token())
                .json(&serde_json::json!({
                    "fileName": file_name,
                    "fileId": file_id
                })),
        )
        .await?;

        info!(file = file_name, "File deleted from B2");
        Ok(())
    }

    /// Get the bucket ID
    pub fn bucket_id(&self) -> &str {
        &self.bucket_id
    }

    /// Get the bucket name
    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }
}

#[async_trait]
impl BlobStore for B2Client {
    // The publish pipeline owns upload retries; only an expired token is retried here.
    async fn upload(
        &self,
        storage_path: &str,
        data: Bytes,
        content_type: &str,
        owner_tag: &str,
    ) -> SyncResult<UploadedBlob> {
        let size = data.len() as u64;
        let result = match self
            .upload_file(storage_path, data.clone(), content_type, owner_tag)
            .await
        {
            Err(B2Error::AuthExpired) => {
                self.refresh_auth().await?;
                self.upload_file(storage_path, data, content_type, owner_tag)
                    .await
            }
            other => other,
        };
        let info = result?;

        Ok(UploadedBlob {
            storage_path: info.file_name.clone(),
            blob_url: self.blob_url(&info.file_name),
            size,
        })
    }

    async fn download(&self, storage_path: &str, blob_url: &str) -> SyncResult<BlobDownload> {
        debug!(file = storage_path, url = %blob_url, "Downloading file from B2");

        // A single attempt: failed fetches are retried by the next reconcile pass
        let open = || {
            // Build the URL fresh: the download host can change on re-auth
            send_checked(
                self.http_client
                    .get(self.blob_url(storage_path))
                    .header("Authorization", self.auth_token()),
            )
        };
        let response = match open().await {
            Err(B2Error::AuthExpired) => {
                self.refresh_auth().await?;
                open().await
            }
            other => other,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(file = storage_path, error = %e, "B2 download failed");
                return Err(e.into());
            }
        };

        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| SyncError::from(B2Error::from(e))));

        Ok(BlobDownload {
            content_length,
            stream: Box::pin(stream),
        })
    }

    async fn delete(&self, storage_path: &str) -> SyncResult<()> {
        let info = self.get_file_info(storage_path).await?;
        let file_id = info
            .file_id
            .ok_or_else(|| B2Error::NotFound(storage_path.to_string()))?;

        self.with_retry("delete", storage_path, || {
            self.delete_file(storage_path, &file_id)
        })
        .await?;
        Ok(())
    }
}
