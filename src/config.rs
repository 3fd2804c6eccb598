//! Configuration loading
//!
//! Everything comes from the environment; the daemon has no config file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::sync::EngineOptions;

/// Default bound on concurrent downloads
const DEFAULT_MAX_DOWNLOADS: usize = 4;

/// Default metadata polling interval in seconds
const DEFAULT_POLL_SECS: u64 = 5;

/// Credentials for the B2 bucket holding shared blobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct B2Credentials {
    pub key_id: String,
    pub key: String,
    pub bucket: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Overrides the per-user default under the platform cache directory
    pub cache_dir: Option<PathBuf>,
    pub metadata_url: String,
    pub b2: B2Credentials,
    pub max_downloads: usize,
    pub poll_interval: Duration,
}

impl Config {
    /// Load configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |name: &str| -> Result<String> {
            lookup(name)
                .filter(|value| !value.is_empty())
                .with_context(|| format!("{name} is not set"))
        };

        let max_downloads = match lookup("SHARECACHE_MAX_DOWNLOADS") {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("SHARECACHE_MAX_DOWNLOADS is not a number: {raw}"))?,
            None => DEFAULT_MAX_DOWNLOADS,
        };
        let poll_secs = match lookup("SHARECACHE_POLL_SECS") {
            Some(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("SHARECACHE_POLL_SECS is not a number: {raw}"))?,
            None => DEFAULT_POLL_SECS,
        };

        Ok(Self {
            cache_dir: lookup("SHARECACHE_CACHE_DIR")
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
            metadata_url: required("SHARECACHE_METADATA_URL")?,
            b2: B2Credentials {
                key_id: required("B2_KEY_ID")?,
                key: required("B2_KEY")?,
                bucket: required("B2_BUCKET")?,
            },
            max_downloads,
            poll_interval: Duration::from_secs(poll_secs.max(1)),
        })
    }

    /// Cache root for a user
    pub fn cache_dir_for(&self, user_id: &str) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("sharecache")
                .join(user_id),
        }
    }

    /// Engine tuning derived from this configuration.
    ///
    /// A download limit of 0 means unbounded.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_concurrent_downloads: (self.max_downloads > 0).then_some(self.max_downloads),
            ..EngineOptions::default()
        }
    }
}
