//! Local File Cache
//!
//! Flat directory of shared files keyed by their logical file name.
//! Every write goes through a sibling temp file and an atomic rename, so a
//! reader sees either the previous content or the new content, never a
//! partial file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

/// Prefix for in-progress temp files inside the cache root
const TEMP_PREFIX: &str = ".sharecache-";

/// Suffix for in-progress temp files inside the cache root
const TEMP_SUFFIX: &str = ".tmp";

/// Longest file name most filesystems accept
const MAX_NAME_LEN: usize = 255;

/// A temp file inside the cache root that has not been installed yet.
///
/// Dropping it without calling [`CacheStore::install`] deletes it.
#[derive(Debug)]
pub struct StagedFile {
    tmp: tempfile::NamedTempFile,
    written: u64,
}

impl StagedFile {
    /// Number of bytes written so far
    pub fn len(&self) -> u64 {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Path of the temp file (not the final cache path)
    pub fn path(&self) -> &Path {
        self.tmp.path()
    }

    /// Flush buffered bytes and sync them to disk
    pub fn finish(&mut self) -> io::Result<()> {
        self.tmp.as_file_mut().flush()?;
        self.tmp.as_file().sync_all()
    }
}

impl Write for StagedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.tmp.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tmp.flush()
    }
}

/// On-disk store for cached file content
pub struct CacheStore {
    /// Root directory for cached files
    cache_dir: PathBuf,
}

impl CacheStore {
    /// Open the default cache for a user
    ///
    /// # Arguments
    /// * `user_id` - Local user ID (used as subdirectory name)
    pub fn for_user(user_id: &str) -> SyncResult<Self> {
        Self::validate_name(user_id)?;
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("sharecache")
            .join(user_id);

        Self::with_root(cache_dir)
    }

    /// Open a cache rooted at a specific directory
    pub fn with_root(cache_dir: PathBuf) -> SyncResult<Self> {
        fs::create_dir_all(&cache_dir)?;

        let cache = Self { cache_dir };

        // Clean up any stale temp files from previous runs
        cache.cleanup();

        info!(cache_dir = %cache.cache_dir.display(), "File cache initialized");
        Ok(cache)
    }

    /// Reject names that are not a single, ordinary path segment.
    ///
    /// Runs before any filesystem call that takes a name.
    pub fn validate_name(name: &str) -> SyncResult<()> {
        let invalid = name.is_empty()
            || name == "."
            || name == ".."
            || name.len() > MAX_NAME_LEN
            || name.starts_with(TEMP_PREFIX)
            || name.chars().any(|c| c == '/' || c == '\\' || c == '\0');

        if invalid {
            return Err(SyncError::InvalidName(name.to_string()));
        }
        Ok(())
    }

    /// Path a name is (or would be) cached at
    pub fn path_of(&self, name: &str) -> SyncResult<PathBuf> {
        Self::validate_name(name)?;
        Ok(self.cache_dir.join(name))
    }

    /// Check whether a name currently has content on disk
    pub fn exists(&self, name: &str) -> SyncResult<bool> {
        Ok(self.path_of(name)?.is_file())
    }

    /// Open cached content for reading
    pub fn open(&self, name: &str) -> SyncResult<File> {
        let path = self.path_of(name)?;
        File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SyncError::NotFound(name.to_string()),
            _ => SyncError::Io(e),
        })
    }

    /// Create an empty temp file inside the cache root
    pub fn stage(&self) -> SyncResult<StagedFile> {
        let tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.cache_dir)?;
        Ok(StagedFile { tmp, written: 0 })
    }

    /// Atomically move a staged file into place under `name`
    pub fn install(&self, name: &str, staged: StagedFile) -> SyncResult<PathBuf> {
        let local_path = self.path_of(name)?;
        let size = staged.written;

        staged
            .tmp
            .persist(&local_path)
            .map_err(|e| SyncError::Io(e.error))?;

        debug!(
            name = name,
            local = %local_path.display(),
            size = size,
            "Installed file in cache"
        );
        Ok(local_path)
    }

    /// Copy `source` into the cache under `name`, replacing atomically
    pub fn put(&self, name: &str, source: &Path) -> SyncResult<PathBuf> {
        Self::validate_name(name)?;

        let mut staged = self.stage()?;
        let mut reader = File::open(source)?;
        io::copy(&mut reader, &mut staged)?;
        staged.finish()?;

        self.install(name, staged)
    }

    /// Atomically rename cached content, replacing any file at `to`
    pub fn rename(&self, from: &str, to: &str) -> SyncResult<PathBuf> {
        let from_path = self.path_of(from)?;
        let to_path = self.path_of(to)?;

        fs::rename(&from_path, &to_path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SyncError::NotFound(from.to_string()),
            _ => SyncError::Io(e),
        })?;

        debug!(from = from, to = to, "Renamed cached file");
        Ok(to_path)
    }

    /// Remove cached content. Returns whether anything was removed.
    pub fn remove(&self, name: &str) -> SyncResult<bool> {
        let path = self.path_of(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(name = name, "Removed cached file");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SyncError::Io(e)),
        }
    }

    /// Names of the cached files on disk, temp files excluded
    pub fn list(&self) -> SyncResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if Self::validate_name(&name).is_ok() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Clean up stale temp files on startup
    pub fn cleanup(&self) {
        let read_dir = match fs::read_dir(&self.cache_dir) {
            Ok(read_dir) => read_dir,
            Err(e) => {
                warn!(cache_dir = %self.cache_dir.display(), error = %e, "Cannot scan cache directory");
                return;
            }
        };

        for entry in read_dir.flatten() {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(TEMP_PREFIX) && file_name.ends_with(TEMP_SUFFIX) {
                debug!(path = %entry.path().display(), "Removing stale temp file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    /// Get the cache directory path
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}
