use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::NamedTempFile;

use crate::config::{Config, DiskCacheConfig};

use super::DiskKey;

/// The version of the on-disk layout, part of every cache path.
pub const DISK_CACHE_VERSION: u32 = 1;

/// The file-system tier of the image cache.
///
/// Downloaded images are stored under [`path_for`](Self::path_for) and are served from there
/// as long as they are younger than the validity period of the request.
#[derive(Debug, Clone)]
pub struct DiskCache {
    /// Directory to use for storing cache items. Will be created if it does not exist.
    cache_dir: PathBuf,

    /// Directory to use for temporary files.
    ///
    /// Downloads are first written to a temporary file in this sibling directory, and once
    /// fully written atomically moved to their actual location within the `cache_dir`.
    tmp_dir: PathBuf,

    config: DiskCacheConfig,
}

impl DiskCache {
    /// Creates the disk cache if a `cache_dir` is configured.
    pub fn from_config(config: &Config) -> io::Result<Option<Self>> {
        let (Some(cache_dir), Some(tmp_dir)) = (config.cache_dir("images"), config.cache_dir("tmp"))
        else {
            return Ok(None);
        };

        std::fs::create_dir_all(&cache_dir)?;

        Ok(Some(Self {
            cache_dir,
            tmp_dir,
            config: config.caches.disk,
        }))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn config(&self) -> &DiskCacheConfig {
        &self.config
    }

    /// The path of the cache file for `uri`.
    ///
    /// This is a pure function of the URI, the file itself might not exist.
    pub fn path_for(&self, uri: &str) -> PathBuf {
        self.cache_dir
            .join(self.key_for(uri).cache_path(DISK_CACHE_VERSION))
    }

    pub fn key_for(&self, uri: &str) -> DiskKey {
        DiskKey::for_uri(uri)
    }

    /// Whether the file at `path` exists and is younger than `max_age`.
    pub fn is_valid(&self, path: &Path, max_age: Duration) -> bool {
        is_valid_at(path, max_age, SystemTime::now())
    }

    /// Create a new temporary file to download into.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        // The `cleanup` process could potentially remove the parent directories we are
        // operating in, so be defensive here and retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(&self.tmp_dir) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %self.tmp_dir.display(),
                    "Failed to create temp directory",
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix("tmp")
                .tempfile_in(&self.tmp_dir)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        path = %self.tmp_dir.display(),
                        "Failed to create temp file",
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }

    /// Atomically moves a fully written `temp_file` to `cache_path`, replacing any existing file.
    pub fn persist(&self, temp_file: NamedTempFile, cache_path: &Path) -> io::Result<()> {
        persist_tempfile(temp_file, cache_path).map(|_| ())
    }

    /// Removes a cache file whose contents could not be decoded.
    ///
    /// Returns `true` if a file was removed.
    pub fn remove_corrupted(&self, path: &Path) -> bool {
        match std::fs::remove_file(path) {
            Ok(()) => {
                metric!(counter("loader.disk.corrupted") += 1);
                tracing::debug!(path = %path.display(), "Removed corrupted cache file");
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to remove corrupted cache file",
                );
                false
            }
        }
    }
}

/// Whether the file at `path` exists and its age at `now` is strictly below `max_age`.
///
/// The age is measured from the file's `mtime`, which is bumped whenever a fetch
/// rewrites the file. Files with an `mtime` in the future count as fresh.
pub fn is_valid_at(path: &Path, max_age: Duration, now: SystemTime) -> bool {
    let Ok(metadata) = path.metadata() else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    let Ok(mtime) = metadata.modified() else {
        return false;
    };
    let age = now.duration_since(mtime).unwrap_or_default();
    age < max_age
}

fn persist_tempfile(
    mut temp_file: NamedTempFile,
    cache_path: &Path,
) -> std::io::Result<std::fs::File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| std::io::Error::other("no parent directory to persist item"))?;

    // The `cleanup` process could potentially remove the parent directories we are
    // operating in, so be defensive here and retry the fs operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    let file = loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(parent) {
            sentry::with_scope(
                |scope| scope.set_extra("path", parent.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => break file,
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                sentry::with_scope(
                    |scope| scope.set_extra("path", cache_path.display().to_string().into()),
                    || tracing::error!("Failed to create cache file: {:?}", err),
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    };
    Ok(file)
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
