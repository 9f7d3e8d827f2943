use std::fs::{read_dir, remove_dir, remove_file};
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Result, anyhow};

use crate::config::Config;

use super::DiskCache;
use super::fs::catch_not_found;

/// Entry function for the cleanup command.
///
/// This removes all disk cache files that were not written for longer than `max_unused_for`.
/// If `dry_run` is `true`, no files will actually be deleted.
pub fn cleanup(config: Config, dry_run: bool) -> Result<CleanupStats> {
    let cache = DiskCache::from_config(&config)?.ok_or_else(|| {
        anyhow!("no caching configured! Did you provide a path to your config file?")
    })?;
    cache.clear_tmp()?;
    cache.cleanup(dry_run, SystemTime::now())
}

/// The outcome of a [`cleanup`] run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_dirs: usize,
    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl DiskCache {
    /// Clear the temporary files.
    ///
    /// Downloads interrupted by a hard crash would otherwise leave their temporary files behind.
    pub fn clear_tmp(&self) -> io::Result<()> {
        let tmp = self.tmp_dir();
        if tmp.exists() {
            std::fs::remove_dir_all(tmp)?;
        }
        std::fs::create_dir_all(tmp)
    }

    /// Cleans up this cache based on the configured `max_unused_for`, as seen at `now`.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool, now: SystemTime) -> Result<CleanupStats> {
        tracing::info!("Cleaning up image cache");
        let max_unused_for = self.config().max_unused_for.unwrap_or(Duration::MAX);

        let mut stats = CleanupStats::default();
        let cleanup = Cleanup {
            max_unused_for,
            now,
            dry_run,
        };
        cleanup.directory_recursive(self.cache_dir(), &mut stats)?;

        tracing::info!("Cleaning up image cache complete");
        tracing::info!(
            "Retained {} directories and {} files, totaling {} bytes",
            stats.retained_dirs,
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} directories and {} files, totaling {} bytes",
            stats.removed_dirs,
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64, "cache" => "images");
        metric!(gauge("caches.size.bytes") = stats.retained_bytes, "cache" => "images");
        metric!(counter("caches.size.files_removed") += stats.removed_files as i64, "cache" => "images");
        metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64, "cache" => "images");

        Ok(stats)
    }
}

struct Cleanup {
    max_unused_for: Duration,
    now: SystemTime,
    dry_run: bool,
}

impl Cleanup {
    /// Cleans up the directory recursively, returning `true` if the directory is left empty after cleanup.
    fn directory_recursive(&self, directory: &Path, stats: &mut CleanupStats) -> Result<bool> {
        let entries = match catch_not_found(|| read_dir(directory))? {
            Some(x) => x,
            None => {
                tracing::warn!("Directory not found: `{}`", directory.display());
                return Ok(true);
            }
        };
        tracing::debug!("Cleaning directory `{}`", directory.display());

        let mut is_empty = true;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                let mut dir_is_empty = self.directory_recursive(&path, stats)?;
                if dir_is_empty {
                    tracing::debug!("Removing directory `{}`", path.display());
                    if !self.dry_run {
                        if let Err(e) = remove_dir(&path) {
                            sentry::with_scope(
                                |scope| scope.set_extra("path", path.display().to_string().into()),
                                || tracing::error!("Failed to clean cache directory: {:?}", e),
                            );
                            dir_is_empty = false;
                        }
                    }
                }
                if dir_is_empty {
                    stats.removed_dirs += 1;
                } else {
                    stats.retained_dirs += 1;
                }
                is_empty &= dir_is_empty;
            } else {
                match self.try_cleanup_path(&path, stats) {
                    Err(e) => {
                        sentry::with_scope(
                            |scope| scope.set_extra("path", path.display().to_string().into()),
                            || tracing::error!("Failed to clean cache file: {:?}", e),
                        );
                        is_empty = false;
                    }
                    Ok(file_removed) => is_empty &= file_removed,
                }
            }
        }

        Ok(is_empty)
    }

    /// Tries to clean up the file at `path`, returning `true` if it was removed.
    fn try_cleanup_path(&self, path: &Path, stats: &mut CleanupStats) -> Result<bool> {
        tracing::trace!("Checking file `{}`", path.display());
        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            return Ok(true);
        };
        anyhow::ensure!(metadata.is_file(), "not a file");
        let size = metadata.len();

        let unused_for = self
            .now
            .duration_since(metadata.modified()?)
            .unwrap_or_default();
        if unused_for > self.max_unused_for {
            tracing::debug!("Removing file `{}`", path.display());
            if !self.dry_run {
                catch_not_found(|| remove_file(path))?;
            }

            stats.removed_bytes += size;
            stats.removed_files += 1;

            return Ok(true);
        }
        stats.retained_bytes += size;
        stats.retained_files += 1;

        Ok(false)
    }
}
