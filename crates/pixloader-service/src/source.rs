//! Selection of the byte source for a request: a valid disk cache file, or a fresh fetch.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::caching::{DiskCache, DiskKey};
use crate::fetch::{FetchError, FetchOutcome, Fetcher};
use crate::types::Request;

/// A handle to encoded image bytes, opened lazily by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ByteSource {
    /// The bytes are in a disk cache file.
    File(PathBuf),
    /// The bytes were kept in memory.
    Memory(Bytes),
}

impl ByteSource {
    /// Reads all the bytes of this source.
    pub fn read(&self) -> io::Result<Bytes> {
        match self {
            Self::File(path) => std::fs::read(path).map(Bytes::from),
            Self::Memory(bytes) => Ok(bytes.clone()),
        }
    }

    pub fn is_file_backed(&self) -> bool {
        matches!(self, Self::File(_))
    }

    /// The cache file backing this source, if any.
    pub fn cache_file(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Memory(_) => None,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::File(_) => SourceKind::File,
            Self::Memory(_) => SourceKind::Memory,
        }
    }
}

impl fmt::Display for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "file `{}`", path.display()),
            Self::Memory(bytes) => write!(f, "{} bytes in memory", bytes.len()),
        }
    }
}

/// The kind of a [`ByteSource`], without its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Memory,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => f.write_str("file"),
            Self::Memory => f.write_str("memory"),
        }
    }
}

/// The layer a drawable was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadedFrom {
    Memory,
    Disk,
    Network,
}

impl fmt::Display for LoadedFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Disk => f.write_str("disk"),
            Self::Network => f.write_str("network"),
        }
    }
}

/// The result of [`SourceSelector::resolve`].
#[derive(Debug)]
pub struct Resolved {
    /// The byte source, or why none could be fetched.
    pub source: Result<ByteSource, FetchError>,
    pub from: LoadedFrom,
}

/// Decides whether a request is served from the disk cache or has to be fetched.
#[derive(Debug, Clone)]
pub struct SourceSelector {
    disk: Option<DiskCache>,
    fetcher: Arc<dyn Fetcher>,
    fetch_timeout: Duration,
}

impl SourceSelector {
    pub fn new(disk: Option<DiskCache>, fetcher: Arc<dyn Fetcher>, fetch_timeout: Duration) -> Self {
        Self {
            disk,
            fetcher,
            fetch_timeout,
        }
    }

    pub fn disk_cache(&self) -> Option<&DiskCache> {
        self.disk.as_ref()
    }

    /// The key of the disk cache file `request` goes through, if any.
    ///
    /// All size variants of an image map to the same key.
    pub fn disk_key(&self, request: &Request) -> Option<DiskKey> {
        let disk = self.disk.as_ref()?;
        request
            .cache_policy()
            .cache_in_disk
            .then(|| disk.key_for(request.uri()))
    }

    /// Resolves the byte source for `request`.
    ///
    /// A disk cache file is used if the request allows it and the file is younger than the
    /// request's validity. Otherwise the image is fetched, into the cache file if the disk cache
    /// is enabled for the request.
    pub async fn resolve(&self, request: &Request) -> Resolved {
        let policy = request.cache_policy();
        let disk = self.disk.as_ref().filter(|_| policy.cache_in_disk);

        let Some(disk) = disk else {
            return Resolved {
                source: self.fetch(request, None).await,
                from: LoadedFrom::Network,
            };
        };

        let cache_file = disk.path_for(request.uri());
        if disk.is_valid(&cache_file, policy.disk_cache_validity) {
            metric!(counter("loader.disk.hit") += 1);
            tracing::trace!(path = %cache_file.display(), "Using disk cache file");
            return Resolved {
                source: Ok(ByteSource::File(cache_file)),
                from: LoadedFrom::Disk,
            };
        }

        Resolved {
            source: self.fetch(request, Some(&cache_file)).await,
            from: LoadedFrom::Network,
        }
    }

    async fn fetch(
        &self,
        request: &Request,
        cache_file: Option<&Path>,
    ) -> Result<ByteSource, FetchError> {
        metric!(counter("loader.fetch") += 1);

        let fetch = self.fetcher.fetch(request, cache_file);
        let outcome = match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Ok(outcome) => outcome?,
            Err(_) => {
                tracing::debug!(uri = request.uri(), "Fetch timed out");
                return Err(FetchError::Timeout(self.fetch_timeout));
            }
        };

        Ok(match outcome {
            FetchOutcome::File(path) => ByteSource::File(path),
            FetchOutcome::Bytes(bytes) => ByteSource::Memory(bytes),
        })
    }
}
