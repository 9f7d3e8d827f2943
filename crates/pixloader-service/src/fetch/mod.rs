//! Service which fetches the encoded bytes of images from their URI.
//!
//! The [`Fetcher`] trait is the seam to the network. [`DownloadService`] is the default
//! implementation, which dispatches on the URI scheme:
//!
//! - `http` and `https` are downloaded with `reqwest`.
//! - `file` reads local files, which is mostly useful for bundled assets and testing.

use std::error::Error;
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::NamedTempFile;
use url::Url;

use crate::caching::DiskCache;
use crate::config::Config;
use crate::types::Request;
use crate::utils::http::{DownloadTimeouts, create_client};

mod filesystem;
mod http;

pub use self::filesystem::FilesystemFetcher;
pub use self::http::HttpFetcher;

/// An error fetching an image.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The image does not exist at its source.
    #[error("not found")]
    NotFound,
    /// The source refused access to the image.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The fetch did not complete within the given time.
    #[error("download was cancelled after {0:?}")]
    Timeout(Duration),
    /// The download failed, e.g. because of a network or server error.
    #[error("download failed: {0}")]
    Download(String),
    /// There is no fetcher for the scheme of the URI.
    #[error("unsupported URI scheme `{0}`")]
    UnsupportedScheme(String),
    /// Writing the downloaded image failed.
    #[error("i/o error: {0}")]
    Io(String),
}

impl FetchError {
    fn download_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::Download(error_string)
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}

impl From<io::Error> for FetchError {
    fn from(error: io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

/// Where the fetched bytes ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The image was written to the requested cache file.
    File(PathBuf),
    /// The image was kept in memory, as no cache file was requested.
    Bytes(Bytes),
}

/// Fetches the encoded bytes of a requested image.
#[async_trait]
pub trait Fetcher: std::fmt::Debug + Send + Sync {
    /// Fetches the image of `request`.
    ///
    /// If `cache_file` is given, the image has to be written to that path, replacing any
    /// existing file, and [`FetchOutcome::File`] is returned. Otherwise the bytes are returned
    /// in memory.
    async fn fetch(
        &self,
        request: &Request,
        cache_file: Option<&Path>,
    ) -> Result<FetchOutcome, FetchError>;
}

/// Try to run a future up to 3 times with 20 millisecond delays on failure.
pub async fn retry<G, F, T>(task_gen: G) -> Result<T, FetchError>
where
    G: Fn() -> F,
    F: Future<Output = Result<T, FetchError>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        let result = task_gen().await;

        // its highly unlikely we get a different result when retrying these
        let should_not_retry = matches!(
            result,
            Ok(_) | Err(FetchError::NotFound | FetchError::PermissionDenied(_))
        );

        if should_not_retry || tries >= 3 {
            break result;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// The default [`Fetcher`], dispatching on the URI scheme.
#[derive(Debug)]
pub struct DownloadService {
    http: HttpFetcher,
    fs: FilesystemFetcher,
    disk: Option<DiskCache>,
}

impl DownloadService {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let timeouts = DownloadTimeouts::from_config(config);
        let client = create_client(
            &timeouts,
            config.connect_to_reserved_ips,
            &config.user_agent,
        )?;

        Ok(Self {
            http: HttpFetcher::new(client, timeouts),
            fs: FilesystemFetcher::new(),
            disk: DiskCache::from_config(config)?,
        })
    }

    async fn download(&self, uri: &str) -> Result<Bytes, FetchError> {
        // Bare paths are treated like `file://` URIs.
        let url = match Url::parse(uri) {
            Ok(url) => url,
            Err(_) if Path::new(uri).is_absolute() => {
                return self.fs.download(Path::new(uri)).await;
            }
            Err(e) => {
                tracing::debug!(error = &e as &dyn Error, uri, "Invalid image URI");
                return Err(FetchError::NotFound);
            }
        };

        match url.scheme() {
            "http" | "https" => retry(|| self.http.download(&url)).await,
            "file" => {
                let path = url.to_file_path().map_err(|_| FetchError::NotFound)?;
                self.fs.download(&path).await
            }
            scheme => Err(FetchError::UnsupportedScheme(scheme.to_owned())),
        }
    }

    /// Writes `bytes` to `cache_file`, via a temporary file that is atomically moved into place.
    ///
    /// The file system work happens on the blocking thread pool.
    async fn write_cache_file(&self, bytes: Bytes, cache_file: &Path) -> io::Result<()> {
        let disk = self.disk.clone();
        let cache_file = cache_file.to_owned();

        tokio::task::spawn_blocking(move || {
            let mut temp_file = create_tempfile(disk.as_ref(), &cache_file)?;
            temp_file.write_all(&bytes)?;

            match &disk {
                Some(disk) => disk.persist(temp_file, &cache_file),
                None => temp_file
                    .persist(&cache_file)
                    .map(|_| ())
                    .map_err(|e| e.error),
            }
        })
        .await
        .map_err(io::Error::other)?
    }
}

fn create_tempfile(disk: Option<&DiskCache>, cache_file: &Path) -> io::Result<NamedTempFile> {
    if let Some(disk) = disk {
        return disk.tempfile();
    }
    let parent = cache_file
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;
    std::fs::create_dir_all(parent)?;
    tempfile::Builder::new().prefix("tmp").tempfile_in(parent)
}

#[async_trait]
impl Fetcher for DownloadService {
    async fn fetch(
        &self,
        request: &Request,
        cache_file: Option<&Path>,
    ) -> Result<FetchOutcome, FetchError> {
        let uri = request.uri();
        tracing::trace!(uri, "Fetching image");

        let result = self.download(uri).await;
        if let Err(ref e @ (FetchError::Download(_) | FetchError::Io(_))) = result {
            metric!(counter("fetch.failure") += 1);
            tracing::debug!(error = e as &dyn Error, uri, "Failed to fetch image");
        }
        let bytes = result?;

        let Some(cache_file) = cache_file else {
            return Ok(FetchOutcome::Bytes(bytes));
        };

        if let Err(e) = self.write_cache_file(bytes.clone(), cache_file).await {
            tracing::error!(
                error = &e as &dyn Error,
                path = %cache_file.display(),
                "Failed to write cache file"
            );
            return Err(e.into());
        }
        metric!(time_raw("fetch.size") = bytes.len() as u64);
        Ok(FetchOutcome::File(cache_file.to_owned()))
    }
}
