//! Support to fetch images from the local filesystem.
//!
//! It allows images to be bundled with the host application, and is used a lot in testing.

use std::io;
use std::path::Path;

use bytes::Bytes;

use super::FetchError;

/// Fetcher implementation that supports `file` URIs.
#[derive(Debug, Default)]
pub struct FilesystemFetcher {}

impl FilesystemFetcher {
    pub fn new() -> Self {
        Self {}
    }

    /// Reads the image at `path`.
    pub async fn download(&self, path: &Path) -> Result<Bytes, FetchError> {
        tracing::debug!("Fetching image from {:?}", path);

        let contents = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FetchError::NotFound,
            _ => e.into(),
        })?;
        Ok(contents.into())
    }
}
