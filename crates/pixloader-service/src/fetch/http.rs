//! Support to download images from HTTP sources.

use bytes::Bytes;
use reqwest::{Client, StatusCode};
use url::Url;

use crate::utils::http::DownloadTimeouts;

use super::FetchError;

/// Fetcher implementation that supports `http` and `https` URIs.
#[derive(Debug)]
pub struct HttpFetcher {
    client: Client,
    timeouts: DownloadTimeouts,
}

impl HttpFetcher {
    pub fn new(client: Client, timeouts: DownloadTimeouts) -> Self {
        Self { client, timeouts }
    }

    /// Downloads the image at `url` into memory.
    pub async fn download(&self, url: &Url) -> Result<Bytes, FetchError> {
        tracing::debug!("Fetching image from `{}`", url);

        let request = self.client.get(url.clone()).send();
        let response = match tokio::time::timeout(self.timeouts.head, request).await {
            Ok(response) => response?,
            Err(_) => return Err(FetchError::Timeout(self.timeouts.head)),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(handle_status(url, status));
        }

        let bytes = response.bytes().await?;
        metric!(time_raw("fetch.http.size") = bytes.len() as u64);
        Ok(bytes)
    }
}

/// Converts a failed response status into a [`FetchError`].
fn handle_status(url: &Url, status: StatusCode) -> FetchError {
    if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
        tracing::debug!("Insufficient permissions to download `{url}`: {status}");

        FetchError::PermissionDenied(status.to_string())
    } else if status.is_client_error() {
        // If it's a client error, chances are it's a 404.
        tracing::debug!("Unexpected client error status code from `{url}`: {status}");

        FetchError::NotFound
    } else if status == StatusCode::FOUND {
        tracing::debug!("Potential login page detected when downloading from `{url}`: {status}");

        FetchError::PermissionDenied("Potential login page detected".to_string())
    } else {
        tracing::debug!("Unexpected status code from `{url}`: {status}");

        FetchError::Download(status.to_string())
    }
}
