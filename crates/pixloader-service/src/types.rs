//! Request types handed to the [`ImageLoader`](crate::loader::ImageLoader).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::caching::RequestKey;
use crate::decode::PostProcessor;

/// The size a decoded bitmap should be scaled towards.
///
/// A dimension of `0` means "unbounded" on that axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub const UNBOUNDED: Self = Self::new(0, 0);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for TargetSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Which cache tiers a request may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Store the resulting drawable in the memory cache.
    pub cache_in_memory: bool,
    /// Read from, and let the fetcher write to, the disk cache.
    pub cache_in_disk: bool,
    /// A disk cache file at least this old is treated as absent.
    pub disk_cache_validity: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            cache_in_memory: true,
            cache_in_disk: true,
            disk_cache_validity: Duration::from_secs(3600 * 24),
        }
    }
}

/// Per-request configuration.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub cache: CachePolicy,
    /// Optional transformation applied to every freshly decoded bitmap.
    pub processor: Option<Arc<dyn PostProcessor>>,
}

/// An immutable description of one image load.
#[derive(Debug, Clone)]
pub struct Request {
    key: RequestKey,
    uri: String,
    target: TargetSize,
    options: LoadOptions,
}

impl Request {
    /// Creates a request, deriving its key from the `uri`, the `target` size and the
    /// post-processor variant.
    pub fn new(uri: impl Into<String>, target: TargetSize, options: LoadOptions) -> Self {
        let uri = uri.into();
        let variant = options.processor.as_ref().map(|p| p.variant());
        let key = RequestKey::for_image(&uri, target, variant.as_deref());
        Self {
            key,
            uri,
            target,
            options,
        }
    }

    /// Replaces the derived key with an explicit one.
    pub fn with_key(mut self, key: impl Into<RequestKey>) -> Self {
        self.key = key.into();
        self
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn target(&self) -> TargetSize {
        self.target
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    pub fn cache_policy(&self) -> &CachePolicy {
        &self.options.cache
    }

    pub fn processor(&self) -> Option<&Arc<dyn PostProcessor>> {
        self.options.processor.as_ref()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.uri, self.key)
    }
}
