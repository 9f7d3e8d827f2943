use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::types::TargetSize;

/// The identity of a request.
///
/// This is used both as the key of the in-memory cache and to share one lock between all
/// concurrent loads of the same image variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(Arc<str>);

impl RequestKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// Derives the key for loading `uri` scaled towards `target`.
    ///
    /// The `variant` of a post-processor is appended, as differently processed bitmaps
    /// of the same image must not share a memory cache entry.
    pub fn for_image(uri: &str, target: TargetSize, variant: Option<&str>) -> Self {
        let mut key = format!("{uri}_{target}");
        if let Some(variant) = variant {
            key.push('_');
            key.push_str(variant);
        }
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for RequestKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

/// The encoded identity of an image URI on disk.
///
/// Only the URI contributes to it: all size variants of one image share the same
/// downloaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiskKey {
    hash: [u8; 32],
}

impl DiskKey {
    pub fn for_uri(uri: &str) -> Self {
        Self {
            hash: Sha256::digest(uri.as_bytes()).into(),
        }
    }

    /// Returns the relative path for this key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `v$version/aa/bbccdd/eeff...`
    pub fn cache_path(&self, version: u32) -> String {
        let mut path = format!("v{version}/{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &self.hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }
}

impl fmt::Display for DiskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.hash {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}
