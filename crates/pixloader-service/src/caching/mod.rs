//! # Image caching infrastructure
//!
//! Downloading and decoding images is slow, so every loaded image goes through multiple layers
//! of caching. This module contains all of those layers, and the per-key locking which makes sure
//! that concurrent loads of the same image share the work.
//!
//! ## Cache Layers
//!
//! - An in-memory layer ([`MemoryCache`]) holding display-ready drawables, keyed by
//!   [`RequestKey`]. The key covers the URI, the target size and the post-processor variant.
//! - A file-system layer ([`DiskCache`]) holding the raw downloaded bytes, keyed by a hash of the
//!   URI alone ([`DiskKey`]). All size variants of an image share one file.
//!
//! A load goes through the following steps:
//! - First, it takes the lock for its [`RequestKey`] and checks the in-memory layer, which a
//!   concurrent load of the same key might have filled while it was waiting.
//! - On miss, it takes the lock for the [`DiskKey`] of the URI, shared with loads of other sizes
//!   of the same image.
//! - It then uses the file-system layer if the cache file exists and is younger than the
//!   validity of the request.
//! - Otherwise, it downloads the image, writing it into the file-system layer if enabled.
//! - The bytes are decoded, and the resulting drawable is put into the in-memory layer.
//!
//! A cache file that fails to decode is deleted, so the next load downloads it again.
//!
//! ### Metrics
//!
//! - `loader.access`: All loads.
//! - `loader.memory.hit`: Loads served by the in-memory layer.
//! - `loader.disk.hit`: Loads that decoded a valid file from the file-system layer.
//! - `loader.fetch`: Actual downloads.
//! - `loader.disk.corrupted`: Cache files removed because they failed to decode.
//! - `caches.size.files` / `caches.size.bytes`: Gauges emitted by [`cleanup`].
//!
//! ### Configuration
//!
//! The file-system layer is gated by the [`Config::cache_dir`](crate::config::Config::cache_dir)
//! option. Without it, images are downloaded directly after the in-memory layer.
//!
//! The `validity` option of the disk cache is the default time-to-live of a cache file, measured
//! from its `mtime`. The `max_unused_for` option is used by the `cleanup` command to evict files
//! entirely.

mod cache_key;
mod cleanup;
mod fs;
mod locks;
mod memory;

pub use cache_key::{DiskKey, RequestKey};
pub use cleanup::{CleanupStats, cleanup};
pub use fs::{DISK_CACHE_VERSION, DiskCache, is_valid_at};
pub use locks::{KeyLockGuard, LockRegistry};
pub use memory::{InMemoryCache, MemoryCache};
