//! The request coordinator.
//!
//! [`ImageLoader::load`] runs the whole pipeline for one [`Request`] while holding the lock of
//! its key: check the memory cache, resolve a byte source from disk or network, decode and
//! post-process it, and put the resulting drawable into the memory cache. A cache file that
//! fails to decode is deleted before the lock is released.
//!
//! Loads of other sizes of the same image share its disk cache file, so everything between
//! resolving the byte source and deleting a corrupted file additionally holds the lock of the
//! [`DiskKey`].

use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;

use crate::caching::{DiskCache, DiskKey, InMemoryCache, LockRegistry, MemoryCache};
use crate::config::Config;
use crate::decode::{Bitmap, DecodeStage, Decoder, RasterDecoder};
use crate::drawable::{DrawableRef, DrawableWrapper};
use crate::fetch::{DownloadService, FetchError, Fetcher};
use crate::source::{ByteSource, SourceSelector};
use crate::types::{LoadOptions, Request, TargetSize};
use crate::utils::defer::defer;

pub use crate::source::{LoadedFrom, SourceKind};

/// A successfully loaded image.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub drawable: DrawableRef,
    /// The layer the drawable came from.
    pub from: LoadedFrom,
}

/// Why an image could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// The image does not exist at its source.
    #[error("image not found")]
    NotFound,
    /// The image could not be fetched.
    #[error("failed to fetch image: {0}")]
    Fetch(FetchError),
    /// The image bytes could not be decoded into a usable bitmap.
    #[error("failed to decode image from {kind}")]
    Decode { kind: SourceKind },
    /// An unexpected failure, like a panic while decoding.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<FetchError> for LoadError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::NotFound => Self::NotFound,
            error => Self::Fetch(error),
        }
    }
}

pub type LoadResult = Result<Loaded, LoadError>;

/// Loads images through the memory cache, the disk cache and the network.
///
/// Concurrent loads of the same [`RequestKey`](crate::caching::RequestKey) are serialized, so
/// only the first of them does the actual work, and the others are served from the memory cache.
#[derive(Debug)]
pub struct ImageLoader {
    memory: Arc<dyn MemoryCache>,
    locks: LockRegistry,
    disk_locks: LockRegistry<DiskKey>,
    selector: SourceSelector,
    stage: DecodeStage,
    wrapper: Arc<DrawableWrapper>,
    default_options: LoadOptions,
}

impl ImageLoader {
    pub fn new(
        config: &Config,
        fetcher: Arc<dyn Fetcher>,
        decoder: Arc<dyn Decoder>,
    ) -> io::Result<Self> {
        let disk = DiskCache::from_config(config)?;
        if let Some(disk) = &disk {
            tracing::debug!(path = %disk.cache_dir().display(), "Using disk cache");
        }

        Ok(Self {
            memory: Arc::new(InMemoryCache::new(config.caches.in_memory.capacity)),
            locks: LockRegistry::new(),
            disk_locks: LockRegistry::new(),
            selector: SourceSelector::new(disk, fetcher, config.max_download_timeout),
            stage: DecodeStage::new(decoder),
            wrapper: Arc::new(DrawableWrapper::for_tracking(config.bitmap_tracking)),
            default_options: config.default_options(),
        })
    }

    /// Creates a loader with the default [`DownloadService`] and [`RasterDecoder`].
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let fetcher = Arc::new(DownloadService::new(config)?);
        Ok(Self::new(config, fetcher, Arc::new(RasterDecoder))?)
    }

    /// Replaces the default [`InMemoryCache`].
    pub fn with_memory_cache(mut self, memory: Arc<dyn MemoryCache>) -> Self {
        self.memory = memory;
        self
    }

    pub fn memory_cache(&self) -> &Arc<dyn MemoryCache> {
        &self.memory
    }

    pub fn lock_registry(&self) -> &LockRegistry {
        &self.locks
    }

    /// The locks shared by all size variants of one disk cache file.
    pub fn disk_lock_registry(&self) -> &LockRegistry<DiskKey> {
        &self.disk_locks
    }

    pub fn disk_cache(&self) -> Option<&DiskCache> {
        self.selector.disk_cache()
    }

    /// Creates a request for `uri` with the configured default options.
    pub fn request(&self, uri: impl Into<String>, target: TargetSize) -> Request {
        Request::new(uri, target, self.default_options.clone())
    }

    /// Loads the image of `request`.
    pub async fn load(&self, request: &Request) -> LoadResult {
        metric!(counter("loader.access") += 1);
        let start = Instant::now();
        let _timer = defer(move || metric!(timer("loader.load") = start.elapsed()));

        let _guard = self.locks.acquire(request.key()).await;

        match AssertUnwindSafe(self.load_locked(request))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(&*panic);
                tracing::error!(%request, "Loading panicked: {message}");
                Err(LoadError::Internal(message))
            }
        }
    }

    /// The part of [`load`](Self::load) that runs while holding the request's lock.
    async fn load_locked(&self, request: &Request) -> LoadResult {
        let key = request.key();

        // A concurrent load of the same key might have completed while we were waiting.
        if let Some(drawable) = self.memory.get(key) {
            metric!(counter("loader.memory.hit") += 1);
            tracing::trace!(%key, "Using drawable from memory cache");
            return Ok(Loaded {
                drawable,
                from: LoadedFrom::Memory,
            });
        }

        // Other sizes of the same image read, rewrite and delete the same cache file.
        let _disk_guard = match self.selector.disk_key(request) {
            Some(disk_key) => Some(self.disk_locks.acquire(&disk_key).await),
            None => None,
        };

        let resolved = self.selector.resolve(request).await;
        let source = match resolved.source {
            Ok(source) => source,
            Err(e) => {
                // The cache file was not written by this fetch, so it is left alone.
                tracing::debug!(error = &e as &dyn std::error::Error, %request, "Failed to fetch image");
                return Err(e.into());
            }
        };

        let bitmap = match self.decode(request, source.clone()).await? {
            Some(bitmap) => bitmap,
            None => {
                metric!(counter("loader.decode.failure") += 1);
                tracing::debug!(%request, %source, "Failed to decode image");
                self.remove_corrupted(&source);
                return Err(LoadError::Decode {
                    kind: source.kind(),
                });
            }
        };

        let drawable = self.wrapper.wrap(bitmap);
        if request.cache_policy().cache_in_memory {
            self.memory.put(key.clone(), drawable.clone());
        }

        Ok(Loaded {
            drawable,
            from: resolved.from,
        })
    }

    /// Loads the image of `request`, logging any failure.
    pub async fn load_drawable(&self, request: &Request) -> Option<DrawableRef> {
        match self.load(request).await {
            Ok(loaded) => Some(loaded.drawable),
            Err(LoadError::NotFound) => {
                tracing::debug!(%request, "Image not found");
                None
            }
            Err(e) => {
                tracing::warn!(error = &e as &dyn std::error::Error, %request, "Failed to load image");
                None
            }
        }
    }

    /// Decodes and post-processes `source` on the blocking thread pool.
    async fn decode(
        &self,
        request: &Request,
        source: ByteSource,
    ) -> Result<Option<Bitmap>, LoadError> {
        let stage = self.stage.clone();
        let target = request.target();
        let processor = request.processor().cloned();

        tokio::task::spawn_blocking(move || stage.run(&source, target, processor.as_deref()))
            .await
            .map_err(|e| {
                tracing::error!(error = &e as &dyn std::error::Error, %request, "Decoding panicked");
                LoadError::Internal(e.to_string())
            })
    }

    /// Deletes the cache file backing `source`, so the next load fetches it again.
    fn remove_corrupted(&self, source: &ByteSource) {
        if let (Some(path), Some(disk)) = (source.cache_file(), self.disk_cache()) {
            disk.remove_corrupted(path);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use filetime::FileTime;

    use crate::decode::PostProcessor;
    use crate::drawable::BitmapTracking;
    use crate::fetch::FetchOutcome;
    use crate::types::CachePolicy;

    use super::*;

    const URI: &str = "https://example.com/cat.png";

    #[derive(Debug)]
    enum Respond {
        Png(u32, u32),
        Garbage,
        Fail(FetchError),
        Panic,
    }

    /// Serves a generated PNG (or an error), counting its calls.
    #[derive(Debug)]
    struct MockFetcher {
        respond: Respond,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl MockFetcher {
        fn png(width: u32, height: u32) -> Arc<Self> {
            Self::new(Respond::Png(width, height), Duration::ZERO)
        }

        fn new(respond: Respond, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                respond,
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch(
            &self,
            _request: &Request,
            cache_file: Option<&Path>,
        ) -> Result<FetchOutcome, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;

            let png = match &self.respond {
                Respond::Png(width, height) => pixloader_test::png_fixture(*width, *height),
                Respond::Garbage => b"definitely not a png".to_vec(),
                Respond::Fail(error) => return Err(error.clone()),
                Respond::Panic => panic!("fetcher exploded"),
            };
            match cache_file {
                Some(path) => {
                    std::fs::create_dir_all(path.parent().unwrap())?;
                    std::fs::write(path, png)?;
                    Ok(FetchOutcome::File(path.to_owned()))
                }
                None => Ok(FetchOutcome::Bytes(png.into())),
            }
        }
    }

    /// Inverts the bitmap, remembering the original input.
    #[derive(Debug, Default)]
    struct Invert {
        input: Mutex<Option<Bitmap>>,
    }

    impl PostProcessor for Invert {
        fn process(&self, bitmap: &Bitmap) -> Bitmap {
            *self.input.lock().unwrap() = Some(bitmap.clone());
            let inverted = bitmap
                .with_pixels(|pixels| {
                    let mut pixels = pixels.clone();
                    image::imageops::invert(&mut pixels);
                    pixels
                })
                .unwrap();
            Bitmap::new(inverted)
        }

        fn variant(&self) -> std::borrow::Cow<'_, str> {
            "invert".into()
        }
    }

    #[derive(Debug)]
    struct Explode;

    impl PostProcessor for Explode {
        fn process(&self, _bitmap: &Bitmap) -> Bitmap {
            panic!("post-processor exploded");
        }
    }

    /// Sleeps between reading and decoding when scaling towards 100x100.
    #[derive(Debug)]
    struct SlowDecoder;

    impl Decoder for SlowDecoder {
        fn decode(&self, source: &ByteSource, target: TargetSize) -> Option<Bitmap> {
            let bytes = source.read().ok()?;
            if target == TargetSize::new(100, 100) {
                std::thread::sleep(Duration::from_millis(300));
            }
            RasterDecoder.decode(&ByteSource::Memory(bytes), target)
        }
    }

    /// Never keeps anything.
    #[derive(Debug)]
    struct NoMemory;

    impl MemoryCache for NoMemory {
        fn get(&self, _key: &crate::caching::RequestKey) -> Option<DrawableRef> {
            None
        }

        fn put(&self, _key: crate::caching::RequestKey, _drawable: DrawableRef) {}

        fn remove(&self, _key: &crate::caching::RequestKey) {}

        fn entry_count(&self) -> u64 {
            0
        }
    }

    fn config(cache_dir: Option<&Path>) -> Config {
        Config {
            cache_dir: cache_dir.map(Path::to_path_buf),
            ..Default::default()
        }
    }

    fn loader(config: &Config, fetcher: Arc<MockFetcher>) -> ImageLoader {
        ImageLoader::new(config, fetcher, Arc::new(RasterDecoder)).unwrap()
    }

    fn write_cache_file(loader: &ImageLoader, contents: &[u8]) -> std::path::PathBuf {
        let path = loader.disk_cache().unwrap().path_for(URI);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn test_memory_hit() {
        pixloader_test::setup();
        let fetcher = MockFetcher::png(8, 8);
        let loader = loader(&config(None), fetcher.clone());

        let request = loader
            .request(URI, TargetSize::new(100, 100))
            .with_key("img:42:100x100");
        let drawable = DrawableWrapper::for_tracking(BitmapTracking::Standard)
            .wrap(Bitmap::solid(4, 4, [0, 0, 0, 255]));
        loader
            .memory_cache()
            .put(request.key().clone(), drawable.clone());

        let loaded = loader.load(&request).await.unwrap();
        assert_eq!(loaded.from, LoadedFrom::Memory);
        assert!(Arc::ptr_eq(&loaded.drawable, &drawable));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_disk_hit() {
        pixloader_test::setup();
        let cache_dir = pixloader_test::tempdir();
        let fetcher = MockFetcher::png(8, 8);
        let loader = loader(&config(Some(cache_dir.path())), fetcher.clone());
        write_cache_file(&loader, &pixloader_test::png_fixture(16, 16));

        let request = loader.request(URI, TargetSize::UNBOUNDED);
        let loaded = loader.load(&request).await.unwrap();

        assert_eq!(loaded.from, LoadedFrom::Disk);
        assert_eq!(loaded.drawable.bitmap().width(), 16);
        assert_eq!(fetcher.calls(), 0);
        assert!(loader.memory_cache().get(request.key()).is_some());
    }

    #[tokio::test]
    async fn test_cold_miss() {
        pixloader_test::setup();
        let cache_dir = pixloader_test::tempdir();
        let fetcher = MockFetcher::png(400, 200);
        let loader = loader(&config(Some(cache_dir.path())), fetcher.clone());

        let request = loader.request(URI, TargetSize::new(100, 100));
        let loaded = loader.load(&request).await.unwrap();

        assert_eq!(loaded.from, LoadedFrom::Network);
        assert_eq!(
            (loaded.drawable.bitmap().width(), loaded.drawable.bitmap().height()),
            (200, 100)
        );
        assert_eq!(fetcher.calls(), 1);
        assert!(loader.disk_cache().unwrap().path_for(URI).is_file());

        // cache-aside: the next load does not go to the source selector
        let loaded = loader.load(&request).await.unwrap();
        assert_eq!(loaded.from, LoadedFrom::Memory);
        assert_eq!(fetcher.calls(), 1);

        // another size of the same image is decoded from the shared cache file
        let request = loader.request(URI, TargetSize::UNBOUNDED);
        let loaded = loader.load(&request).await.unwrap();
        assert_eq!(loaded.from, LoadedFrom::Disk);
        assert_eq!(loaded.drawable.bitmap().width(), 400);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_corrupted_cache_file() {
        pixloader_test::setup();
        let cache_dir = pixloader_test::tempdir();
        let fetcher = MockFetcher::png(8, 8);
        let loader = loader(&config(Some(cache_dir.path())), fetcher.clone());
        let path = write_cache_file(&loader, b"definitely not a png");

        let request = loader.request(URI, TargetSize::UNBOUNDED);
        let result = loader.load(&request).await;

        assert_eq!(
            result.unwrap_err(),
            LoadError::Decode {
                kind: SourceKind::File
            }
        );
        assert!(!path.exists());
        assert_eq!(fetcher.calls(), 0);
        assert!(loader.memory_cache().get(request.key()).is_none());

        // the next load fetches the image again
        let loaded = loader.load(&request).await.unwrap();
        assert_eq!(loaded.from, LoadedFrom::Network);
        assert_eq!(fetcher.calls(), 1);
        assert!(path.is_file());
    }

    #[tokio::test]
    async fn test_garbage_in_memory() {
        pixloader_test::setup();
        let fetcher = MockFetcher::new(Respond::Garbage, Duration::ZERO);
        let loader = loader(&config(None), fetcher.clone());

        let request = loader.request(URI, TargetSize::UNBOUNDED);
        let result = loader.load(&request).await;
        assert_eq!(
            result.unwrap_err(),
            LoadError::Decode {
                kind: SourceKind::Memory
            }
        );
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_cache_file() {
        pixloader_test::setup();
        let cache_dir = pixloader_test::tempdir();
        let fetcher = MockFetcher::new(
            Respond::Fail(FetchError::Download("503 Service Unavailable".into())),
            Duration::ZERO,
        );
        let loader = loader(&config(Some(cache_dir.path())), fetcher.clone());

        // a stale file, so it is not used
        let path = write_cache_file(&loader, &pixloader_test::png_fixture(8, 8));
        let mtime = std::time::SystemTime::now() - Duration::from_secs(3 * 24 * 3600);
        filetime::set_file_mtime(&path, FileTime::from_system_time(mtime)).unwrap();

        let request = loader.request(URI, TargetSize::UNBOUNDED);
        let result = loader.load(&request).await;

        assert_eq!(
            result.unwrap_err(),
            LoadError::Fetch(FetchError::Download("503 Service Unavailable".into()))
        );
        assert_eq!(fetcher.calls(), 1);
        assert!(path.is_file());
    }

    #[tokio::test]
    async fn test_not_found() {
        pixloader_test::setup();
        let fetcher = MockFetcher::new(Respond::Fail(FetchError::NotFound), Duration::ZERO);
        let loader = loader(&config(None), fetcher.clone());

        let request = loader.request(URI, TargetSize::UNBOUNDED);
        assert_eq!(loader.load(&request).await.unwrap_err(), LoadError::NotFound);
        assert!(loader.load_drawable(&request).await.is_none());
        assert!(loader.lock_registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates() {
        pixloader_test::setup();
        let cache_dir = pixloader_test::tempdir();
        let fetcher = MockFetcher::new(Respond::Png(8, 8), Duration::from_millis(50));
        let loader = Arc::new(loader(&config(Some(cache_dir.path())), fetcher.clone()));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let loader = loader.clone();
                tokio::spawn(async move {
                    let request = loader.request(URI, TargetSize::UNBOUNDED);
                    loader.load(&request).await
                })
            })
            .collect();

        let drawables: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|result| result.unwrap().unwrap().drawable)
            .collect();

        assert_eq!(fetcher.calls(), 1);
        assert!(drawables.iter().all(|d| Arc::ptr_eq(d, &drawables[0])));
        assert!(loader.lock_registry().is_empty());
    }

    #[tokio::test]
    async fn test_post_processor_releases_original() {
        pixloader_test::setup();
        let fetcher = MockFetcher::png(8, 8);
        let loader = loader(&config(None), fetcher.clone());

        let processor = Arc::new(Invert::default());
        let options = LoadOptions {
            processor: Some(processor.clone()),
            ..Default::default()
        };
        let request = Request::new(URI, TargetSize::UNBOUNDED, options);
        assert!(request.key().as_str().ends_with("_invert"));

        let loaded = loader.load(&request).await.unwrap();

        let input = processor.input.lock().unwrap().take().unwrap();
        assert!(input.is_recycled());
        assert!(!loaded.drawable.bitmap().is_recycled());
        assert!(!loaded.drawable.bitmap().ptr_eq(&input));
    }

    #[tokio::test]
    async fn test_panic_releases_lock() {
        pixloader_test::setup();
        let fetcher = MockFetcher::png(8, 8);
        let loader = loader(&config(None), fetcher.clone());

        let options = LoadOptions {
            processor: Some(Arc::new(Explode)),
            ..Default::default()
        };
        let request = Request::new(URI, TargetSize::UNBOUNDED, options).with_key("exploding");
        let result = loader.load(&request).await;

        assert!(matches!(result, Err(LoadError::Internal(_))));
        assert!(loader.lock_registry().is_empty());

        // the same key can be loaded again
        let request = loader
            .request(URI, TargetSize::UNBOUNDED)
            .with_key("exploding");
        let result = tokio::time::timeout(Duration::from_secs(5), loader.load(&request)).await;
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_skip_memory_cache() {
        pixloader_test::setup();
        let fetcher = MockFetcher::png(8, 8);
        let loader = loader(&config(None), fetcher.clone());

        let options = LoadOptions {
            cache: CachePolicy {
                cache_in_memory: false,
                ..Default::default()
            },
            processor: None,
        };
        let request = Request::new(URI, TargetSize::UNBOUNDED, options);
        loader.load(&request).await.unwrap();
        loader.load(&request).await.unwrap();

        assert_eq!(fetcher.calls(), 2);
        assert!(loader.memory_cache().get(request.key()).is_none());
    }

    #[tokio::test]
    async fn test_recycling_drawables() {
        pixloader_test::setup();
        let config = Config {
            bitmap_tracking: BitmapTracking::RecyclingAware,
            ..Default::default()
        };
        let loader = loader(&config, MockFetcher::png(8, 8));

        let request = loader.request(URI, TargetSize::UNBOUNDED);
        let drawable = loader.load_drawable(&request).await.unwrap();

        drawable.set_displayed(true);
        drawable.set_displayed(false);
        // still held by the memory cache
        assert!(!drawable.bitmap().is_recycled());
    }

    #[tokio::test]
    async fn test_load_over_http() {
        pixloader_test::setup();
        let server = pixloader_test::ImageServer::new();
        let cache_dir = pixloader_test::tempdir();
        let config = Config {
            cache_dir: Some(cache_dir.path().to_path_buf()),
            connect_to_reserved_ips: true,
            ..Default::default()
        };
        let loader = ImageLoader::from_config(&config).unwrap();

        let url = server.url("images/cat-64x32.png");
        let request = loader.request(url.as_str(), TargetSize::new(16, 16));
        let loaded = loader.load(&request).await.unwrap();
        assert_eq!(loaded.from, LoadedFrom::Network);
        assert_eq!(
            (loaded.drawable.bitmap().width(), loaded.drawable.bitmap().height()),
            (32, 16)
        );

        // a fresh loader with the same cache dir uses the disk cache
        let loader = ImageLoader::from_config(&config).unwrap();
        let loaded = loader.load(&request).await.unwrap();
        assert_eq!(loaded.from, LoadedFrom::Disk);

        assert_eq!(server.hits("/images/cat-64x32.png"), 1);

        let url = server.url("garbage/cat.png");
        let request = loader.request(url.as_str(), TargetSize::UNBOUNDED);
        let result = loader.load(&request).await;
        assert_eq!(
            result.unwrap_err(),
            LoadError::Decode {
                kind: SourceKind::File
            }
        );
        assert!(!loader.disk_cache().unwrap().path_for(url.as_str()).exists());
    }

    #[tokio::test]
    async fn test_fetcher_panic_is_absorbed() {
        pixloader_test::setup();
        let cache_dir = pixloader_test::tempdir();
        let fetcher = MockFetcher::new(Respond::Panic, Duration::ZERO);
        let loader = Arc::new(loader(&config(Some(cache_dir.path())), fetcher.clone()));

        let request = loader.request(URI, TargetSize::UNBOUNDED);
        let result = loader.load(&request).await;
        assert_eq!(
            result.unwrap_err(),
            LoadError::Internal("fetcher exploded".into())
        );
        assert!(loader.lock_registry().is_empty());
        assert!(loader.disk_lock_registry().is_empty());

        // the caller's task does not panic either
        let task = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.load_drawable(&request).await })
        };
        assert!(task.await.unwrap().is_none());
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sizes_share_cache_file() {
        pixloader_test::setup();
        let cache_dir = pixloader_test::tempdir();
        let fetcher = MockFetcher::png(8, 8);
        let loader = ImageLoader::new(
            &config(Some(cache_dir.path())),
            fetcher.clone(),
            Arc::new(SlowDecoder),
        )
        .unwrap();
        let path = write_cache_file(&loader, b"definitely not a png");

        // `small` reads the corrupted file and takes a while to notice.
        let small = loader.request(URI, TargetSize::new(100, 100));
        // `full` always refetches into the same file.
        let options = LoadOptions {
            cache: CachePolicy {
                disk_cache_validity: Duration::ZERO,
                ..Default::default()
            },
            processor: None,
        };
        let full = Request::new(URI, TargetSize::UNBOUNDED, options);

        let (small_result, full_result) = tokio::join!(loader.load(&small), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            loader.load(&full).await
        });

        assert_eq!(
            small_result.unwrap_err(),
            LoadError::Decode {
                kind: SourceKind::File
            }
        );
        let loaded = full_result.unwrap();
        assert_eq!(loaded.from, LoadedFrom::Network);
        assert_eq!(fetcher.calls(), 1);

        // the freshly fetched file survives the cleanup of the corrupted one
        assert!(path.is_file());
        assert!(loader.disk_lock_registry().is_empty());
    }

    #[tokio::test]
    async fn test_with_memory_cache() {
        pixloader_test::setup();
        let fetcher = MockFetcher::png(8, 8);
        let loader = loader(&config(None), fetcher.clone()).with_memory_cache(Arc::new(NoMemory));

        let request = loader.request(URI, TargetSize::UNBOUNDED);
        assert_eq!(loader.load(&request).await.unwrap().from, LoadedFrom::Network);
        assert_eq!(loader.load(&request).await.unwrap().from, LoadedFrom::Network);
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(loader.memory_cache().entry_count(), 0);
    }
}
