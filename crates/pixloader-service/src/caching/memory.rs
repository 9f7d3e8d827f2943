use std::fmt;

use moka::notification::RemovalCause;

use crate::drawable::DrawableRef;

use super::RequestKey;

/// A thread-safe key → drawable cache.
///
/// The eviction policy is up to the implementation. Implementations should tell drawables
/// when they enter and leave the cache via [`Drawable::set_cached`](crate::drawable::Drawable::set_cached).
pub trait MemoryCache: fmt::Debug + Send + Sync {
    fn get(&self, key: &RequestKey) -> Option<DrawableRef>;

    fn put(&self, key: RequestKey, drawable: DrawableRef);

    fn remove(&self, key: &RequestKey);

    /// An approximation of the number of cached drawables.
    fn entry_count(&self) -> u64;
}

/// The default [`MemoryCache`], a size-bounded [`moka`] cache weighted by decoded bitmap size.
pub struct InMemoryCache {
    cache: moka::sync::Cache<RequestKey, DrawableRef>,
}

impl fmt::Debug for InMemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCache")
            .field("entries", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .finish()
    }
}

impl InMemoryCache {
    /// Creates a cache holding up to `capacity` bytes of decoded pixels.
    pub fn new(capacity: u64) -> Self {
        let cache = moka::sync::Cache::builder()
            .name("drawables")
            .max_capacity(capacity)
            // NOTE: we count the key to the weight as well
            .weigher(|k: &RequestKey, v: &DrawableRef| {
                let key_size = k.as_str().len() as u32;
                v.weight().saturating_add(key_size)
            })
            .eviction_listener(
                |key: std::sync::Arc<RequestKey>, drawable: DrawableRef, cause: RemovalCause| {
                    tracing::trace!(%key, ?cause, "Drawable left the memory cache");
                    drawable.set_cached(false);
                },
            )
            .build();

        Self { cache }
    }
}

impl MemoryCache for InMemoryCache {
    fn get(&self, key: &RequestKey) -> Option<DrawableRef> {
        self.cache.get(key)
    }

    fn put(&self, key: RequestKey, drawable: DrawableRef) {
        drawable.set_cached(true);
        self.cache.insert(key, drawable);
    }

    fn remove(&self, key: &RequestKey) {
        self.cache.invalidate(key);
    }

    fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::decode::Bitmap;
    use crate::drawable::{BitmapTracking, DrawableWrapper};

    use super::*;

    #[test]
    fn test_put_get_remove() {
        let cache = InMemoryCache::new(1024 * 1024);
        let wrapper = DrawableWrapper::for_tracking(BitmapTracking::Standard);
        let key = RequestKey::from("img:42:100x100");

        assert!(cache.get(&key).is_none());

        let drawable = wrapper.wrap(Bitmap::solid(4, 4, [255, 0, 0, 255]));
        cache.put(key.clone(), drawable.clone());

        let cached = cache.get(&key).unwrap();
        assert!(Arc::ptr_eq(&cached, &drawable));
        assert_eq!(cache.entry_count(), 1);

        cache.remove(&key);
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_recycles_after_eviction() {
        let cache = InMemoryCache::new(1024 * 1024);
        let wrapper = DrawableWrapper::for_tracking(BitmapTracking::RecyclingAware);
        let key = RequestKey::from("img:42:100x100");

        let drawable = wrapper.wrap(Bitmap::solid(4, 4, [0, 255, 0, 255]));
        cache.put(key.clone(), drawable.clone());

        drawable.set_displayed(true);
        drawable.set_displayed(false);
        // still referenced by the cache
        assert!(!drawable.bitmap().is_recycled());

        cache.remove(&key);
        cache.cache.run_pending_tasks();
        assert!(drawable.bitmap().is_recycled());
    }
}
