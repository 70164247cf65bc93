//! Bounded dedup cache
//!
//! A process-wide LRU of keys whose guarded side effect has already been
//! performed. Used to suppress redundant index-row writes (the composite
//! datapoints key embeds the block start, so one cache can be shared by
//! every block without collisions) and to back the name catalog
//! write-through caches.
//!
//! Eviction of a still-useful key is benign: the guarded write is an
//! idempotent overwrite, so a false miss only costs one extra put.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

/// A bounded LRU key set, safe for concurrent use
pub struct KeyCache {
    inner: Mutex<LruCache<String, ()>>,
}

impl KeyCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Whether `key` was recently seen; refreshes its recency on a hit
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().unwrap().get(key).is_some()
    }

    /// Record `key`, evicting the least-recently-used entry when full
    pub fn insert(&self, key: &str) {
        self.inner.lock().unwrap().put(key.to_string(), ());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
