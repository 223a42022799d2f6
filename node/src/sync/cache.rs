//! Bounded recency set used for hash de-duplication.

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// Fixed-capacity set that evicts the least recently inserted key.
///
/// Lookups never refresh a key's position, so eviction order follows
/// insertion only.
#[derive(Debug)]
pub struct RecencyCache<K: Hash + Eq> {
    inner: Mutex<LruCache<K, ()>>,
}

impl<K: Hash + Eq> RecencyCache<K> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains(key)
    }

    pub fn insert(&self, key: K) {
        let mut inner = self.inner.lock();
        if !inner.contains(&key) {
            inner.put(key, ());
        }
    }

    /// Inserts `key` unless present. Returns `true` when it was inserted.
    pub fn check_and_insert(&self, key: K) -> bool {
        let mut inner = self.inner.lock();
        if inner.contains(&key) {
            return false;
        }
        inner.put(key, ());
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().cap().get()
    }
}
