//! Filter result cache

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Filter cache entry
#[derive(Debug, Clone)]
pub struct FilterCacheEntry<V> {
    pub value: V,
    pub digest: String,
    pub cached_at: u64,
}

/// In-memory cache keyed by a filter-set digest
pub struct FilterCache<V> {
    entries: RwLock<HashMap<String, FilterCacheEntry<V>>>,
    capacity: usize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> FilterCache<V> {
    /// Create a new cache; capacity 0 disables caching
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get a cached value
    pub fn get(&self, digest: &str) -> Option<V> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entries.get(digest) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a value
    pub fn insert(&self, digest: String, value: V) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        // Evict oldest if at capacity
        if entries.len() >= self.capacity && !entries.contains_key(&digest) {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.cached_at)
                .map(|(digest, _)| digest.clone())
            {
                entries.remove(&oldest);
            }
        }

        let entry = FilterCacheEntry {
            value,
            digest: digest.clone(),
            cached_at: self.clock.fetch_add(1, Ordering::Relaxed),
        };
        entries.insert(digest, entry);
    }

    /// Get the cached value or compute and store it
    pub fn get_or_insert_with(&self, digest: &str, compute: impl FnOnce() -> V) -> V {
        if let Some(value) = self.get(digest) {
            return value;
        }
        let value = compute();
        self.insert(digest.to_string(), value.clone());
        value
    }

    /// Clear the cache
    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    /// Get cache size
    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` since creation
    pub fn hit_stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
