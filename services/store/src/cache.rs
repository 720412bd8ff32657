//! Layer-1 hot cache.
//!
//! Byte-bounded `lru::LruCache`. The cache holds the encrypted payload of
//! whole objects keyed by object id; it is never the only copy, so eviction
//! only drops bytes and never touches metadata.

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

/// Recency order lives in the `LruCache`; the byte bound is enforced here.
struct CacheState {
    entries: LruCache<String, Bytes>,
    used_bytes: u64,
}

impl CacheState {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            used_bytes: 0,
        }
    }

    fn remove(&mut self, key: &str) -> Option<Bytes> {
        let data = self.entries.pop(key)?;
        self.used_bytes -= data.len() as u64;
        Some(data)
    }
}

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheUsage {
    pub entries: usize,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
}

/// Bounded LRU cache of object bytes.
pub struct HotCache {
    capacity_bytes: u64,
    max_object_bytes: u64,
    state: Mutex<CacheState>,
}

impl HotCache {
    /// Create a cache holding at most `capacity_bytes`; objects above
    /// `object_fraction × capacity` are not admitted on the retrieve path.
    pub fn new(capacity_bytes: u64, object_fraction: f64) -> Self {
        let max_object_bytes = (capacity_bytes as f64 * object_fraction) as u64;
        Self {
            capacity_bytes,
            max_object_bytes,
            state: Mutex::new(CacheState::new()),
        }
    }

    /// Whether an object of this size may be cached opportunistically.
    pub fn is_eligible(&self, size_bytes: u64) -> bool {
        size_bytes <= self.max_object_bytes
    }

    /// Look up an entry, marking it most recently used.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.state.lock().entries.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains(key)
    }

    /// Mark an entry most recently used without reading it.
    pub fn touch(&self, key: &str) {
        self.state.lock().entries.promote(key);
    }

    /// Insert or replace an entry, evicting from the least recent end until the
    /// cache fits. Returns the evicted keys. Entries larger than the whole
    /// cache are rejected and nothing is evicted.
    pub fn insert(&self, key: impl Into<String>, data: Bytes) -> Vec<String> {
        let key = key.into();
        let size = data.len() as u64;
        if size > self.capacity_bytes {
            trace!(key = %key, size_bytes = size, "Entry larger than cache, not cached");
            return Vec::new();
        }

        let mut state = self.state.lock();
        state.remove(&key);

        let mut evicted = Vec::new();
        while state.used_bytes + size > self.capacity_bytes {
            let Some((victim, old)) = state.entries.pop_lru() else {
                break;
            };
            state.used_bytes -= old.len() as u64;
            evicted.push(victim);
        }

        state.used_bytes += size;
        state.entries.put(key, data);

        if !evicted.is_empty() {
            metrics::counter!("store.cache.evictions").increment(evicted.len() as u64);
        }
        evicted
    }

    pub fn remove(&self, key: &str) -> Option<Bytes> {
        self.state.lock().remove(key)
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.used_bytes = 0;
    }

    pub fn usage(&self) -> CacheUsage {
        let state = self.state.lock();
        CacheUsage {
            entries: state.entries.len(),
            used_bytes: state.used_bytes,
            capacity_bytes: self.capacity_bytes,
        }
    }

    /// Keys from least to most recently used.
    pub fn lru_order(&self) -> Vec<String> {
        // The LruCache iterates most recent first
        let state = self.state.lock();
        let mut keys: Vec<String> = state.entries.iter().map(|(k, _)| k.clone()).collect();
        keys.reverse();
        keys
    }
}
