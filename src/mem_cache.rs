//! Byte-budgeted in-memory cache with optional TTL.
//!
//! One `MemCache` instance backs each of the caches in this service: the
//! file cache, the two glob sub-caches, the runtime memoisation cache and
//! the error-log buffer. Entries carry a byte weight; inserting past the
//! budget evicts entries from the cold end until the total is back under
//! it. Expiry is wall-clock and checked at access.
//!
//! Promotion on read is configurable and disabled for the production
//! caches, so the eviction order degrades to insertion order there.

use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

/// Byte weight of a cached value, used for budget accounting.
pub trait MemSize {
    /// Approximate number of heap bytes held by the value.
    fn mem_size(&self) -> usize;
}

/// Tuning knobs for a [`MemCache`].
#[derive(Debug, Clone)]
pub struct MemCacheOptions {
    /// Total byte budget across keys and values.
    pub max_mem_size: usize,
    /// Wall-clock expiry applied to every entry, if any.
    pub ttl: Option<Duration>,
    /// Whether a `get` moves the entry to the hot end.
    pub promote: bool,
}

impl Default for MemCacheOptions {
    fn default() -> Self {
        Self {
            max_mem_size: 2 * 1024 * 1024 * 1024,
            ttl: None,
            promote: false,
        }
    }
}

struct Entry<V> {
    value: V,
    weight: usize,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }
}

struct Inner<V> {
    map: LruCache<String, Entry<V>>,
    size: usize,
}

/// Bounded cache keyed by string, safe to share across tasks.
pub struct MemCache<V> {
    inner: Mutex<Inner<V>>,
    opts: MemCacheOptions,
}

impl<V: Clone + MemSize> MemCache<V> {
    /// Create a cache with the given options.
    pub fn new(opts: MemCacheOptions) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: LruCache::unbounded(),
                size: 0,
            }),
            opts,
        }
    }

    /// Look up a value, honouring TTL. Promotes the entry when the cache is
    /// configured to do so.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        if inner.map.peek(key).map(|e| e.is_expired()).unwrap_or(false) {
            self.remove_locked(&mut inner, key);
            return None;
        }
        if self.opts.promote {
            inner.map.get(key).map(|e| e.value.clone())
        } else {
            inner.map.peek(key).map(|e| e.value.clone())
        }
    }

    /// Look up a value without touching its position, still honouring TTL.
    pub fn peek(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        if inner.map.peek(key).map(|e| e.is_expired()).unwrap_or(false) {
            self.remove_locked(&mut inner, key);
            return None;
        }
        inner.map.peek(key).map(|e| e.value.clone())
    }

    /// Insert or replace a value, then evict from the cold end until the
    /// byte budget holds again. The entry just written survives eviction.
    pub fn set(&self, key: &str, value: V) {
        let weight = key.len() + value.mem_size();
        let mut inner = self.inner.lock();
        let expires_at = self.opts.ttl.map(|ttl| Instant::now() + ttl);
        if let Some(old) = inner.map.put(
            key.to_string(),
            Entry {
                value,
                weight,
                expires_at,
            },
        ) {
            inner.size -= old.weight;
        }
        inner.size += weight;

        while inner.size > self.opts.max_mem_size && inner.map.len() > 1 {
            if let Some((_, e)) = inner.map.pop_lru() {
                inner.size -= e.weight;
            } else {
                break;
            }
        }
    }

    /// Remove a key, returning its value if present.
    pub fn del(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        self.remove_locked(&mut inner, key)
    }

    fn remove_locked(&self, inner: &mut Inner<V>, key: &str) -> Option<V> {
        if let Some(e) = inner.map.pop(key) {
            inner.size -= e.weight;
            Some(e.value)
        } else {
            None
        }
    }

    fn sweep_expired(&self, inner: &mut Inner<V>) {
        let expired: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.remove_locked(inner, &key);
        }
    }

    /// Number of live entries.
    pub fn count(&self) -> usize {
        let mut inner = self.inner.lock();
        self.sweep_expired(&mut inner);
        inner.map.len()
    }

    /// Total accounted bytes.
    pub fn size(&self) -> usize {
        let mut inner = self.inner.lock();
        self.sweep_expired(&mut inner);
        inner.size
    }

    /// Snapshot of all live entries, hottest first.
    pub fn items(&self) -> Vec<(String, V)> {
        let mut inner = self.inner.lock();
        self.sweep_expired(&mut inner);
        inner
            .map
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Page `[left, right)` of the hottest-first entry listing.
    pub fn slice(&self, left: usize, right: usize) -> Vec<(String, V)> {
        let items = self.items();
        let right = right.min(items.len());
        let left = left.min(right);
        items[left..right].to_vec()
    }

    /// Snapshot of live keys, hottest first.
    pub fn keys(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        self.sweep_expired(&mut inner);
        inner.map.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Drop everything.
    pub fn purge(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.size = 0;
    }
}

impl MemSize for String {
    fn mem_size(&self) -> usize {
        self.len()
    }
}

impl MemSize for Vec<u8> {
    fn mem_size(&self) -> usize {
        self.len()
    }
}

impl<T: MemSize> MemSize for std::sync::Arc<T> {
    fn mem_size(&self) -> usize {
        self.as_ref().mem_size()
    }
}

impl MemSize for Vec<String> {
    fn mem_size(&self) -> usize {
        self.iter().map(|s| s.len() + 24).sum()
    }
}
