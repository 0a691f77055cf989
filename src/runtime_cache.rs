//! Memoisation cache for script values.
//!
//! Entries are keyed by `(owner URI, user key)` and declare the URI
//! patterns they depend on. Invalidating a URI drops every entry whose
//! declared dependencies match it, either as a regex or as the literal
//! string.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;

use crate::mem_cache::{MemCache, MemCacheOptions, MemSize};
use crate::script::value::{value_mem_size, Value};

const MAX_MEM_SIZE: usize = 200 * 1024 * 1024;
const TTL: Duration = Duration::from_secs(600);

/// A memoised value with its dependency patterns.
pub struct RuntimeEntry {
    /// URI of the script that created the entry.
    pub owner: String,
    /// The memoised value.
    pub value: Value,
    /// Regex patterns (or literal URIs) the value depends on.
    pub deps: Vec<String>,
}

impl MemSize for RuntimeEntry {
    fn mem_size(&self) -> usize {
        self.owner.len()
            + value_mem_size(&self.value)
            + self.deps.iter().map(|d| d.len() + 24).sum::<usize>()
    }
}

/// The memoisation cache. Mutators serialise on a dedicated lock; readers
/// only take the underlying cache's own lock.
pub struct RuntimeCache {
    cache: MemCache<Arc<RuntimeEntry>>,
    write_lock: Mutex<()>,
}

impl RuntimeCache {
    /// Cache with the production budget and TTL.
    pub fn new() -> Self {
        Self {
            cache: MemCache::new(MemCacheOptions {
                max_mem_size: MAX_MEM_SIZE,
                ttl: Some(TTL),
                promote: false,
            }),
            write_lock: Mutex::new(()),
        }
    }

    // Owner URIs never contain NUL, so the join point stays unambiguous
    // even when the script-supplied key contains spaces.
    fn entry_key(owner: &str, key: &str) -> String {
        format!("{}\u{0}{}", owner, key)
    }

    /// Memoised value for `(owner, key)`, detached from the cached copy.
    pub fn get(&self, owner: &str, key: &str) -> Option<Value> {
        self.cache
            .get(&Self::entry_key(owner, key))
            .map(|e| e.value.deep_clone())
    }

    /// Store a memoised value with its dependency patterns.
    pub fn set(&self, owner: &str, key: &str, value: &Value, deps: Vec<String>) {
        let _guard = self.write_lock.lock();
        self.cache.set(
            &Self::entry_key(owner, key),
            Arc::new(RuntimeEntry {
                owner: owner.to_string(),
                value: value.deep_clone(),
                deps,
            }),
        );
    }

    /// Drop every entry depending on `uri`.
    pub fn flush(&self, uri: &str) {
        let _guard = self.write_lock.lock();
        for (key, entry) in self.cache.items() {
            let hit = entry.deps.iter().any(|dep| {
                let matched = Regex::new(dep).map(|re| re.is_match(uri)).unwrap_or(false);
                matched || dep == uri
            });
            if hit {
                self.cache.del(&key);
            }
        }
    }

    /// Number of live entries.
    pub fn count(&self) -> usize {
        self.cache.count()
    }

    /// Drop everything.
    pub fn purge(&self) {
        let _guard = self.write_lock.lock();
        self.cache.purge();
    }
}

impl Default for RuntimeCache {
    fn default() -> Self {
        Self::new()
    }
}
