//! Pattern-indexed cache: regex pattern → ordered list of matching URIs.
//!
//! Two independent sub-caches hold the descending and ascending orderings
//! of each pattern's result list. Membership changes pushed from the
//! control plane update every matching list in place: descending lists
//! take the URI at the head, ascending lists at the tail, deduplicated
//! either way.
//!
//! Fills from the upstream store are serialised behind a single lock, and
//! an in-flight counter sheds lookups entirely once a storm of misses
//! passes the overload threshold.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use regex::Regex;

use crate::mem_cache::{MemCache, MemCacheOptions};

/// One pattern whose list contains (or would match) a URI.
pub struct MatchInfo {
    /// The pattern key.
    pub pattern: String,
    /// Which sub-cache the list came from.
    pub desc: bool,
    /// The list as currently cached.
    pub list: Arc<Vec<String>>,
}

/// Releases the in-flight slot taken by [`GlobCache::begin_fill`].
pub struct FillPermit<'a> {
    counter: &'a AtomicI32,
}

impl Drop for FillPermit<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The two-ordering pattern cache.
pub struct GlobCache {
    desc: MemCache<Arc<Vec<String>>>,
    asc: MemCache<Arc<Vec<String>>>,
    /// Serialises upstream fills so a miss storm issues one RPC at a time.
    pub fill_lock: tokio::sync::Mutex<()>,
    inflight: AtomicI32,
    overload: i32,
}

impl GlobCache {
    /// Create both sub-caches with the given byte budget each.
    pub fn new(max_mem_size: usize, overload: i32) -> Self {
        let opts = || MemCacheOptions {
            max_mem_size,
            ttl: None,
            promote: false,
        };
        Self {
            desc: MemCache::new(opts()),
            asc: MemCache::new(opts()),
            fill_lock: tokio::sync::Mutex::new(()),
            inflight: AtomicI32::new(0),
            overload,
        }
    }

    /// The sub-cache for one ordering.
    pub fn cache(&self, desc: bool) -> &MemCache<Arc<Vec<String>>> {
        if desc {
            &self.desc
        } else {
            &self.asc
        }
    }

    /// Cached list for a pattern, if any.
    pub fn get(&self, desc: bool, pattern: &str) -> Option<Arc<Vec<String>>> {
        self.cache(desc).get(pattern)
    }

    /// Install a pattern's list.
    pub fn set(&self, desc: bool, pattern: &str, list: Vec<String>) {
        self.cache(desc).set(pattern, Arc::new(list));
    }

    /// Claim an in-flight fill slot. Returns `None` once the number of
    /// concurrent fills passes the overload threshold; the caller then
    /// serves an empty result instead of queueing on the upstream.
    pub fn begin_fill(&self) -> Option<FillPermit<'_>> {
        self.inflight.fetch_add(1, Ordering::Relaxed);
        let permit = FillPermit {
            counter: &self.inflight,
        };
        if self.inflight.load(Ordering::Relaxed) > self.overload {
            return None;
        }
        Some(permit)
    }

    /// Every cached pattern matching `uri`, with its current list.
    pub fn matches(&self, uri: &str) -> Vec<MatchInfo> {
        let mut results = Vec::new();
        for desc in [true, false] {
            for pattern in self.cache(desc).keys() {
                let matched = Regex::new(&pattern)
                    .map(|re| re.is_match(uri))
                    .unwrap_or(false);
                if matched {
                    if let Some(list) = self.cache(desc).get(&pattern) {
                        results.push(MatchInfo {
                            pattern,
                            desc,
                            list,
                        });
                    }
                }
            }
        }
        results
    }

    /// A member was created or updated: re-insert it into every matching
    /// list, deduplicated; descending lists put it first, ascending last.
    pub fn update_to_list(&self, uri: &str) {
        for m in self.matches(uri) {
            let mut list: Vec<String> = Vec::with_capacity(m.list.len() + 1);
            if m.desc {
                list.push(uri.to_string());
                list.extend(m.list.iter().filter(|u| *u != uri).cloned());
            } else {
                list.extend(m.list.iter().filter(|u| *u != uri).cloned());
                list.push(uri.to_string());
            }
            self.set(m.desc, &m.pattern, list);
        }
    }

    /// A member was deleted: drop it from every matching list.
    pub fn del_from_list(&self, uri: &str) {
        for m in self.matches(uri) {
            let list: Vec<String> = m.list.iter().filter(|u| *u != uri).cloned().collect();
            self.set(m.desc, &m.pattern, list);
        }
    }

    /// Drop both sub-caches.
    pub fn purge(&self) {
        self.desc.purge();
        self.asc.purge();
    }
}
