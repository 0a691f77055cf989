//! Bounded buffer of recent script failures, served by `/log-list`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::mem_cache::{MemCache, MemCacheOptions, MemSize};
use crate::util;

const MAX_MEM_SIZE: usize = 10 * 1024 * 1024;

/// One logged request failure.
#[derive(Debug, Clone, Serialize)]
pub struct HttpLog {
    /// Full request URI.
    pub uri: String,
    /// Response status.
    pub status: u16,
    /// Error message.
    pub message: String,
    /// When it happened.
    pub time: DateTime<Utc>,
}

impl MemSize for HttpLog {
    fn mem_size(&self) -> usize {
        self.uri.len() + self.message.len() + 64
    }
}

/// The failure buffer, keyed by a monotonically increasing base36 index.
pub struct LogCache {
    cache: MemCache<Arc<HttpLog>>,
    index: AtomicU64,
}

impl LogCache {
    /// Buffer with the production budget.
    pub fn new() -> Self {
        Self {
            cache: MemCache::new(MemCacheOptions {
                max_mem_size: MAX_MEM_SIZE,
                ttl: None,
                promote: false,
            }),
            index: AtomicU64::new(0),
        }
    }

    /// Record a failure.
    pub fn push(&self, uri: &str, status: u16, message: &str) {
        let index = self.index.fetch_add(1, Ordering::Relaxed) + 1;
        self.cache.set(
            &util::to_base36(index),
            Arc::new(HttpLog {
                uri: uri.to_string(),
                status,
                message: message.to_string(),
                time: Utc::now(),
            }),
        );
    }

    /// Number of retained entries.
    pub fn count(&self) -> usize {
        self.cache.count()
    }

    /// Page `[left, right)` of retained entries, newest first.
    pub fn slice(&self, left: usize, right: usize) -> Vec<Arc<HttpLog>> {
        self.cache
            .slice(left, right)
            .into_iter()
            .map(|(_, v)| v)
            .collect()
    }
}

impl Default for LogCache {
    fn default() -> Self {
        Self::new()
    }
}
