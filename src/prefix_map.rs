//! Longest-prefix URI map used to dispatch proxy rules.
//!
//! Lookup walks the key backwards one `/`-delimited segment at a time, so
//! `http://a/b/c/d` falls back to `http://a/b/c`, then `http://a/b`, then
//! `http://a`.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Concurrent map from URI prefixes to values with longest-prefix lookup.
pub struct PrefixMap<V> {
    map: RwLock<HashMap<String, V>>,
}

impl<V: Clone> PrefixMap<V> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Find the value installed under the longest prefix of `key`, where a
    /// prefix boundary is a `/` separator.
    pub fn get(&self, key: &str) -> Option<V> {
        let map = self.map.read();
        let mut key = key;
        while !key.is_empty() {
            if let Some(val) = map.get(key) {
                return Some(val.clone());
            }
            match key.rfind('/') {
                Some(i) => key = &key[..i],
                None => return None,
            }
        }
        None
    }

    /// Install a rule under an exact prefix.
    pub fn set(&self, key: &str, value: V) {
        self.map.write().insert(key.to_string(), value);
        log::info!("update proxy rule: {}", key);
    }

    /// Remove the rule under an exact prefix, if any.
    pub fn del(&self, key: &str) -> bool {
        let removed = self.map.write().remove(key).is_some();
        if removed {
            log::info!("delete proxy rule: {}", key);
        }
        removed
    }

    /// Whether an exact prefix is installed.
    pub fn contains(&self, key: &str) -> bool {
        self.map.read().contains_key(key)
    }

    /// Number of installed rules.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Whether no rules are installed.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl<V: Clone> Default for PrefixMap<V> {
    fn default() -> Self {
        Self::new()
    }
}
