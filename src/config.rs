//! Runtime configuration, read once at startup from the environment.

use std::path::PathBuf;

/// Everything the service needs to know before it starts listening.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data-plane bind address.
    pub addr: String,
    /// Upstream file store address.
    pub file_addr: String,
    /// Control-plane bind address.
    pub ctrl_addr: String,
    /// File cache byte budget.
    pub cache_size: usize,
    /// Glob cache byte budget (per ordering).
    pub glob_cache_size: usize,
    /// In-flight worker threshold before the miss path sheds load.
    pub overload: i32,
    /// Path of the embedded key-value store.
    pub db_path: PathBuf,
    /// URI prefixes refused outright.
    pub blacklist: Vec<String>,
}

impl Config {
    /// Read configuration from the environment, falling back to the
    /// production defaults.
    pub fn from_env() -> Config {
        let db_default = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".portm-portal.db");

        Config {
            addr: normalize_addr(&str_env("portalAddr", ":7070")),
            // The key names read crossed but this is the deployed wiring:
            // portalCtrlAddr points at the upstream store, portalFileAddr
            // is where the control plane binds.
            file_addr: str_env("portalCtrlAddr", "127.0.0.1:7000"),
            ctrl_addr: normalize_addr(&str_env("portalFileAddr", "127.0.0.1:7071")),
            cache_size: int_env("portalCacheSize", 2 * 1024 * 1024 * 1024),
            glob_cache_size: int_env("portalGlobCacheSize", 300 * 1024 * 1024),
            overload: int_env("portalOverload", 300) as i32,
            db_path: std::env::var("portalDbPath")
                .map(PathBuf::from)
                .unwrap_or(db_default),
            blacklist: std::env::var("portalBlacklist")
                .unwrap_or_default()
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

fn str_env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn int_env(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// A bare `:port` bind address listens on every interface.
fn normalize_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr(":7070"), "0.0.0.0:7070");
        assert_eq!(normalize_addr("127.0.0.1:7000"), "127.0.0.1:7000");
    }
}
