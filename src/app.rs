//! Process-wide application context.
//!
//! Owns every cache, the accounting state, the upstream client and the
//! proxy-rule map. One instance is built at startup and shared by both
//! HTTP listeners and by every script run.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::config::Config;
use crate::cost::CostAccountant;
use crate::file::{File, FileType, OVERLOAD_FILE};
use crate::glob_cache::GlobCache;
use crate::log_cache::LogCache;
use crate::mem_cache::{MemCache, MemCacheOptions};
use crate::overload::{OverloadMonitor, OverloadOrigin};
use crate::prefix_map::PrefixMap;
use crate::req_count::{ReqCount, STATUS_PASS_THROUGH};
use crate::runtime_cache::RuntimeCache;
use crate::upstream::{UpstreamClient, UpstreamError};
use crate::util;

/// TTL of the file cache.
pub const FILE_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(600);

/// Script run by the proxy-rule bootstrap against the store: list the
/// URIs of every Proxy-typed file.
pub const PROXY_RULES_SCRIPT: &str = r#"["map",["run",["limit",["filter",["listFile"],[":","type","Proxy"]],0,1000]],["fn",["el"],["get",["el"],"uri"]]]"#;

/// The shared application state.
pub struct App {
    /// Startup configuration.
    pub config: Config,
    /// The per-URI file cache.
    pub cache: Arc<MemCache<Arc<File>>>,
    /// Pattern-indexed glob cache.
    pub glob: Arc<GlobCache>,
    /// Script memoisation cache.
    pub runtime_cache: Arc<RuntimeCache>,
    /// Recent script failures.
    pub log_cache: Arc<LogCache>,
    /// Admission control and execution accounting.
    pub cost: Arc<CostAccountant>,
    /// Upstream-failure eviction monitor.
    pub monitor: Arc<OverloadMonitor>,
    /// Status-code histogram.
    pub req_count: Arc<ReqCount>,
    /// Installed proxy rules.
    pub proxy_map: PrefixMap<Arc<File>>,
    /// Store client.
    pub upstream: UpstreamClient,
    /// Requests currently on the miss path.
    pub working_count: AtomicI32,
    working_lock: tokio::sync::Mutex<()>,
    /// The embedded key-value store.
    pub db: sled::Db,
}

struct WorkingGuard<'a>(&'a AtomicI32);

impl Drop for WorkingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl App {
    /// Assemble the application context. Background tasks are started
    /// separately by [`App::spawn_background`].
    pub fn new(config: Config, db: sled::Db) -> anyhow::Result<Arc<App>> {
        let cache = Arc::new(MemCache::new(MemCacheOptions {
            max_mem_size: config.cache_size,
            ttl: Some(FILE_CACHE_TTL),
            promote: false,
        }));
        let glob = Arc::new(GlobCache::new(config.glob_cache_size, config.overload));
        let runtime_cache = Arc::new(RuntimeCache::new());

        let monitor = {
            let cache = cache.clone();
            let runtime = runtime_cache.clone();
            let file_handler = Box::new(move |uri: &str| {
                cache.del(uri);
                runtime.flush(uri);
            });

            let glob_cache = glob.clone();
            let runtime = runtime_cache.clone();
            let glob_handler = Box::new(move |uri: &str, desc: bool| {
                glob_cache.cache(desc).del(uri);
                runtime.flush(uri);
            });

            Arc::new(OverloadMonitor::new(file_handler, glob_handler))
        };

        let upstream = UpstreamClient::new(&config.file_addr)?;
        let req_count = ReqCount::new(db.clone());

        Ok(Arc::new(App {
            cache,
            glob,
            runtime_cache,
            log_cache: Arc::new(LogCache::new()),
            cost: Arc::new(CostAccountant::new()),
            monitor,
            req_count,
            proxy_map: PrefixMap::new(),
            upstream,
            working_count: AtomicI32::new(0),
            working_lock: tokio::sync::Mutex::new(()),
            db,
            config,
        }))
    }

    /// Start the periodic workers: QPS samplers, the histogram worker and
    /// the overload-monitor tick.
    pub fn spawn_background(self: &Arc<Self>) {
        self.cost.spawn_tasks();
        self.req_count.spawn_worker();
        self.monitor.spawn_tick();
    }

    fn file_from_cache(&self, uri: &str) -> Option<Arc<File>> {
        let file = self.cache.get(uri)?;
        file.count.fetch_add(1, Ordering::Relaxed);
        Some(file)
    }

    /// Resolve a URI to a file: cache hit, or fetch-and-populate behind
    /// the single-flight lock. Under storm the miss path returns the
    /// overload sentinel instead of queueing on the upstream.
    pub async fn get_file(&self, uri: &str) -> Arc<File> {
        let (uri, _) = util::split_uri(uri);
        if let Some(file) = self.file_from_cache(uri) {
            return file;
        }

        self.working_count.fetch_add(1, Ordering::Relaxed);
        let _working = WorkingGuard(&self.working_count);

        if self.working_count.load(Ordering::Relaxed) > self.config.overload {
            return OVERLOAD_FILE.clone();
        }

        let _flight = self.working_lock.lock().await;

        if let Some(file) = self.file_from_cache(uri) {
            return file;
        }

        self.req_count.send(STATUS_PASS_THROUGH);

        let file = self.request_file(uri).await;
        self.cache.set(uri, file.clone());
        file
    }

    /// Fetch a file definition from the store. Failures yield a synthetic
    /// error-body file and stage an eviction with the overload monitor,
    /// so the client never sees a 5xx from this path.
    pub async fn request_file(&self, uri: &str) -> Arc<File> {
        match self.upstream.fetch(uri).await {
            Ok((headers, body)) => Arc::new(File::from_upstream(uri, &headers, body)),
            Err(err) => {
                log::error!("{} fetch error: {}", uri, err);
                self.monitor.report(OverloadOrigin::File, uri, false);
                Arc::new(File::synthetic(
                    FileType::Json,
                    Some(b"file service error".to_vec()),
                ))
            }
        }
    }

    /// Run a script on the store and decode the reply.
    pub async fn rpc<T: DeserializeOwned>(&self, code: &str) -> Result<T, UpstreamError> {
        self.upstream.nisp(code).await
    }

    /// Install or remove the proxy rule for a freshly fetched file.
    pub fn update_proxy_rule(&self, uri: &str, file: &Arc<File>) {
        if self.proxy_map.contains(uri) {
            self.proxy_map.del(uri);
        }
        if file.file_type == FileType::Proxy {
            self.proxy_map.set(uri, file.clone());
        }
    }

    /// Ask the store for every proxy-typed file and pre-populate the
    /// rule map.
    pub async fn bootstrap_proxy_rules(&self) {
        let list: Vec<String> = match self.rpc(PROXY_RULES_SCRIPT).await {
            Ok(list) => list,
            Err(err) => {
                log::error!("proxy rule bootstrap failed: {}", err);
                return;
            }
        };

        for uri in &list {
            let file = self.request_file(uri).await;
            self.proxy_map.set(uri, file);
        }

        log::info!("proxy rules got: {:?}", list);
    }

    /// Remove `uri`'s file from every cached file's dependents set.
    pub fn clear_dependents(&self, uri: &str) {
        let target = match self.cache.peek(uri) {
            Some(file) => file,
            None => return,
        };
        for (_, file) in self.cache.items() {
            file.dependents.del(&target);
        }
    }
}
