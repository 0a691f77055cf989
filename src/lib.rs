//! # Portal - Programmable Edge Serving Layer
//!
//! An edge node for published web content. A back office publishes
//! files (static bytes, binary blobs, reverse-proxy rules or small
//! JSON S-expression programs) into an upstream store; this service
//! fetches them on demand, caches them and serves each HTTP request
//! either from cached bytes or by executing the file's script against
//! the live request.
//!
//! ## Architecture
//!
//! - `mem_cache`: byte-budgeted TTL cache backing every cache below
//! - `file`: the cached unit and its control-header parsing
//! - `glob_cache`: pattern → ordered URI-list cache with reactive updates
//! - `runtime_cache`: script memoisation with dependency invalidation
//! - `cost`: per-URI admission control and execution accounting
//! - `overload`: coalesced eviction of entries with failing upstreams
//! - `req_count`: persisted status-code histogram and QPS sampling
//! - `script`: the sandboxed S-expression interpreter
//! - `serve`: the data-plane pipeline and the control plane
//! - `upstream`: the file store client
//! - `prefix_map`: longest-prefix dispatch of proxy rules

#![warn(missing_docs)]
#![warn(clippy::all)]

// Application context and configuration
pub mod app;
pub mod config;

// Caches
pub mod glob_cache;
pub mod log_cache;
pub mod mem_cache;
pub mod runtime_cache;

// Accounting and back-pressure
pub mod cost;
pub mod overload;
pub mod req_count;

// The cached unit
pub mod file;

// Proxy-rule dispatch
pub mod prefix_map;

// The interpreter
pub mod script;

// HTTP surfaces
pub mod serve;

// Store client
pub mod upstream;

// Shared helpers
pub mod util;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export commonly used types
pub use app::App;
pub use config::Config;
pub use file::{File, FileType};
pub use script::{ScriptEnv, Value};
