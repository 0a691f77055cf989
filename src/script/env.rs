//! Per-request execution environment.
//!
//! One `ScriptEnv` lives for the duration of a request's script run. It
//! holds the mutable request/response state the builtins read and write,
//! the log buffer, proxy directives and the operator-invocation budget.
//! File imports fork the argument set and depth but share this state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value as Json;

use crate::app::App;
use crate::util;

use super::value::Value;

/// Budget: operator invocations allowed per request.
pub const MAX_FN_RUN_COUNT: u64 = 100_000;

/// Import depth allowed for `file(uri, "code")` chains.
pub const MAX_FILE_STACK_DEPTH: u32 = 7;

/// Immutable snapshot of the inbound request used to seed a run.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    /// HTTP method, uppercase.
    pub method: String,
    /// URI scheme, normally `http`.
    pub scheme: String,
    /// Host the request addressed.
    pub host: String,
    /// Request path.
    pub path: String,
    /// Raw query string, no leading `?`.
    pub raw_query: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Vec<u8>,
}

/// Mutable request state; scripts may rewrite host, path and headers
/// before a proxy forward.
pub struct ReqState {
    /// See [`RequestInfo::method`].
    pub method: String,
    /// See [`RequestInfo::scheme`].
    pub scheme: String,
    /// Current host, possibly rewritten.
    pub host: String,
    /// Current path, possibly rewritten.
    pub path: String,
    /// Current raw query.
    pub raw_query: String,
    /// Current headers.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
    parsed_body: Option<Option<Json>>,
}

impl ReqState {
    /// Full URI of the request in its current state.
    pub fn href(&self) -> String {
        if self.raw_query.is_empty() {
            format!("{}://{}{}", self.scheme, self.host, self.path)
        } else {
            format!("{}://{}{}?{}", self.scheme, self.host, self.path, self.raw_query)
        }
    }

    /// The body parsed as JSON, cached after the first attempt.
    pub fn parsed_body(&mut self) -> Option<&Json> {
        if self.parsed_body.is_none() {
            self.parsed_body = Some(serde_json::from_slice(&self.body).ok());
        }
        self.parsed_body.as_ref().and_then(|p| p.as_ref())
    }
}

/// Response mutations accumulated during a run, applied by the pipeline
/// after the script finishes.
#[derive(Debug, Default)]
pub struct ResState {
    /// Status code set by the script, if any.
    pub status: Option<u16>,
    /// Headers set by the script, replace-by-name.
    pub headers: Vec<(String, String)>,
}

impl ResState {
    /// Set a header, replacing any previous value under the same name.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(slot) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            slot.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }
}

/// Shared state of one script run.
pub struct ScriptEnv {
    /// Application context the I/O builtins go through.
    pub app: Arc<App>,
    /// Mutable request state.
    pub req: Mutex<ReqState>,
    /// Accumulated response mutations.
    pub res: Mutex<ResState>,
    /// `log` builtin output.
    pub log_buf: Mutex<Vec<u8>>,
    /// Whether `log` was used at least once.
    pub has_log: AtomicBool,
    /// Host set by `proxyToHost`.
    pub proxy_host: Mutex<Option<String>>,
    /// URI set by `proxyToFile`.
    pub proxy_file: Mutex<Option<String>>,
    /// Operator invocations so far.
    pub fn_run_count: AtomicU64,
}

impl ScriptEnv {
    /// Seed an environment from a request snapshot.
    pub fn new(app: Arc<App>, info: RequestInfo) -> Arc<ScriptEnv> {
        Arc::new(ScriptEnv {
            app,
            req: Mutex::new(ReqState {
                method: info.method,
                scheme: info.scheme,
                host: info.host,
                path: info.path,
                raw_query: info.raw_query,
                headers: info.headers,
                body: info.body,
                parsed_body: None,
            }),
            res: Mutex::new(ResState::default()),
            log_buf: Mutex::new(Vec::new()),
            has_log: AtomicBool::new(false),
            proxy_host: Mutex::new(None),
            proxy_file: Mutex::new(None),
            fn_run_count: AtomicU64::new(0),
        })
    }

    /// Append one pretty-printed value to the log section.
    pub fn log_value(&self, v: &Value) {
        self.has_log.store(true, Ordering::Relaxed);
        let mut buf = self.log_buf.lock();
        match serde_json::to_vec_pretty(&v.to_json()) {
            Ok(bytes) => buf.extend_from_slice(&bytes),
            Err(err) => buf.extend_from_slice(err.to_string().as_bytes()),
        }
        buf.push(b'\n');
    }

    /// First request header matching `name`, case-insensitive.
    pub fn req_header(&self, name: &str) -> Option<String> {
        self.req
            .lock()
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    /// Set a request header, replacing any previous value.
    pub fn set_req_header(&self, name: &str, value: &str) {
        let mut req = self.req.lock();
        if let Some(slot) = req
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            slot.1 = value.to_string();
        } else {
            req.headers.push((name.to_string(), value.to_string()));
        }
    }

    /// Rewrite the request target. Accepts a bare path, a path with a
    /// query, or a full URI.
    pub fn set_req_uri(&self, uri: &str) {
        let mut req = self.req.lock();
        let rest = if let Some(stripped) = uri.strip_prefix("http://") {
            req.scheme = "http".to_string();
            stripped
        } else if let Some(stripped) = uri.strip_prefix("https://") {
            req.scheme = "https".to_string();
            stripped
        } else {
            match uri.find('?') {
                Some(i) => {
                    req.path = uri[..i].to_string();
                    req.raw_query = uri[i + 1..].to_string();
                }
                None => {
                    req.path = uri.to_string();
                    req.raw_query = String::new();
                }
            }
            return;
        };
        let (host_path, query) = util::split_uri(rest);
        match host_path.find('/') {
            Some(i) => {
                req.host = host_path[..i].to_string();
                req.path = host_path[i..].to_string();
            }
            None => {
                req.host = host_path.to_string();
                req.path = "/".to_string();
            }
        }
        req.raw_query = query.to_string();
    }

    /// Look up a field of the request body. A JSON object body resolves
    /// fields directly; otherwise the body is treated as a form-encoded
    /// parameter list.
    pub fn body_field(&self, name: &str) -> Option<Value> {
        let mut req = self.req.lock();
        if let Some(json) = req.parsed_body() {
            return json.get(name).map(Value::from_ast);
        }
        let body = String::from_utf8_lossy(&req.body).into_owned();
        util::parse_query(&body)
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| Value::Str(v))
    }

    /// All values of a request-body field.
    pub fn body_fields(&self, name: &str) -> Vec<Value> {
        let mut req = self.req.lock();
        if let Some(json) = req.parsed_body() {
            return match json.get(name) {
                Some(Json::Array(items)) => items.iter().map(Value::from_ast).collect(),
                Some(other) => vec![Value::from_ast(other)],
                None => Vec::new(),
            };
        }
        let body = String::from_utf8_lossy(&req.body).into_owned();
        util::parse_query(&body)
            .into_iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| Value::Str(v))
            .collect()
    }
}
