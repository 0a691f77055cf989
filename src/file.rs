//! The cached unit of content or behaviour: the `File`.
//!
//! Files are built from the upstream store's response. `Portm-*` control
//! headers carry identity, type and execution limits; everything else
//! (minus content-type and content-length) is replayed verbatim onto
//! client responses. Script bodies are parsed eagerly; oversized or
//! malformed scripts degrade to plain Binary files carrying an error body.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::{json, Value as Json};

use crate::mem_cache::MemSize;
use crate::util;

/// Scripts above this size degrade to Binary error bodies.
pub const MAX_SCRIPT_SIZE: usize = 512 * 1024;

/// Bodies below this size are never gzipped.
pub const GZIP_MIN_SIZE: usize = 256;

/// Default execution-time quota: effectively unlimited.
pub const MAX_QUOTA: u64 = u64::MAX;

/// Default concurrent-execution cap: effectively unlimited.
pub const MAX_CONCURRENT: u32 = 10_000_000;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// What a file is: plain content, an executable script, a proxy rule or a
/// synthetic marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// JSON content served as bytes.
    Json,
    /// Plain text content.
    Text,
    /// Executable script whose AST runs per request.
    Script,
    /// Script installed as a proxy rule.
    Proxy,
    /// Opaque bytes.
    Binary,
    /// Synthetic marker: the node is shedding load.
    Overload,
    /// Synthetic marker: the upstream has no such file.
    NotFound,
}

impl FileType {
    /// Stable wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Json => "Json",
            FileType::Text => "Text",
            FileType::Script => "Script",
            FileType::Proxy => "Proxy",
            FileType::Binary => "Binary",
            FileType::Overload => "Overload",
            FileType::NotFound => "NotFound",
        }
    }

    fn is_text(&self) -> bool {
        matches!(self, FileType::Json | FileType::Text)
    }
}

/// Backward edges: the files that imported this file during execution.
///
/// The set is only swept linearly on invalidation, never traversed for
/// cascading deletes, so a cyclic import graph is harmless.
pub struct DependentSet {
    dict: Mutex<HashMap<u64, Arc<File>>>,
}

impl DependentSet {
    fn new() -> Self {
        Self {
            dict: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `f` imported the owner of this set.
    pub fn add(&self, f: &Arc<File>) {
        self.dict.lock().insert(f.serial, f.clone());
    }

    /// Remove `f` if present.
    pub fn del(&self, f: &Arc<File>) {
        self.dict.lock().remove(&f.serial);
    }

    /// Snapshot of the current dependents.
    pub fn list(&self) -> Vec<Arc<File>> {
        self.dict.lock().values().cloned().collect()
    }

    /// Number of dependents.
    pub fn len(&self) -> usize {
        self.dict.lock().len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.dict.lock().is_empty()
    }
}

/// A published file as cached by this node.
pub struct File {
    /// Document id assigned by the back office.
    pub id: String,
    /// Canonical URI (scheme://host/path, no query).
    pub uri: String,
    /// Content or behaviour class.
    pub file_type: FileType,
    /// Id of the last editor.
    pub modifier_id: String,
    /// Id of the root document.
    pub root_id: String,
    /// Last modification timestamp, opaque string.
    pub modify_time: String,
    /// Replayable response headers (control headers already stripped).
    pub headers: Vec<(String, String)>,
    /// Content type to set on responses.
    pub content_type: String,
    /// Raw body. Synthetic files built for one-off script runs have none.
    pub body: Option<Arc<Vec<u8>>>,
    /// Gzipped body, populated for compressible content.
    pub gzipped_body: Option<Vec<u8>>,
    /// Parsed script AST for Script/Proxy files.
    pub code: Option<Json>,
    /// Lazily parsed JSON body, shared by `file(..., "json")` reads.
    pub json_body: once_cell::sync::OnceCell<Option<Json>>,
    /// Weak ETag of the body; absent for scripts and body-less files.
    pub etag: Option<String>,
    /// Cumulative execution-time quota in nanoseconds.
    pub quota: u64,
    /// Maximum simultaneous executions.
    pub concurrent: u32,
    /// Nanoseconds spent executing this file so far.
    pub cost: AtomicU64,
    /// Times this file was served from cache.
    pub count: AtomicU64,
    /// Process-unique identity for dependents bookkeeping.
    pub serial: u64,
    /// Files that imported this one.
    pub dependents: DependentSet,
}

/// The shared 429 sentinel served while shedding load.
pub static OVERLOAD_FILE: Lazy<Arc<File>> = Lazy::new(|| {
    Arc::new(File::synthetic(
        FileType::Overload,
        Some(b"Too Many Requests".to_vec()),
    ))
});

impl File {
    /// Build a `File` from an upstream response. `headers` holds the raw
    /// response headers; `Portm-*` control keys configure the file and are
    /// consumed, the rest are kept for replay.
    pub fn from_upstream(uri: &str, headers: &[(String, String)], mut body: Vec<u8>) -> File {
        let mut kept = Vec::new();
        let mut file_type = FileType::Json;
        let mut id = String::new();
        let mut modifier_id = String::new();
        let mut root_id = String::new();
        let mut modify_time = String::new();
        let mut content_type = String::new();
        let mut quota = MAX_QUOTA;
        let mut concurrent = MAX_CONCURRENT;
        let mut code = None;

        for (k, v) in headers {
            if k.eq_ignore_ascii_case("Portm-Id") {
                id = v.clone();
            } else if k.eq_ignore_ascii_case("Portm-Modifier-Id") {
                modifier_id = v.clone();
            } else if k.eq_ignore_ascii_case("Portm-Root-Id") {
                root_id = v.clone();
            } else if k.eq_ignore_ascii_case("Portm-Modify-Time") {
                modify_time = v.clone();
            } else if k.eq_ignore_ascii_case("Portm-Quota") {
                quota = v.parse().unwrap_or(MAX_QUOTA);
            } else if k.eq_ignore_ascii_case("Portm-Concurrent") {
                concurrent = v.parse().unwrap_or(MAX_CONCURRENT);
            } else if k.eq_ignore_ascii_case("Portm-Not-Found") {
                file_type = FileType::NotFound;
            } else if k.eq_ignore_ascii_case("Portm-Type") {
                match v.as_str() {
                    "Json" => file_type = FileType::Json,
                    "Text" => file_type = FileType::Text,
                    "Binary" => file_type = FileType::Binary,
                    "Script" | "Proxy" => {
                        file_type = if v == "Proxy" {
                            FileType::Proxy
                        } else {
                            FileType::Script
                        };

                        if body.len() > MAX_SCRIPT_SIZE {
                            file_type = FileType::Binary;
                            body = format!("gisp file exceeded max size {}B", MAX_SCRIPT_SIZE)
                                .into_bytes();
                            continue;
                        }

                        match serde_json::from_slice::<Json>(&body) {
                            Ok(ast) => code = Some(ast),
                            Err(err) => {
                                log::error!("bad script body {}: {}", uri, err);
                                file_type = FileType::Binary;
                                body = err.to_string().into_bytes();
                            }
                        }
                    }
                    _ => {}
                }
            } else if k.eq_ignore_ascii_case("Content-Type") {
                content_type = v.clone();
            } else if k.eq_ignore_ascii_case("Content-Length") {
                // recomputed on the way out
            } else {
                kept.push((k.clone(), v.clone()));
            }
        }

        let mut gzipped_body = None;
        if body.len() > GZIP_MIN_SIZE && file_type.is_text() {
            gzipped_body = Some(util::gzip(&body));
        }
        if file_type == FileType::Binary && util::is_text_mime(&content_type) {
            gzipped_body = Some(util::gzip(&body));
        }

        let etag = if code.is_none() {
            Some(util::etag(&body))
        } else {
            None
        };

        File {
            id,
            uri: uri.to_string(),
            file_type,
            modifier_id,
            root_id,
            modify_time,
            headers: kept,
            content_type,
            body: Some(Arc::new(body)),
            gzipped_body,
            code,
            json_body: once_cell::sync::OnceCell::new(),
            etag,
            quota,
            concurrent,
            cost: AtomicU64::new(0),
            count: AtomicU64::new(1),
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            dependents: DependentSet::new(),
        }
    }

    /// Build a bare synthetic file: overload sentinels, upstream-error
    /// placeholders and one-off script hosts.
    pub fn synthetic(file_type: FileType, body: Option<Vec<u8>>) -> File {
        File {
            id: String::new(),
            uri: String::new(),
            file_type,
            modifier_id: String::new(),
            root_id: String::new(),
            modify_time: String::new(),
            headers: Vec::new(),
            content_type: String::new(),
            body: body.map(Arc::new),
            gzipped_body: None,
            code: None,
            json_body: once_cell::sync::OnceCell::new(),
            etag: None,
            quota: MAX_QUOTA,
            concurrent: MAX_CONCURRENT,
            cost: AtomicU64::new(0),
            count: AtomicU64::new(0),
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            dependents: DependentSet::new(),
        }
    }

    /// Synthetic script host used by the control plane's one-off runs.
    pub fn script_host(code: Json, body: Option<Vec<u8>>) -> File {
        let mut file = File::synthetic(FileType::Script, body);
        file.code = Some(code);
        file
    }

    /// The JSON body, parsed on first use and shared afterwards. `None`
    /// when the body is absent or not valid JSON.
    pub fn json_body(&self) -> Option<&Json> {
        self.json_body
            .get_or_init(|| {
                let body = self.body.as_ref()?;
                serde_json::from_slice(body).ok()
            })
            .as_ref()
    }

    /// Control-plane JSON rendering of the file.
    pub fn to_json(&self) -> Json {
        json!({
            "id": self.id,
            "uri": self.uri,
            "type": self.file_type.as_str(),
            "modifierId": self.modifier_id,
            "rootId": self.root_id,
            "modifyTime": self.modify_time,
            "etag": self.etag.clone().unwrap_or_default(),
            "body": self
                .body
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default(),
            "code": self.code.clone().unwrap_or(Json::Null),
            "quota": self.quota,
            "cost": self.cost.load(Ordering::Relaxed),
            "concurrent": self.concurrent,
            "count": self.count.load(Ordering::Relaxed),
        })
    }
}

impl MemSize for File {
    fn mem_size(&self) -> usize {
        let body = self.body.as_ref().map(|b| b.len()).unwrap_or(0);
        let gz = self.gzipped_body.as_ref().map(|b| b.len()).unwrap_or(0);
        let headers: usize = self.headers.iter().map(|(k, v)| k.len() + v.len()).sum();
        body + gz
            + headers
            + self.uri.len()
            + self.id.len()
            + self.content_type.len()
            + self.etag.as_ref().map(|e| e.len()).unwrap_or(0)
            + 256
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_control_headers_consumed() {
        let file = File::from_upstream(
            "http://a/b",
            &headers(&[
                ("Portm-Id", "id1"),
                ("Portm-Modifier-Id", "mod1"),
                ("Portm-Root-Id", "root1"),
                ("Portm-Modify-Time", "123"),
                ("Portm-Type", "Text"),
                ("Portm-Quota", "500"),
                ("Portm-Concurrent", "2"),
                ("Content-Type", "text/plain"),
                ("Content-Length", "5"),
                ("X-Extra", "kept"),
            ]),
            b"hello".to_vec(),
        );

        assert_eq!(file.id, "id1");
        assert_eq!(file.modifier_id, "mod1");
        assert_eq!(file.root_id, "root1");
        assert_eq!(file.modify_time, "123");
        assert_eq!(file.file_type, FileType::Text);
        assert_eq!(file.quota, 500);
        assert_eq!(file.concurrent, 2);
        assert_eq!(file.content_type, "text/plain");
        assert_eq!(
            file.headers,
            vec![("X-Extra".to_string(), "kept".to_string())]
        );
    }

    #[test]
    fn test_script_parses_ast() {
        let file = File::from_upstream(
            "http://a/s",
            &headers(&[("Portm-Type", "Script")]),
            br#"["if", true, 1, 2]"#.to_vec(),
        );
        assert_eq!(file.file_type, FileType::Script);
        assert!(file.code.is_some());
        assert!(file.etag.is_none());
    }

    #[test]
    fn test_malformed_script_degrades_to_binary() {
        let file = File::from_upstream(
            "http://a/s",
            &headers(&[("Portm-Type", "Script")]),
            b"not json at all {".to_vec(),
        );
        assert_eq!(file.file_type, FileType::Binary);
        assert!(file.code.is_none());
        assert!(file.etag.is_some());
    }

    #[test]
    fn test_oversize_script_degrades_to_binary() {
        let body = vec![b'x'; MAX_SCRIPT_SIZE + 1];
        let file = File::from_upstream("http://a/s", &headers(&[("Portm-Type", "Script")]), body);
        assert_eq!(file.file_type, FileType::Binary);
        assert!(file.code.is_none());
        let body = file.body.as_ref().unwrap();
        assert!(String::from_utf8_lossy(body).contains("exceeded max size"));
    }

    #[test]
    fn test_not_found_marker() {
        let file = File::from_upstream(
            "http://a/x",
            &headers(&[("Portm-Not-Found", "1")]),
            Vec::new(),
        );
        assert_eq!(file.file_type, FileType::NotFound);
    }

    #[test]
    fn test_gzip_for_large_text() {
        let body = vec![b'a'; GZIP_MIN_SIZE * 2];
        let file = File::from_upstream("http://a/t", &headers(&[("Portm-Type", "Text")]), body);
        assert!(file.gzipped_body.is_some());

        let small = File::from_upstream(
            "http://a/t",
            &headers(&[("Portm-Type", "Text")]),
            b"tiny".to_vec(),
        );
        assert!(small.gzipped_body.is_none());
    }

    #[test]
    fn test_gzip_for_textual_binary() {
        let body = b"{}".to_vec();
        let file = File::from_upstream(
            "http://a/j",
            &headers(&[("Portm-Type", "Binary"), ("Content-Type", "application/json")]),
            body,
        );
        assert!(file.gzipped_body.is_some());
    }

    #[test]
    fn test_etag_only_without_code() {
        let text = File::from_upstream("http://a/t", &headers(&[("Portm-Type", "Text")]), b"x".to_vec());
        assert!(text.etag.is_some());

        let script = File::from_upstream(
            "http://a/s",
            &headers(&[("Portm-Type", "Script")]),
            b"[\"do\"]".to_vec(),
        );
        assert!(script.etag.is_none());
    }

    #[test]
    fn test_dependent_set_add_del() {
        let owner = Arc::new(File::synthetic(FileType::Text, None));
        let importer = Arc::new(File::synthetic(FileType::Script, None));

        owner.dependents.add(&importer);
        owner.dependents.add(&importer);
        assert_eq!(owner.dependents.len(), 1);

        owner.dependents.del(&importer);
        assert!(owner.dependents.is_empty());
        // Deleting an absent entry is a no-op.
        owner.dependents.del(&importer);
    }

    #[test]
    fn test_json_body_lazy_parse() {
        let file = File::from_upstream(
            "http://a/j",
            &headers(&[("Portm-Type", "Json")]),
            br#"{"a": 1}"#.to_vec(),
        );
        assert!(file.json_body().is_some());
        // Second call returns the cached parse.
        assert!(file.json_body().is_some());

        let bad = File::from_upstream("http://a/j", &headers(&[("Portm-Type", "Json")]), b"{".to_vec());
        assert!(bad.json_body().is_none());
    }
}
