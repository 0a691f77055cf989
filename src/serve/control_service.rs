//! The control plane: push invalidation, cache introspection and one-off
//! script execution.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Query, Request, State};
use axum::http::Response;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value as Json};

use crate::app::App;
use crate::file::File;
use crate::script::{self, RequestInfo, ScriptEnv};
use crate::util;

use super::{bytes_response, json_response};

const MAX_PAGE: usize = 200;

/// The control-plane router.
pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/file", get(file_action))
        .route("/purge", get(purge))
        .route("/purge-req-count", get(purge_req_count))
        .route("/status", get(status))
        .route("/cache-list", get(cache_list))
        .route("/cost-list", get(cost_list))
        .route("/log-list", get(log_list))
        .route("/info", get(info))
        .route("/query-deps", get(query_deps))
        .route("/boundary-quota-list", get(boundary_quota_list))
        .route("/test-query", post(test_query))
        .with_state(app)
}

/// Run the control-plane listener until the process exits. Proxy rules
/// are bootstrapped from the store before the listener opens.
pub async fn serve(app: Arc<App>) -> anyhow::Result<()> {
    app.bootstrap_proxy_rules().await;

    let addr = app.config.ctrl_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("control service listen on {}", addr);

    axum::serve(listener, router(app)).await?;
    Ok(())
}

fn page_params(params: &HashMap<String, String>) -> (usize, usize) {
    let offset = params
        .get("offset")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let limit = params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    (offset, limit)
}

/// `GET /file?action=create|update|delete&uri=...`
async fn file_action(
    State(app): State<Arc<App>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response<Body> {
    let action = params.get("action").cloned().unwrap_or_default();
    let uri = match params.get("uri") {
        Some(uri) if !uri.is_empty() => uri.clone(),
        _ => return bytes_response(400, b"missing uri".to_vec()),
    };

    // Refresh the proxy rule from the store regardless of action.
    let file = app.request_file(&uri).await;
    app.update_proxy_rule(&uri, &file);

    match action.as_str() {
        "create" => {
            app.glob.update_to_list(&uri);
            app.cache.set(&uri, file);
            app.runtime_cache.flush(&uri);
        }
        "update" => {
            app.glob.update_to_list(&uri);
            app.clear_dependents(&uri);
            app.cache.set(&uri, file);
            app.runtime_cache.flush(&uri);
        }
        "delete" => {
            app.glob.del_from_list(&uri);
            app.clear_dependents(&uri);
            app.cache.del(&uri);
            app.runtime_cache.flush(&uri);
        }
        _ => return bytes_response(400, b"bad action".to_vec()),
    }

    bytes_response(200, Vec::new())
}

/// `GET /purge`: drop the monitor and the file cache, then re-bootstrap
/// the proxy rules.
async fn purge(State(app): State<Arc<App>>) -> Response<Body> {
    app.monitor.purge();
    app.cache.purge();
    app.bootstrap_proxy_rules().await;
    log::info!("purged");
    bytes_response(200, Vec::new())
}

async fn purge_req_count(State(app): State<Arc<App>>) -> Response<Body> {
    app.req_count.clear();
    log::info!("purged req count");
    bytes_response(200, Vec::new())
}

/// `GET /status`: one JSON snapshot of the node.
async fn status(State(app): State<Arc<App>>) -> Response<Body> {
    let value = json!({
        "cache": app.cache.size(),
        "count": app.req_count.codes(),
        "total": app.req_count.last_total(),
        "qps": app.req_count.qps() as u32,
        "time": chrono::Utc::now().timestamp_millis(),
        "qpsTime": app.req_count.last_time_millis(),
        "workingCount": app.working_count.load(Ordering::Relaxed),
        "mem": util::resident_mem_kib(),
    });
    json_response(200, &value)
}

/// `GET /cache-list?offset&limit`: paginated file summaries.
async fn cache_list(
    State(app): State<Arc<App>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response<Body> {
    let (offset, limit) = page_params(&params);
    let count = app.cache.count();
    let (left, right) = util::slicer(offset, limit, count, MAX_PAGE);

    let mut list = Vec::new();
    let mut costs = serde_json::Map::new();
    for (uri, file) in app.cache.slice(left, right) {
        let cost = app.cost.get(&uri).map(|info| info.cost).unwrap_or(0);
        costs.insert(uri, Json::String(cost.to_string()));
        list.push(file.to_json());
    }

    json_response(
        200,
        &json!({
            "total": count,
            "list": list,
            "cost": costs,
        }),
    )
}

/// `GET /cost-list?offset&limit`: the accounting table.
async fn cost_list(
    State(app): State<Arc<App>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response<Body> {
    let (offset, limit) = page_params(&params);
    let mut entries = app.cost.list();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));

    let (left, right) = util::slicer(offset, limit, entries.len(), MAX_PAGE);
    let list: Vec<Json> = entries[left..right]
        .iter()
        .map(|(uri, info)| {
            json!({
                "URI": uri,
                "Cost": info.cost,
                "QPS": info.qps,
                "Concurrent": info.concurrent,
                "Quota": info.quota,
                "Rejected": info.rejected,
            })
        })
        .collect();

    json_response(
        200,
        &json!({
            "total": entries.len(),
            "list": list,
        }),
    )
}

/// `GET /log-list?offset&limit`: recent script failures.
async fn log_list(
    State(app): State<Arc<App>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response<Body> {
    let (offset, limit) = page_params(&params);
    let count = app.log_cache.count();
    let (left, right) = util::slicer(offset, limit, count, MAX_PAGE);

    let list: Vec<Json> = app
        .log_cache
        .slice(left, right)
        .iter()
        .map(|entry| serde_json::to_value(entry.as_ref()).unwrap_or(Json::Null))
        .collect();

    json_response(
        200,
        &json!({
            "total": count,
            "list": list,
        }),
    )
}

/// `GET /info?uri=...`: one cached file as JSON.
async fn info(
    State(app): State<Arc<App>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response<Body> {
    let uri = params.get("uri").cloned().unwrap_or_default();
    match app.cache.peek(&uri) {
        Some(file) => json_response(200, &file.to_json()),
        None => bytes_response(404, Vec::new()),
    }
}

/// `GET /query-deps?uri=...`: transitive dependents of a file.
async fn query_deps(
    State(app): State<Arc<App>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response<Body> {
    let uri = params.get("uri").cloned().unwrap_or_default();
    let mut seen: HashMap<u64, Arc<File>> = HashMap::new();

    if let Some(file) = app.cache.peek(&uri) {
        let mut stack = vec![file.clone()];
        seen.insert(file.serial, file);
        while let Some(next) = stack.pop() {
            for dep in next.dependents.list() {
                if !seen.contains_key(&dep.serial) {
                    seen.insert(dep.serial, dep.clone());
                    stack.push(dep);
                }
            }
        }
    }

    let list: Vec<String> = seen.values().map(|f| f.uri.clone()).collect();
    json_response(200, &json!(list))
}

/// `GET /boundary-quota-list?boundary=...`: files whose used share of
/// their quota passes a threshold.
async fn boundary_quota_list(
    State(app): State<Arc<App>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response<Body> {
    let boundary: f64 = params
        .get("boundary")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);

    let mut list = Vec::new();
    for (uri, file) in app.cache.items() {
        let cost = app.cost.get(&uri).map(|info| info.cost).unwrap_or(0);
        let quota = file.quota;
        let used_secs = (cost / 1_000_000_000) as f64;
        let quota_secs = (quota / 1_000_000_000) as f64;
        // Zero-quota files are always listed: their used share divides to
        // infinity or NaN, neither of which is under the boundary.
        if quota > 0 && used_secs / quota_secs < boundary {
            continue;
        }
        list.push(json!({
            "URI": uri,
            "Cost": cost,
            "Quota": quota,
        }));
    }

    json_response(200, &json!(list))
}

/// `POST /test-query`: run a posted `{code, body}` against a synthetic
/// one-off file.
async fn test_query(State(app): State<Arc<App>>, req: Request) -> Response<Body> {
    let bytes = to_bytes(req.into_body(), 1024 * 1024)
        .await
        .map(|b| b.to_vec())
        .unwrap_or_default();

    let posted: Json = match serde_json::from_slice(&bytes) {
        Ok(json) => json,
        Err(err) => return bytes_response(400, err.to_string().into_bytes()),
    };

    let (code, body) = match &posted {
        Json::Object(map) if map.contains_key("code") => {
            let body = map
                .get("body")
                .and_then(|b| b.as_str())
                .map(|s| s.as_bytes().to_vec())
                .unwrap_or_default();
            (map.get("code").cloned().unwrap_or(Json::Null), body)
        }
        other => (other.clone(), Vec::new()),
    };

    let file = Arc::new(File::script_host(code, None));
    let env = ScriptEnv::new(
        app.clone(),
        RequestInfo {
            method: "POST".to_string(),
            scheme: "http".to_string(),
            host: String::new(),
            path: "/test-query".to_string(),
            raw_query: String::new(),
            headers: Vec::new(),
            body,
        },
    );

    match script::run_file(&file, &env, true).await {
        Ok(body) => bytes_response(200, body),
        Err(err) => bytes_response(500, format!("gisp error: {}", err).into_bytes()),
    }
}
