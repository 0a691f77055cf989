//! The data-plane pipeline.
//!
//! Each request resolves to either a proxy rule (longest-prefix match on
//! the URI) or a file. Plain files are served from cached bytes with weak
//! ETag revalidation and gzip negotiation; script files run through
//! admission control and the interpreter. Proxy scripts may forward the
//! (possibly rewritten) request to another host or re-enter file handling
//! under another URI.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, Response};
use axum::Router;
use once_cell::sync::Lazy;

use crate::app::App;
use crate::file::FileType;
use crate::script::{self, RequestInfo, ScriptEnv};
use crate::util;

use super::{bytes_response, response_with_headers, set_pair};

const MAX_INBOUND_BODY: usize = 8 * 1024 * 1024;

static FORWARD_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .expect("http client")
});

/// The data-plane router: every URI falls through to the pipeline.
pub fn router(app: Arc<App>) -> Router {
    Router::new().fallback(handle).with_state(app)
}

/// Run the data-plane listener until the process exits.
pub async fn serve(app: Arc<App>) -> anyhow::Result<()> {
    let addr = app.config.addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("file service listen on {}", addr);

    axum::serve(listener, router(app)).await?;
    Ok(())
}

async fn handle(State(app): State<Arc<App>>, req: Request) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let body = to_bytes(body, MAX_INBOUND_BODY)
        .await
        .map(|b| b.to_vec())
        .unwrap_or_default();

    let scheme = parts.uri.scheme_str().unwrap_or("http").to_string();
    let host = parts
        .uri
        .host()
        .map(str::to_string)
        .or_else(|| {
            parts
                .headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();
    let path = parts.uri.path().to_string();
    let raw_query = parts.uri.query().unwrap_or("").to_string();
    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|v| (k.as_str().to_string(), v.to_string()))
        })
        .collect();

    let info = RequestInfo {
        method: parts.method.as_str().to_string(),
        scheme,
        host,
        path,
        raw_query,
        headers,
        body,
    };

    let uri = format!("{}://{}{}", info.scheme, info.host, info.path);

    for prefix in &app.config.blacklist {
        if uri.starts_with(prefix.as_str()) {
            return bytes_response(429, b"\"Forbidden\"".to_vec());
        }
    }

    handle_proxy(app, uri, info).await
}

/// Dispatch a request: a proxy rule when one matches the URI prefix,
/// plain file handling otherwise.
pub async fn handle_proxy(app: Arc<App>, uri: String, info: RequestInfo) -> Response<Body> {
    let rule = match app.proxy_map.get(&uri) {
        Some(rule) => rule,
        None => return handle_file(app, uri, info).await,
    };

    if app.cost.admit(&rule.uri, rule.quota, rule.concurrent) {
        app.req_count.send(429);
        return bytes_response(429, b"Too Many Requests".to_vec());
    }

    let env = ScriptEnv::new(app.clone(), info);
    let start = Instant::now();
    let result = script::run_file(&rule, &env, true).await;
    let elapsed = start.elapsed().as_nanos() as u64;
    rule.cost.fetch_add(elapsed, Ordering::Relaxed);
    app.cost.end(&rule.uri, elapsed);

    if let Err(err) = result {
        let msg = format!("nisp proxy error: {}", err);
        app.req_count.send(500);
        let href = env.req.lock().href();
        app.log_cache.push(&href, 500, &msg);
        return bytes_response(500, msg.into_bytes());
    }

    let proxy_host = env.proxy_host.lock().clone();
    let proxy_file = env.proxy_file.lock().clone();

    if let Some(host) = proxy_host {
        forward(&env, &host).await
    } else if let Some(target) = proxy_file {
        env.set_req_uri(&target);
        let info = snapshot(&env);
        let (target, _) = util::split_uri(&target);
        handle_file(app, target.to_string(), info).await
    } else {
        // The rule handled the response itself via status/header builtins.
        let res = env.res.lock();
        response_with_headers(res.status.unwrap_or(200), &res.headers, Vec::new())
    }
}

/// Serve a file (or run its script) for a canonical URI.
pub async fn handle_file(app: Arc<App>, uri: String, info: RequestInfo) -> Response<Body> {
    let if_none_match = info
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("If-None-Match"))
        .map(|(_, v)| v.clone());
    let accepts_gzip = info
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Accept-Encoding"))
        .map(|(_, v)| v.contains("gzip"))
        .unwrap_or(false);
    let full_uri = if info.raw_query.is_empty() {
        uri.clone()
    } else {
        format!("{}?{}", uri, info.raw_query)
    };

    let file = app.get_file(&uri).await;

    match file.file_type {
        FileType::Overload => {
            let body = file.body.as_ref().map(|b| b.as_ref().clone()).unwrap_or_default();
            return bytes_response(429, body);
        }
        FileType::NotFound => return bytes_response(404, Vec::new()),
        _ => {}
    }

    // File headers first; a script may override them below.
    let mut headers = file.headers.clone();
    if !file.content_type.is_empty() {
        set_pair(&mut headers, "Content-Type", &file.content_type);
    }

    if file.code.is_none() {
        if let Some(etag) = &file.etag {
            if if_none_match.as_deref() == Some(etag.as_str()) {
                app.req_count.send(304);
                return response_with_headers(304, &headers, Vec::new());
            }
            set_pair(&mut headers, "ETag", etag);
        }

        let body = match (&file.gzipped_body, accepts_gzip) {
            (Some(gz), true) => {
                set_pair(&mut headers, "Content-Encoding", "gzip");
                gz.clone()
            }
            _ => file.body.as_ref().map(|b| b.as_ref().clone()).unwrap_or_default(),
        };

        app.req_count.send(200);
        return response_with_headers(200, &headers, body);
    }

    if app.cost.admit(&file.uri, file.quota, file.concurrent) {
        app.req_count.send(429);
        return bytes_response(429, b"Too Many Requests".to_vec());
    }

    let env = ScriptEnv::new(app.clone(), info);
    let start = Instant::now();
    let result = script::run_file(&file, &env, false).await;
    let elapsed = start.elapsed().as_nanos() as u64;
    file.cost.fetch_add(elapsed, Ordering::Relaxed);
    app.cost.end(&file.uri, elapsed);

    let body = match result {
        Ok(body) => body,
        Err(err) => {
            let msg = format!("gisp error: {}", err);
            app.req_count.send(500);
            app.log_cache.push(&full_uri, 500, &msg);
            return bytes_response(500, msg.into_bytes());
        }
    };

    let etag = util::etag(&body);
    if if_none_match.as_deref() == Some(etag.as_str()) {
        app.req_count.send(304);
        return response_with_headers(304, &headers, Vec::new());
    }
    set_pair(&mut headers, "ETag", &etag);

    let status = {
        let res = env.res.lock();
        for (name, value) in &res.headers {
            set_pair(&mut headers, name, value);
        }
        res.status.unwrap_or(200)
    };

    app.req_count.send(status as i32);
    response_with_headers(status, &headers, body)
}

fn snapshot(env: &ScriptEnv) -> RequestInfo {
    let req = env.req.lock();
    RequestInfo {
        method: req.method.clone(),
        scheme: req.scheme.clone(),
        host: req.host.clone(),
        path: req.path.clone(),
        raw_query: req.raw_query.clone(),
        headers: req.headers.clone(),
        body: req.body.clone(),
    }
}

/// Forward the (possibly rewritten) request to another host and relay
/// the reply.
async fn forward(env: &ScriptEnv, host: &str) -> Response<Body> {
    let info = snapshot(env);

    let url = if info.raw_query.is_empty() {
        format!("http://{}{}", host, info.path)
    } else {
        format!("http://{}{}?{}", host, info.path, info.raw_query)
    };

    let method = match reqwest::Method::from_bytes(info.method.as_bytes()) {
        Ok(method) => method,
        Err(err) => return bytes_response(500, err.to_string().into_bytes()),
    };

    let mut builder = FORWARD_CLIENT.request(method, &url);
    for (name, value) in &info.headers {
        if name.eq_ignore_ascii_case("Host") || name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = builder.header(reqwest::header::HOST, info.host.as_str());

    let res = match builder.body(info.body).send().await {
        Ok(res) => res,
        Err(err) => return bytes_response(500, err.to_string().into_bytes()),
    };

    let status = res.status().as_u16();
    let mut headers = Vec::new();
    for key in res.headers().keys() {
        if key == &reqwest::header::TRANSFER_ENCODING || key == &reqwest::header::CONTENT_LENGTH {
            continue;
        }
        if let Some(value) = res.headers().get(key) {
            if let Ok(value) = value.to_str() {
                headers.push((key.as_str().to_string(), value.to_string()));
            }
        }
    }
    let body = res.bytes().await.map(|b| b.to_vec()).unwrap_or_default();

    response_with_headers(status, &headers, body)
}
