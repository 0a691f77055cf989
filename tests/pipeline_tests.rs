//! Data-plane pipeline scenarios, driven through the router and the
//! handler entry points with a preseeded cache.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::Request;
use portal::app::App;
use portal::config::Config;
use portal::file::File;
use portal::overload::OverloadOrigin;
use portal::script::{RequestInfo, Value};
use portal::serve::file_service;
use tower::util::ServiceExt;

fn test_config() -> Config {
    Config {
        addr: "127.0.0.1:0".to_string(),
        file_addr: "127.0.0.1:1".to_string(),
        ctrl_addr: "127.0.0.1:0".to_string(),
        cache_size: 64 * 1024 * 1024,
        glob_cache_size: 16 * 1024 * 1024,
        overload: 300,
        db_path: PathBuf::new(),
        blacklist: vec!["http://blocked.com".to_string()],
    }
}

fn test_app() -> Arc<App> {
    let db = sled::Config::new().temporary(true).open().unwrap();
    App::new(test_config(), db).unwrap()
}

fn seed_text_file(app: &Arc<App>, uri: &str, body: &[u8]) -> Arc<File> {
    let file = Arc::new(File::from_upstream(
        uri,
        &[
            ("Portm-Type".to_string(), "Text".to_string()),
            ("Content-Type".to_string(), "text/plain".to_string()),
        ],
        body.to_vec(),
    ));
    app.cache.set(uri, file.clone());
    file
}

fn seed_script_file(app: &Arc<App>, uri: &str, code: &str, extra: &[(&str, &str)]) -> Arc<File> {
    let mut headers = vec![("Portm-Type".to_string(), "Script".to_string())];
    for (k, v) in extra {
        headers.push((k.to_string(), v.to_string()));
    }
    let file = Arc::new(File::from_upstream(uri, &headers, code.as_bytes().to_vec()));
    app.cache.set(uri, file.clone());
    file
}

fn info_for(host: &str, path: &str) -> RequestInfo {
    RequestInfo {
        method: "GET".to_string(),
        scheme: "http".to_string(),
        host: host.to_string(),
        path: path.to_string(),
        raw_query: String::new(),
        headers: Vec::new(),
        body: Vec::new(),
    }
}

async fn body_of(res: axum::http::Response<Body>) -> Vec<u8> {
    to_bytes(res.into_body(), 16 * 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn test_plain_file_served_with_etag() {
    let app = test_app();
    let file = seed_text_file(&app, "http://t.com/page", b"hello page");

    let res =
        file_service::handle_file(app.clone(), "http://t.com/page".to_string(), info_for("t.com", "/page"))
            .await;
    assert_eq!(res.status(), 200);
    let etag = res
        .headers()
        .get("ETag")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap();
    assert_eq!(Some(etag.clone()), file.etag);
    assert!(etag.starts_with("W/\""));
    assert_eq!(body_of(res).await, b"hello page");
}

#[tokio::test]
async fn test_if_none_match_yields_304() {
    let app = test_app();
    let file = seed_text_file(&app, "http://t.com/page", b"hello page");
    let etag = file.etag.clone().unwrap();

    let mut info = info_for("t.com", "/page");
    info.headers.push(("If-None-Match".to_string(), etag));

    let res = file_service::handle_file(app.clone(), "http://t.com/page".to_string(), info).await;
    assert_eq!(res.status(), 304);
    assert!(body_of(res).await.is_empty());
}

#[tokio::test]
async fn test_gzip_negotiation() {
    let app = test_app();
    let body = vec![b'x'; 2048];
    seed_text_file(&app, "http://t.com/big", &body);

    let mut info = info_for("t.com", "/big");
    info.headers
        .push(("Accept-Encoding".to_string(), "gzip".to_string()));

    let res = file_service::handle_file(app.clone(), "http://t.com/big".to_string(), info).await;
    assert_eq!(
        res.headers().get("Content-Encoding").and_then(|v| v.to_str().ok()),
        Some("gzip")
    );
    let served = body_of(res).await;
    assert!(served.len() < body.len());

    // Without the accept header the raw body is served.
    let res = file_service::handle_file(
        app.clone(),
        "http://t.com/big".to_string(),
        info_for("t.com", "/big"),
    )
    .await;
    assert!(res.headers().get("Content-Encoding").is_none());
    assert_eq!(body_of(res).await, body);
}

#[tokio::test]
async fn test_script_file_executes() {
    let app = test_app();
    seed_script_file(&app, "http://t.com/s", r#"["if", [">", 1, 2], "red", "blue"]"#, &[]);

    let res = file_service::handle_file(app.clone(), "http://t.com/s".to_string(), info_for("t.com", "/s"))
        .await;
    assert_eq!(res.status(), 200);
    assert_eq!(body_of(res).await, b"blue");
}

#[tokio::test]
async fn test_script_output_etag_revalidates() {
    let app = test_app();
    seed_script_file(&app, "http://t.com/s", r#""stable output""#, &[]);

    let res = file_service::handle_file(app.clone(), "http://t.com/s".to_string(), info_for("t.com", "/s"))
        .await;
    let etag = res
        .headers()
        .get("ETag")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap();

    let mut info = info_for("t.com", "/s");
    info.headers.push(("If-None-Match".to_string(), etag));
    let res = file_service::handle_file(app.clone(), "http://t.com/s".to_string(), info).await;
    assert_eq!(res.status(), 304);
}

#[tokio::test]
async fn test_script_error_becomes_500_and_is_logged() {
    let app = test_app();
    seed_script_file(&app, "http://t.com/bad", r#"["throw", "kaput"]"#, &[]);

    let res =
        file_service::handle_file(app.clone(), "http://t.com/bad".to_string(), info_for("t.com", "/bad"))
            .await;
    assert_eq!(res.status(), 500);
    let body = String::from_utf8(body_of(res).await).unwrap();
    assert!(body.starts_with("gisp error:"), "{}", body);
    assert!(body.contains("kaput"));
    assert_eq!(app.log_cache.count(), 1);
}

#[tokio::test]
async fn test_admission_rejects_second_concurrent_run() {
    let app = test_app();
    seed_script_file(
        &app,
        "http://t.com/limited",
        r#""ok""#,
        &[("Portm-Concurrent", "1")],
    );

    // Occupy the single slot the way a long-running execution would.
    assert!(!app.cost.admit("http://t.com/limited", u64::MAX, 1));

    let res = file_service::handle_file(
        app.clone(),
        "http://t.com/limited".to_string(),
        info_for("t.com", "/limited"),
    )
    .await;
    assert_eq!(res.status(), 429);
    assert_eq!(body_of(res).await, b"Too Many Requests");

    // Releasing the slot lets the next request through.
    app.cost.end("http://t.com/limited", 10);
    let res = file_service::handle_file(
        app.clone(),
        "http://t.com/limited".to_string(),
        info_for("t.com", "/limited"),
    )
    .await;
    assert_eq!(res.status(), 200);
}

#[tokio::test]
async fn test_quota_exhaustion_rejects() {
    let app = test_app();
    seed_script_file(
        &app,
        "http://t.com/quota",
        r#""ok""#,
        &[("Portm-Quota", "1")],
    );

    // Burn through the 1ns quota.
    assert!(!app.cost.admit("http://t.com/quota", 1, 10));
    app.cost.end("http://t.com/quota", 50);

    let res = file_service::handle_file(
        app.clone(),
        "http://t.com/quota".to_string(),
        info_for("t.com", "/quota"),
    )
    .await;
    assert_eq!(res.status(), 429);
}

#[tokio::test]
async fn test_proxy_to_file_reenters_pipeline() {
    let app = test_app();
    seed_text_file(&app, "http://h.com/p", b"proxied target");

    let mut rule = File::script_host(
        serde_json::json!(["proxyToFile", "http://h.com/p"]),
        None,
    );
    rule.uri = "http://t.com/api".to_string();
    app.proxy_map.set("http://t.com/api", Arc::new(rule));

    let res = file_service::handle_proxy(
        app.clone(),
        "http://t.com/api/deeper/path".to_string(),
        info_for("t.com", "/api/deeper/path"),
    )
    .await;
    assert_eq!(res.status(), 200);
    assert_eq!(body_of(res).await, b"proxied target");
}

#[tokio::test]
async fn test_proxy_rule_sets_status_and_headers() {
    let app = test_app();
    let mut rule = File::script_host(
        serde_json::json!(["do", ["setStatusCode", 204], ["setResHeader", "X-Rule", "hit"]]),
        None,
    );
    rule.uri = "http://t.com/api".to_string();
    app.proxy_map.set("http://t.com/api", Arc::new(rule));

    let res = file_service::handle_proxy(
        app.clone(),
        "http://t.com/api".to_string(),
        info_for("t.com", "/api"),
    )
    .await;
    assert_eq!(res.status(), 204);
    assert_eq!(
        res.headers().get("X-Rule").and_then(|v| v.to_str().ok()),
        Some("hit")
    );
}

#[tokio::test]
async fn test_proxy_rule_error_is_500_with_stack() {
    let app = test_app();
    let mut rule = File::script_host(serde_json::json!(["throw", "rule broke"]), None);
    rule.uri = "http://t.com/api".to_string();
    app.proxy_map.set("http://t.com/api", Arc::new(rule));

    let res = file_service::handle_proxy(
        app.clone(),
        "http://t.com/api".to_string(),
        info_for("t.com", "/api"),
    )
    .await;
    assert_eq!(res.status(), 500);
    let body = String::from_utf8(body_of(res).await).unwrap();
    assert!(body.starts_with("nisp proxy error:"), "{}", body);
    assert!(body.contains("stack:"), "{}", body);
}

#[tokio::test]
async fn test_overload_sheds_miss_path() {
    let db = sled::Config::new().temporary(true).open().unwrap();
    let mut config = test_config();
    config.overload = 0;
    let app = App::new(config, db).unwrap();

    let res = file_service::handle_file(
        app.clone(),
        "http://t.com/miss".to_string(),
        info_for("t.com", "/miss"),
    )
    .await;
    assert_eq!(res.status(), 429);
    assert_eq!(body_of(res).await, b"Too Many Requests");
}

#[tokio::test]
async fn test_not_found_file_yields_404() {
    let app = test_app();
    let file = Arc::new(File::from_upstream(
        "http://t.com/gone",
        &[("Portm-Not-Found".to_string(), "1".to_string())],
        Vec::new(),
    ));
    app.cache.set("http://t.com/gone", file);

    let res = file_service::handle_file(
        app.clone(),
        "http://t.com/gone".to_string(),
        info_for("t.com", "/gone"),
    )
    .await;
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn test_blacklist_rejects_through_router() {
    let app = test_app();
    seed_text_file(&app, "http://blocked.com/x", b"never served");

    let router = file_service::router(app);
    let req = Request::builder()
        .uri("/x")
        .header("Host", "blocked.com")
        .body(Body::empty())
        .unwrap();
    let res = router.oneshot(req).await.unwrap();
    assert_eq!(res.status(), 429);
    assert_eq!(body_of(res).await, b"\"Forbidden\"");
}

#[tokio::test]
async fn test_router_serves_cached_file_by_host_and_path() {
    let app = test_app();
    seed_text_file(&app, "http://t.com/page", b"routed body");

    let router = file_service::router(app);
    let req = Request::builder()
        .uri("/page?whatever=1")
        .header("Host", "t.com")
        .body(Body::empty())
        .unwrap();
    let res = router.oneshot(req).await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(body_of(res).await, b"routed body");
}

#[tokio::test]
async fn test_hit_counts_accumulate() {
    let app = test_app();
    let file = seed_text_file(&app, "http://t.com/page", b"hello");
    let before = file.count.load(std::sync::atomic::Ordering::Relaxed);

    for _ in 0..3 {
        file_service::handle_file(
            app.clone(),
            "http://t.com/page".to_string(),
            info_for("t.com", "/page"),
        )
        .await;
    }
    assert_eq!(
        file.count.load(std::sync::atomic::Ordering::Relaxed),
        before + 3
    );
}

#[tokio::test]
async fn test_overload_monitor_evicts_after_quiescence() {
    let app = test_app();
    seed_text_file(&app, "http://t.com/flaky", b"stale");
    app.runtime_cache.set(
        "http://t.com/owner",
        "memo",
        &Value::Num(1.0),
        vec!["http://t.com/flaky".to_string()],
    );

    app.monitor
        .report(OverloadOrigin::File, "http://t.com/flaky", false);

    // Still staged during the activity window.
    app.monitor.pop();
    assert!(app.cache.get("http://t.com/flaky").is_some());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    app.monitor.pop();

    assert!(app.cache.get("http://t.com/flaky").is_none());
    assert!(app.runtime_cache.get("http://t.com/owner", "memo").is_none());
}

#[tokio::test]
async fn test_delete_invalidates_every_cache() {
    let app = test_app();
    let uri = "http://t.com/doomed";
    seed_text_file(&app, uri, b"bytes");
    app.glob
        .set(true, "^http://t.com/", vec![uri.to_string(), "http://t.com/other".to_string()]);
    app.runtime_cache
        .set("http://t.com/owner", "memo", &Value::Num(1.0), vec![uri.to_string()]);

    // The doomed file once imported lib, so lib tracks it as a dependent.
    let lib = seed_text_file(&app, "http://t.com/lib", b"x");
    let doomed = app.cache.get(uri).unwrap();
    lib.dependents.add(&doomed);

    // The delete sequence the control plane runs.
    app.glob.del_from_list(uri);
    app.clear_dependents(uri);
    app.cache.del(uri);
    app.runtime_cache.flush(uri);

    assert!(app.cache.get(uri).is_none());
    let list = app.glob.get(true, "^http://t.com/").unwrap();
    assert!(!list.contains(&uri.to_string()));
    assert!(app.runtime_cache.get("http://t.com/owner", "memo").is_none());
    assert!(lib.dependents.is_empty());
}
