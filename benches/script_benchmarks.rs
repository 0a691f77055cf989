//! Interpreter throughput benchmarks: a trivial conditional and the
//! glob-driven aggregation pipeline, both against preseeded caches.

use std::path::PathBuf;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use portal::app::App;
use portal::config::Config;
use portal::file::File;
use portal::script::{self, RequestInfo, ScriptEnv};

fn bench_app() -> Arc<App> {
    let config = Config {
        addr: "127.0.0.1:0".to_string(),
        file_addr: "127.0.0.1:1".to_string(),
        ctrl_addr: "127.0.0.1:0".to_string(),
        cache_size: 64 * 1024 * 1024,
        glob_cache_size: 16 * 1024 * 1024,
        overload: 300,
        db_path: PathBuf::new(),
        blacklist: Vec::new(),
    };
    let db = sled::Config::new().temporary(true).open().unwrap();
    App::new(config, db).unwrap()
}

fn script_file(code: &str) -> Arc<File> {
    Arc::new(File::from_upstream(
        "",
        &[("Portm-Type".to_string(), "Script".to_string())],
        code.as_bytes().to_vec(),
    ))
}

fn env_with_query(app: &Arc<App>, raw_query: &str) -> Arc<ScriptEnv> {
    ScriptEnv::new(
        app.clone(),
        RequestInfo {
            method: "GET".to_string(),
            scheme: "http".to_string(),
            host: "bench".to_string(),
            path: "/".to_string(),
            raw_query: raw_query.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        },
    )
}

fn bench_simple(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let app = bench_app();
    let file = script_file(r#"["if", [">", 1, 2], "red", "blue"]"#);

    c.bench_function("simple_conditional", |b| {
        b.iter(|| {
            let env = env_with_query(&app, "");
            let body = rt.block_on(script::run_file(&file, &env, false)).unwrap();
            assert_eq!(body, b"blue");
        })
    });
}

fn bench_complex(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let app = bench_app();

    for name in ["a", "b", "c", "d"] {
        let uri = format!("http://portal-portm.meituan.com/horn/{}", name);
        app.cache
            .set(&uri, Arc::new(File::from_upstream(&uri, &[], Vec::new())));
    }
    app.glob.set(
        true,
        "^http://portal-portm.meituan.com/horn/v1/public",
        vec![
            "http://portal-portm.meituan.com/horn/a".to_string(),
            "http://portal-portm.meituan.com/horn/b".to_string(),
        ],
    );
    app.glob.set(
        true,
        "^http://portal-portm.meituan.com/horn/v1/modules/all",
        vec![
            "http://portal-portm.meituan.com/horn/c".to_string(),
            "http://portal-portm.meituan.com/horn/d".to_string(),
        ],
    );

    let file = script_file(
        r#"[
        "do",
        ["def", "version", ["query", "query.version"]],
        ["def", "from", ["query", "query.from"]],
        ["def", "fileList", ["concat",
            ["glob", ["+", "^", "http://portal-portm.meituan.com/horn/", ["version"], "/public"]],
            ["glob", ["+", "^", "http://portal-portm.meituan.com/horn/", ["version"], "/modules/", ["from"]]]
        ]],
        ["def", "analytics", ["get", ["fileList"], "0"]],
        ["for", "i", "path", ["fileList"],
            ["if",
                [">", ["file", ["path"], "modifyTime"], ["file", ["analytics"], "modifyTime"]],
                ["redef", "analytics", ["path"]]
            ]
        ],
        [":",
            "docId", ["file", ["analytics"], "id"],
            "rootId", ["file", ["analytics"], "rootId"],
            "cacheDuration", 10,
            "pollDuration", 20,
            "pollPeriod", ["|", "10:00", "13:00", "16:00", "21:00"],
            "overTime", false
        ]
    ]"#,
    );

    c.bench_function("glob_aggregation_pipeline", |b| {
        b.iter(|| {
            let env = env_with_query(&app, "query.version=v1&query.from=all");
            let body = rt
                .block_on(script::run_file(&file, &env, true))
                .unwrap();
            assert!(!body.is_empty());
        })
    });
}

criterion_group!(benches, bench_simple, bench_complex);
criterion_main!(benches);
