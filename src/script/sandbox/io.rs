//! I/O and environment operators: logging, file access, glob queries,
//! memoisation and outbound requests.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use once_cell::sync::Lazy;

use crate::file::FileType;
use crate::overload::OverloadOrigin;
use crate::script::error::ScriptError;
use crate::script::scope::Scope;
use crate::script::value::Value;
use crate::script::{eval, EvalCtx, Frame, MAX_FILE_STACK_DEPTH};
use crate::util;

use super::{BuiltinFn, Registry};

const MAX_REQUEST_BODY: usize = 1024 * 1024;

static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .expect("http client")
});

/// Register the I/O operators.
pub fn register(table: &mut Registry) {
    table.insert("log", op_log as BuiltinFn);
    table.insert("fileExists", op_file_exists as BuiltinFn);
    table.insert("file", op_file as BuiltinFn);
    table.insert("glob", op_glob as BuiltinFn);
    table.insert("cache", op_cache as BuiltinFn);
    table.insert("request", op_request as BuiltinFn);
    table.insert("rand", op_rand as BuiltinFn);
    table.insert("uuid", op_uuid as BuiltinFn);
    table.insert("now", op_now as BuiltinFn);
    table.insert("hash", op_hash as BuiltinFn);
}

fn op_log(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let value = f.arg(1).await?;
        f.ctx.env.log_value(&value);
        Ok(value)
    })
}

fn op_file_exists(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let uri = f.arg_str(1).await?;
        let file = f.ctx.env.app.get_file(&uri).await;
        Ok(Value::Bool(file.file_type != FileType::NotFound))
    })
}

/// `file(uri, mode)`: read another file. The default mode returns the raw
/// body; `code` switches execution into the file with the URI's query as
/// its argument set; the metadata modes return single fields.
fn op_file(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let uri = f.arg_str(1).await?;
        let mode = match f.arg(2).await? {
            Value::Null => "binary".to_string(),
            other => other.display(),
        };

        let file = f.ctx.env.app.get_file(&uri).await;
        if file.file_type == FileType::NotFound {
            return Ok(Value::Null);
        }

        file.dependents.add(&f.ctx.file);

        match mode.as_str() {
            "json" => Ok(file
                .json_body()
                .map(Value::from_ast)
                .unwrap_or(Value::Null)),
            "code" => {
                if f.ctx.depth >= MAX_FILE_STACK_DEPTH {
                    return Err(f.error(format!(
                        "file execution stack exceeded the limit: {}",
                        file.uri
                    )));
                }
                let code = match &file.code {
                    Some(code) => code.clone(),
                    None => return Ok(Value::Null),
                };
                let (_, query) = util::split_uri(&uri);
                let ctx = EvalCtx {
                    env: f.ctx.env.clone(),
                    file: file.clone(),
                    query: Arc::new(util::parse_query(query)),
                    depth: f.ctx.depth + 1,
                };
                let scope = Scope::new_root();
                eval(&code, &ctx, &scope).await
            }
            "type" => Ok(Value::Str(file.file_type.as_str().to_string())),
            "id" => Ok(Value::Str(file.id.clone())),
            "modifierId" => Ok(Value::Str(file.modifier_id.clone())),
            "rootId" => Ok(Value::Str(file.root_id.clone())),
            "modifyTime" => Ok(Value::Str(file.modify_time.clone())),
            _ => Ok(file
                .body
                .as_ref()
                .map(|b| Value::Bytes(b.clone()))
                .unwrap_or(Value::Null)),
        }
    })
}

fn list_value(list: &[String]) -> Value {
    Value::arr(list.iter().map(|u| Value::Str(u.clone())).collect())
}

/// `glob(pattern, order)`: the ordered URI list matching a pattern, from
/// cache or filled once from the store. Under a miss storm the fill is
/// shed and an empty list returned.
fn op_glob(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let pattern = f.arg_str(1).await?;
        let mut is_desc = true;
        if f.len() > 2 && f.arg_str(2).await? == "asc" {
            is_desc = false;
        }

        let app = f.ctx.env.app.clone();

        if let Some(list) = app.glob.get(is_desc, &pattern) {
            return Ok(list_value(&list));
        }

        let permit = app.glob.begin_fill();
        if permit.is_none() {
            return Ok(Value::arr(Vec::new()));
        }

        let _fill = app.glob.fill_lock.lock().await;

        if let Some(list) = app.glob.get(is_desc, &pattern) {
            return Ok(list_value(&list));
        }

        let order = if is_desc { "desc" } else { "asc" };
        let code = serde_json::json!([
            "map",
            ["globFile", pattern.as_str(), order],
            ["iteratee", "uri"]
        ])
        .to_string();

        match app.rpc::<Vec<String>>(&code).await {
            Ok(list) => {
                app.glob.set(is_desc, &pattern, list.clone());
                Ok(list_value(&list))
            }
            Err(err) => {
                app.monitor.report(OverloadOrigin::Glob, &pattern, is_desc);
                Err(f.error(err.to_string()))
            }
        }
    })
}

/// `cache(key, deps, value)`: memoise a value under the current file's
/// URI, invalidated whenever a URI matching one of `deps` changes.
fn op_cache(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let key = f.arg_str(1).await?;
        let owner = f.ctx.file.uri.clone();
        let app = f.ctx.env.app.clone();

        if let Some(value) = app.runtime_cache.get(&owner, &key) {
            return Ok(value);
        }

        let deps: Vec<String> = f.arg_arr(2).await?.iter().map(|v| v.display()).collect();
        let value = f.arg(3).await?;
        app.runtime_cache.set(&owner, &key, &value, deps);
        Ok(value)
    })
}

/// `request(method, url, headers, body)`: outbound HTTP with a bounded
/// response body.
fn op_request(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let method = f.arg_str(1).await?;
        let url = f.arg_str(2).await?;
        let headers = f.arg(3).await?;
        let body = f.arg(4).await?;

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|err| f.error(err.to_string()))?;

        let mut req = HTTP_CLIENT.request(method, &url);
        if let Value::Obj(map) = &headers {
            let snapshot: Vec<(String, String)> = map
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.display()))
                .collect();
            for (k, v) in &snapshot {
                req = req.header(k.as_str(), v.as_str());
            }
        }
        if !matches!(body, Value::Null) {
            req = req.body(body.display());
        }

        let mut res = req.send().await.map_err(|err| f.error(err.to_string()))?;

        let mut out = Vec::new();
        loop {
            let chunk = match res.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => return Err(f.error(err.to_string())),
            };
            if out.len() + chunk.len() > MAX_REQUEST_BODY {
                return Err(f.error(format!(
                    "max request body {} byte exceeded",
                    MAX_REQUEST_BODY
                )));
            }
            out.extend_from_slice(&chunk);
        }

        Ok(Value::bytes(out))
    })
}

fn op_rand(_f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move { Ok(Value::Num(rand::random::<f64>())) })
}

fn op_uuid(_f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move { Ok(Value::Str(uuid::Uuid::new_v4().to_string())) })
}

fn op_now(_f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move { Ok(Value::Str(chrono::Local::now().to_string())) })
}

/// `hash(str)`: CRC32 of the string scaled into `[0, 1]`.
fn op_hash(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let s = f.arg_str(1).await?;
        Ok(Value::Num(util::crc32(s.as_bytes()) as f64 / u32::MAX as f64))
    })
}
