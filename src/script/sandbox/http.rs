//! Operators over the live request and response.

use futures::future::BoxFuture;

use crate::script::error::ScriptError;
use crate::script::value::Value;
use crate::script::Frame;

use super::strings::{to_boolean, to_float};
use super::{BuiltinFn, Registry};

/// Register the request/response operators.
pub fn register(table: &mut Registry) {
    table.insert("rawQuery", op_raw_query as BuiltinFn);
    table.insert("query", op_query as BuiltinFn);
    table.insert("queries", op_queries as BuiltinFn);
    table.insert("rawBody", op_raw_body as BuiltinFn);
    table.insert("body", op_body as BuiltinFn);
    table.insert("bodies", op_bodies as BuiltinFn);
    table.insert("header", op_header as BuiltinFn);
    table.insert("method", op_method as BuiltinFn);
    table.insert("path", op_path as BuiltinFn);
    table.insert("host", op_host as BuiltinFn);
    table.insert("href", op_href as BuiltinFn);
    table.insert("setResHeader", op_set_res_header as BuiltinFn);
    table.insert("setStatusCode", op_set_status_code as BuiltinFn);
    table.insert("redirect", op_redirect as BuiltinFn);
    table.insert("setReqHost", op_set_req_host as BuiltinFn);
    table.insert("setReqPath", op_set_req_path as BuiltinFn);
    table.insert("setReqHeader", op_set_req_header as BuiltinFn);
    table.insert("proxyToHost", op_proxy_to_host as BuiltinFn);
    table.insert("proxyToFile", op_proxy_to_file as BuiltinFn);
}

/// Apply a `string`/`float`/`boolean` read mode to a raw value.
fn apply_mode(value: Value, mode: &str) -> Value {
    match mode {
        "float" => Value::Num(to_float(&value)),
        "boolean" => Value::Bool(to_boolean(&value)),
        _ => value,
    }
}

fn op_raw_query(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move { Ok(Value::Str(f.ctx.env.req.lock().raw_query.clone())) })
}

/// `query(name, default, mode)`: a parameter of the current argument set,
/// which is the importing URI's query during a `file(..., "code")` run.
fn op_query(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let name = f.arg_str(1).await?;
        let found = f
            .ctx
            .query
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.clone());

        match found {
            Some(v) => {
                let mode = if f.len() > 3 {
                    f.arg_str(3).await?
                } else {
                    String::new()
                };
                Ok(apply_mode(Value::Str(v), &mode))
            }
            None if f.len() > 2 => f.arg(2).await,
            None => Ok(Value::Str(String::new())),
        }
    })
}

fn op_queries(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let name = f.arg_str(1).await?;
        let mode = if f.len() > 2 {
            f.arg_str(2).await?
        } else {
            String::new()
        };
        let values: Vec<Value> = f
            .ctx
            .query
            .iter()
            .filter(|(k, _)| *k == name)
            .map(|(_, v)| apply_mode(Value::Str(v.clone()), &mode))
            .collect();
        Ok(Value::arr(values))
    })
}

fn op_raw_body(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move { Ok(Value::bytes(f.ctx.env.req.lock().body.clone())) })
}

/// `body(name, default, mode)`: a field of the request body; JSON object
/// bodies resolve fields directly, anything else is read as a form.
fn op_body(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let name = f.arg_str(1).await?;
        match f.ctx.env.body_field(&name) {
            Some(value) => {
                let mode = if f.len() > 3 {
                    f.arg_str(3).await?
                } else {
                    String::new()
                };
                Ok(apply_mode(value, &mode))
            }
            None if f.len() > 2 => f.arg(2).await,
            None => Ok(Value::Str(String::new())),
        }
    })
}

fn op_bodies(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let name = f.arg_str(1).await?;
        let mode = if f.len() > 2 {
            f.arg_str(2).await?
        } else {
            String::new()
        };
        let values: Vec<Value> = f
            .ctx
            .env
            .body_fields(&name)
            .into_iter()
            .map(|v| apply_mode(v, &mode))
            .collect();
        Ok(Value::arr(values))
    })
}

fn op_header(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let name = f.arg_str(1).await?;
        match f.ctx.env.req_header(&name) {
            Some(v) => Ok(Value::Str(v)),
            None if f.len() > 2 => f.arg(2).await,
            None => Ok(Value::Str(String::new())),
        }
    })
}

fn op_method(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move { Ok(Value::Str(f.ctx.env.req.lock().method.clone())) })
}

fn op_path(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move { Ok(Value::Str(f.ctx.env.req.lock().path.clone())) })
}

fn op_host(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move { Ok(Value::Str(f.ctx.env.req.lock().host.clone())) })
}

fn op_href(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move { Ok(Value::Str(f.ctx.env.req.lock().href())) })
}

fn op_set_res_header(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let name = f.arg_str(1).await?;
        let value = f.arg_str(2).await?;
        f.ctx.env.res.lock().set_header(&name, &value);
        Ok(Value::Null)
    })
}

fn op_set_status_code(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let code = f.arg_num(1).await?;
        f.ctx.env.res.lock().status = Some(code as u16);
        Ok(Value::Null)
    })
}

fn op_redirect(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let url = f.arg_str(1).await?;
        let code = f.arg_num(2).await?;
        let mut res = f.ctx.env.res.lock();
        res.set_header("Location", &url);
        res.status = Some(code as u16);
        Ok(Value::Null)
    })
}

fn op_set_req_host(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let host = f.arg_str(1).await?;
        f.ctx.env.req.lock().host = host;
        Ok(Value::Null)
    })
}

fn op_set_req_path(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let uri = f.arg_str(1).await?;
        f.ctx.env.set_req_uri(&uri);
        Ok(Value::Null)
    })
}

fn op_set_req_header(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let name = f.arg_str(1).await?;
        let value = f.arg_str(2).await?;
        f.ctx.env.set_req_header(&name, &value);
        Ok(Value::Null)
    })
}

/// `proxyToHost(host, forceHost=true)`: forward the request to another
/// host after the script returns.
fn op_proxy_to_host(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let host = f.arg_str(1).await?;
        let force_host = if f.len() > 2 { f.arg_bool(2).await? } else { true };

        *f.ctx.env.proxy_host.lock() = Some(host.clone());
        if force_host {
            f.ctx.env.req.lock().host = host;
        }
        Ok(Value::Null)
    })
}

fn op_proxy_to_file(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let uri = f.arg_str(1).await?;
        *f.ctx.env.proxy_file.lock() = Some(uri);
        Ok(Value::Null)
    })
}
