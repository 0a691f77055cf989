//! String handling and conversions.

use futures::future::BoxFuture;

use crate::script::error::ScriptError;
use crate::script::value::Value;
use crate::script::Frame;
use crate::util;

use super::{BuiltinFn, Registry};

/// Register the string and conversion operators.
pub fn register(table: &mut Registry) {
    table.insert("str", op_str as BuiltinFn);
    table.insert("float", op_float as BuiltinFn);
    table.insert("boolean", op_boolean as BuiltinFn);
    table.insert("replace", op_replace as BuiltinFn);
    table.insert("startsWith", op_starts_with as BuiltinFn);
    table.insert("compareVersion", op_compare_version as BuiltinFn);
    table.insert("parse", op_parse as BuiltinFn);
    table.insert("stringify", op_stringify as BuiltinFn);
    table.insert("jsonp", op_jsonp as BuiltinFn);
}

fn op_str(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move { Ok(Value::Str(f.arg(1).await?.display())) })
}

/// Numeric coercion used by `float` and the `float` read mode.
pub fn to_float(value: &Value) -> f64 {
    match value {
        Value::Num(n) => *n,
        Value::Str(s) => s.parse().unwrap_or(0.0),
        Value::Bool(true) => 1.0,
        _ => 0.0,
    }
}

/// Boolean coercion used by `boolean` and the `boolean` read mode.
pub fn to_boolean(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Str(s) => s == "true",
        Value::Num(n) => *n != 0.0,
        Value::Null => false,
        _ => true,
    }
}

fn op_float(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move { Ok(Value::Num(to_float(&f.arg(1).await?))) })
}

fn op_boolean(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move { Ok(Value::Bool(to_boolean(&f.arg(1).await?))) })
}

/// `replace(str, find, repl, n=1)`; a negative count replaces every
/// occurrence.
fn op_replace(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let s = f.arg_str(1).await?;
        let find = f.arg_str(2).await?;
        let repl = f.arg_str(3).await?;
        let n = if f.len() > 4 { f.arg_num(4).await? } else { 1.0 };

        let out = if n < 0.0 {
            s.replace(&find, &repl)
        } else {
            s.replacen(&find, &repl, n as usize)
        };
        Ok(Value::Str(out))
    })
}

fn op_starts_with(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let s = f.arg_str(1).await?;
        let prefix = f.arg_str(2).await?;
        Ok(Value::Bool(s.starts_with(&prefix)))
    })
}

fn op_compare_version(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let a = f.arg_str(1).await?;
        let b = f.arg_str(2).await?;
        Ok(Value::Num(util::compare_version(&a, &b) as f64))
    })
}

fn op_parse(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let data = match f.arg(1).await? {
            Value::Str(s) => s.into_bytes(),
            Value::Bytes(b) => b.as_ref().clone(),
            other => {
                return Err(f.error(format!(
                    "parse expects a string or bytes, got {}",
                    other.type_name()
                )))
            }
        };
        match serde_json::from_slice(&data) {
            Ok(json) => Ok(Value::from_ast(&json)),
            Err(err) => Err(f.error(err.to_string())),
        }
    })
}

fn op_stringify(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move { Ok(Value::Str(f.arg(1).await?.to_json().to_string())) })
}

fn op_jsonp(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let name = f.arg_str(1).await?;
        let value = f.arg(2).await?;
        Ok(Value::Str(format!("{}({})", name, value.to_json())))
    })
}
