//! Control flow, bindings and the special forms.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value as Json;

use crate::script::error::ScriptError;
use crate::script::scope::Scope;
use crate::script::value::{Lambda, Value};
use crate::script::{eval, Frame};

use super::{BuiltinFn, Registry};

/// Register the core operators.
pub fn register(table: &mut Registry) {
    table.insert("do", op_do as BuiltinFn);
    table.insert("def", op_def as BuiltinFn);
    table.insert("redef", op_redef as BuiltinFn);
    table.insert("if", op_if as BuiltinFn);
    table.insert("switch", op_switch as BuiltinFn);
    table.insert("for", op_for as BuiltinFn);
    table.insert("fn", op_fn as BuiltinFn);
    table.insert("recover", op_recover as BuiltinFn);
    table.insert("throw", op_throw as BuiltinFn);
    table.insert("$", op_quote as BuiltinFn);
    table.insert("help", op_help as BuiltinFn);
    table.insert("&&", op_and as BuiltinFn);
    table.insert("||", op_or as BuiltinFn);
    table.insert("!", op_not as BuiltinFn);
}

fn op_do(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let mut last = Value::Null;
        for i in 1..f.len() {
            last = f.arg(i).await?;
        }
        Ok(last)
    })
}

fn binding_name<'a>(f: &Frame<'a>, i: usize) -> Result<&'a str, ScriptError> {
    match f.raw(i) {
        Some(Json::String(name)) => Ok(name),
        _ => Err(f.error("binding name must be a string literal")),
    }
}

fn op_def(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let name = binding_name(&f, 1)?;
        let value = f.arg(2).await?;
        f.scope.define(name, value.clone());
        Ok(value)
    })
}

fn op_redef(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let name = binding_name(&f, 1)?;
        let value = f.arg(2).await?;
        if !f.scope.assign(name, value.clone()) {
            return Err(f.error(format!("variable not defined: {}", name)));
        }
        Ok(value)
    })
}

fn op_if(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        if f.arg(1).await?.truthy() {
            f.arg(2).await
        } else {
            f.arg(3).await
        }
    })
}

fn op_switch(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let selector = f.arg(1).await?;
        let mut i = 2;
        while i + 1 < f.len() {
            if f.arg(i).await? == selector {
                return f.arg(i + 1).await;
            }
            i += 2;
        }
        // A trailing odd element is the default branch.
        if i < f.len() {
            return f.arg(i).await;
        }
        Ok(Value::Null)
    })
}

fn op_for(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let idx_name = binding_name(&f, 1)?;
        let val_name = binding_name(&f, 2)?;
        let seq = f.arg(3).await?;
        let body = match f.raw(4) {
            Some(body) => body,
            None => return Ok(Value::Null),
        };

        let loop_scope = Scope::child(f.scope);
        let mut last = Value::Null;

        match seq {
            Value::Arr(items) => {
                let snapshot = items.read().clone();
                for (i, item) in snapshot.into_iter().enumerate() {
                    loop_scope.define(idx_name, Value::Num(i as f64));
                    loop_scope.define(val_name, item);
                    last = eval(body, f.ctx, &loop_scope).await?;
                }
            }
            Value::Obj(map) => {
                let snapshot: Vec<(String, Value)> = map
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                for (key, item) in snapshot {
                    loop_scope.define(idx_name, Value::Str(key));
                    loop_scope.define(val_name, item);
                    last = eval(body, f.ctx, &loop_scope).await?;
                }
            }
            other => {
                return Err(f.error(format!(
                    "for expects an array or dict, got {}",
                    other.type_name()
                )))
            }
        }

        Ok(last)
    })
}

fn op_fn(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let params = match f.raw(1) {
            Some(Json::Array(items)) => {
                let mut params = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Json::String(name) => params.push(name.clone()),
                        _ => return Err(f.error("fn parameters must be string literals")),
                    }
                }
                params
            }
            _ => return Err(f.error("fn expects a parameter list")),
        };
        let body = f.raw(2).cloned().unwrap_or(Json::Null);
        Ok(Value::Func(Arc::new(Lambda {
            params,
            body,
            scope: f.scope.clone(),
        })))
    })
}

fn op_recover(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        match f.arg(1).await {
            Ok(value) => Ok(value),
            Err(_) if f.len() > 2 => f.arg(2).await,
            Err(_) => Ok(Value::Null),
        }
    })
}

fn op_throw(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let message = f.arg_str(1).await?;
        Err(f.error(message))
    })
}

fn op_quote(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        Ok(f.raw(1).map(Value::from_ast).unwrap_or(Value::Null))
    })
}

fn op_help(_f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        Ok(Value::arr(
            super::names()
                .into_iter()
                .map(|n| Value::Str(n.to_string()))
                .collect(),
        ))
    })
}

fn op_and(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        for i in 1..f.len() {
            if !f.arg(i).await?.truthy() {
                return Ok(Value::Bool(false));
            }
        }
        Ok(Value::Bool(true))
    })
}

fn op_or(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        for i in 1..f.len() {
            if f.arg(i).await?.truthy() {
                return Ok(Value::Bool(true));
            }
        }
        Ok(Value::Bool(false))
    })
}

fn op_not(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move { Ok(Value::Bool(!f.arg(1).await?.truthy())) })
}
