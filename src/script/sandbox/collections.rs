//! Array and dict operators.

use std::collections::BTreeMap;

use futures::future::BoxFuture;

use crate::script::error::ScriptError;
use crate::script::value::Value;
use crate::script::Frame;

use super::{BuiltinFn, Registry};

/// Register the collection operators.
pub fn register(table: &mut Registry) {
    table.insert("get", op_get as BuiltinFn);
    table.insert("set", op_set as BuiltinFn);
    table.insert("len", op_len as BuiltinFn);
    table.insert("includes", op_includes as BuiltinFn);
    table.insert("|", op_arr as BuiltinFn);
    table.insert(":", op_dict as BuiltinFn);
    table.insert("concat", op_concat as BuiltinFn);
    table.insert("append", op_append as BuiltinFn);
    table.insert("slice", op_slice as BuiltinFn);
    table.insert("indexOf", op_index_of as BuiltinFn);
    table.insert("split", op_split as BuiltinFn);
}

fn index_of_key(key: &Value) -> Option<usize> {
    match key {
        Value::Num(n) if *n >= 0.0 => Some(*n as usize),
        Value::Str(s) => s.parse().ok(),
        _ => None,
    }
}

fn op_get(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let container = f.arg(1).await?;
        let key = f.arg(2).await?;
        match container {
            Value::Obj(map) => Ok(map.read().get(&key.display()).cloned().unwrap_or_default()),
            Value::Arr(items) => {
                let index = match index_of_key(&key) {
                    Some(i) => i,
                    None => return Ok(Value::Null),
                };
                Ok(items.read().get(index).cloned().unwrap_or_default())
            }
            other => Err(f.error(format!(
                "get expects an array or dict, got {}",
                other.type_name()
            ))),
        }
    })
}

fn op_set(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let container = f.arg(1).await?;
        let key = f.arg(2).await?;
        let value = f.arg(3).await?;
        match &container {
            Value::Obj(map) => {
                map.write().insert(key.display(), value);
            }
            Value::Arr(items) => {
                let index = index_of_key(&key)
                    .ok_or_else(|| f.error("set expects a numeric array index"))?;
                let mut items = items.write();
                if index < items.len() {
                    items[index] = value;
                } else if index == items.len() {
                    items.push(value);
                } else {
                    return Err(f.error(format!("index {} out of range", index)));
                }
            }
            other => {
                return Err(f.error(format!(
                    "set expects an array or dict, got {}",
                    other.type_name()
                )))
            }
        }
        Ok(container)
    })
}

fn op_len(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let len = match f.arg(1).await? {
            Value::Arr(items) => items.read().len(),
            Value::Obj(map) => map.read().len(),
            Value::Str(s) => s.len(),
            Value::Bytes(b) => b.len(),
            Value::Null => 0,
            other => {
                return Err(f.error(format!("len has no meaning for {}", other.type_name())))
            }
        };
        Ok(Value::Num(len as f64))
    })
}

fn op_includes(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let container = f.arg(1).await?;
        let needle = f.arg(2).await?;
        let found = match &container {
            Value::Arr(items) => items.read().iter().any(|v| *v == needle),
            Value::Str(s) => s.contains(&needle.display()),
            other => {
                return Err(f.error(format!(
                    "includes expects an array or string, got {}",
                    other.type_name()
                )))
            }
        };
        Ok(Value::Bool(found))
    })
}

fn op_arr(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let mut items = Vec::with_capacity(f.len().saturating_sub(1));
        for i in 1..f.len() {
            items.push(f.arg(i).await?);
        }
        Ok(Value::arr(items))
    })
}

fn op_dict(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let mut map = BTreeMap::new();
        let mut i = 1;
        while i + 1 < f.len() {
            let key = f.arg_str(i).await?;
            let value = f.arg(i + 1).await?;
            map.insert(key, value);
            i += 2;
        }
        Ok(Value::obj(map))
    })
}

fn op_concat(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let mut out = Vec::new();
        for i in 1..f.len() {
            out.extend(f.arg_arr(i).await?);
        }
        Ok(Value::arr(out))
    })
}

fn op_append(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let mut out = f.arg_arr(1).await?;
        for i in 2..f.len() {
            out.push(f.arg(i).await?);
        }
        Ok(Value::arr(out))
    })
}

fn op_slice(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let target = f.arg(1).await?;
        let left = if f.len() > 2 { f.arg_num(2).await?.max(0.0) as usize } else { 0 };
        let right_arg = if f.len() > 3 {
            Some(f.arg_num(3).await?.max(0.0) as usize)
        } else {
            None
        };
        match target {
            Value::Arr(items) => {
                let items = items.read();
                let right = right_arg.unwrap_or(items.len()).min(items.len());
                let left = left.min(right);
                Ok(Value::arr(items[left..right].to_vec()))
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let right = right_arg.unwrap_or(chars.len()).min(chars.len());
                let left = left.min(right);
                Ok(Value::Str(chars[left..right].iter().collect()))
            }
            other => Err(f.error(format!(
                "slice expects an array or string, got {}",
                other.type_name()
            ))),
        }
    })
}

fn op_index_of(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let container = f.arg(1).await?;
        let needle = f.arg(2).await?;
        let index = match &container {
            Value::Arr(items) => items
                .read()
                .iter()
                .position(|v| *v == needle)
                .map(|i| i as f64)
                .unwrap_or(-1.0),
            Value::Str(s) => s
                .find(&needle.display())
                .map(|i| i as f64)
                .unwrap_or(-1.0),
            other => {
                return Err(f.error(format!(
                    "indexOf expects an array or string, got {}",
                    other.type_name()
                )))
            }
        };
        Ok(Value::Num(index))
    })
}

fn op_split(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let s = f.arg_str(1).await?;
        let sep = f.arg_str(2).await?;
        let parts: Vec<Value> = if sep.is_empty() {
            s.chars().map(|c| Value::Str(c.to_string())).collect()
        } else {
            s.split(&sep).map(|p| Value::Str(p.to_string())).collect()
        };
        Ok(Value::arr(parts))
    })
}
