//! Runtime values of the script language.
//!
//! The AST itself is plain `serde_json::Value`; evaluation produces this
//! richer `Value` which additionally carries raw bytes and callable
//! lambdas. Arrays and dicts are shared mutable references, so bindings
//! observe in-place mutation the way scripts expect; data handed out from
//! caches is deep-cloned first to keep cached state isolated.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value as Json;

use super::scope::Scope;

/// A lambda created by `fn`, closing over its definition scope.
pub struct Lambda {
    /// Parameter names.
    pub params: Vec<String>,
    /// Body AST.
    pub body: Json,
    /// Captured scope.
    pub scope: Arc<Scope>,
}

/// A runtime value.
#[derive(Clone, Default)]
pub enum Value {
    /// Absence of a value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Double-precision number; integers are whole floats.
    Num(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes, e.g. file bodies and `request` responses.
    Bytes(Arc<Vec<u8>>),
    /// Shared mutable array.
    Arr(Arc<RwLock<Vec<Value>>>),
    /// Shared mutable dict with sorted keys.
    Obj(Arc<RwLock<BTreeMap<String, Value>>>),
    /// Callable lambda.
    Func(Arc<Lambda>),
}

impl Value {
    /// Wrap a vector as a shared array value.
    pub fn arr(items: Vec<Value>) -> Value {
        Value::Arr(Arc::new(RwLock::new(items)))
    }

    /// Wrap a map as a shared dict value.
    pub fn obj(map: BTreeMap<String, Value>) -> Value {
        Value::Obj(Arc::new(RwLock::new(map)))
    }

    /// Wrap owned bytes.
    pub fn bytes(data: Vec<u8>) -> Value {
        Value::Bytes(Arc::new(data))
    }

    /// Convert an AST subtree into a runtime value without evaluating it.
    pub fn from_ast(ast: &Json) -> Value {
        match ast {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => Value::Num(n.as_f64().unwrap_or(0.0)),
            Json::String(s) => Value::Str(s.clone()),
            Json::Array(items) => Value::arr(items.iter().map(Value::from_ast).collect()),
            Json::Object(map) => Value::obj(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_ast(v)))
                    .collect(),
            ),
        }
    }

    /// Render as JSON. Whole numbers become JSON integers so `10.0`
    /// serialises as `10`; bytes become strings; lambdas become null.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Num(n) => num_to_json(*n),
            Value::Str(s) => Json::String(s.clone()),
            Value::Bytes(b) => Json::String(String::from_utf8_lossy(b).into_owned()),
            Value::Arr(items) => {
                Json::Array(items.read().iter().map(|v| v.to_json()).collect())
            }
            Value::Obj(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map.read().iter() {
                    out.insert(k.clone(), v.to_json());
                }
                Json::Object(out)
            }
            Value::Func(_) => Json::Null,
        }
    }

    /// Structure-copying clone; shared arrays and dicts are duplicated so
    /// the result is disconnected from the source.
    pub fn deep_clone(&self) -> Value {
        match self {
            Value::Arr(items) => {
                Value::arr(items.read().iter().map(|v| v.deep_clone()).collect())
            }
            Value::Obj(map) => Value::obj(
                map.read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_clone()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Truthiness: only `null` and `false` are false.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    /// Human-readable name of the value's type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Num(_) => "number",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Arr(_) => "array",
            Value::Obj(_) => "dict",
            Value::Func(_) => "function",
        }
    }

    /// String conversion used by string-building builtins: strings pass
    /// through, numbers drop the trailing `.0`, structures render as JSON.
    pub fn display(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Num(n) => fmt_num(*n),
            Value::Str(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Arr(_) | Value::Obj(_) => self.to_json().to_string(),
            Value::Func(_) => "<fn>".to_string(),
        }
    }

    /// Ordering for the comparison operators. Numbers compare numerically,
    /// strings lexicographically; anything else has no ordering.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Num(a), Value::Num(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Format a number the way the wire expects: no `.0` on whole values.
pub fn fmt_num(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 9.007_199_254_740_992e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn num_to_json(n: f64) -> Json {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 9.007_199_254_740_992e15 {
        Json::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Json::Number)
            .unwrap_or(Json::Null)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Arr(a), Value::Arr(b)) => {
                Arc::ptr_eq(a, b) || *a.read() == *b.read()
            }
            (Value::Obj(a), Value::Obj(b)) => {
                Arc::ptr_eq(a, b) || *a.read() == *b.read()
            }
            (Value::Func(a), Value::Func(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Func(l) => write!(f, "<fn({})>", l.params.join(", ")),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

/// Estimated heap bytes of a value, for cache budgeting.
pub fn value_mem_size(v: &Value) -> usize {
    match v {
        Value::Null | Value::Bool(_) | Value::Num(_) => 16,
        Value::Str(s) => s.len() + 24,
        Value::Bytes(b) => b.len() + 24,
        Value::Arr(items) => items.read().iter().map(value_mem_size).sum::<usize>() + 32,
        Value::Obj(map) => map
            .read()
            .iter()
            .map(|(k, v)| k.len() + value_mem_size(v))
            .sum::<usize>()
            + 32,
        Value::Func(_) => 64,
    }
}
