//! The sandboxed S-expression interpreter.
//!
//! A script is a JSON document: an array whose head is a string is a form
//! naming an operator, every other JSON value is a literal. Operators
//! resolve against the scope chain first (so user bindings shadow) and
//! the fixed builtin sandbox second. Builtins receive the raw call frame
//! and decide themselves when to evaluate argument subtrees.
//!
//! Each request carries its own evaluation state: scope chain, operator
//! budget, import depth and the request/response environment.

pub mod env;
pub mod error;
pub mod sandbox;
pub mod scope;
pub mod value;

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value as Json;

use crate::file::File;
use crate::util;

pub use env::{RequestInfo, ScriptEnv, MAX_FILE_STACK_DEPTH, MAX_FN_RUN_COUNT};
pub use error::ScriptError;
pub use scope::Scope;
pub use value::{Lambda, Value};

/// Evaluation context of one script body. Imports fork it with the
/// imported file, its query arguments and an incremented depth; the
/// environment stays shared.
#[derive(Clone)]
pub struct EvalCtx {
    /// Shared request environment.
    pub env: Arc<ScriptEnv>,
    /// File whose code is being evaluated.
    pub file: Arc<File>,
    /// Argument set: the query parameters of the current file's URI.
    pub query: Arc<Vec<(String, String)>>,
    /// Import depth, zero at the entry script.
    pub depth: u32,
}

/// One operator invocation: the raw form plus everything needed to
/// evaluate its argument subtrees on demand.
pub struct Frame<'a> {
    /// Evaluation context.
    pub ctx: &'a EvalCtx,
    /// Scope the form is evaluated in.
    pub scope: &'a Arc<Scope>,
    /// The full form, head included.
    pub form: &'a [Json],
    /// Operator name, for errors.
    pub name: &'a str,
}

impl<'a> Frame<'a> {
    /// Number of elements in the form, head included.
    pub fn len(&self) -> usize {
        self.form.len()
    }

    /// Whether the form has no arguments.
    pub fn is_empty(&self) -> bool {
        self.form.len() <= 1
    }

    /// The raw, unevaluated subtree at position `i`.
    pub fn raw(&self, i: usize) -> Option<&'a Json> {
        self.form.get(i)
    }

    /// Evaluate the subtree at position `i`; missing positions are null.
    pub async fn arg(&self, i: usize) -> Result<Value, ScriptError> {
        match self.form.get(i) {
            Some(ast) => eval(ast, self.ctx, self.scope).await,
            None => Ok(Value::Null),
        }
    }

    /// Evaluate position `i` and render it as a string.
    pub async fn arg_str(&self, i: usize) -> Result<String, ScriptError> {
        Ok(self.arg(i).await?.display())
    }

    /// Evaluate position `i` as a number.
    pub async fn arg_num(&self, i: usize) -> Result<f64, ScriptError> {
        match self.arg(i).await? {
            Value::Num(n) => Ok(n),
            other => Err(self.error(format!("expected number, got {}", other.type_name()))),
        }
    }

    /// Evaluate position `i` as a boolean.
    pub async fn arg_bool(&self, i: usize) -> Result<bool, ScriptError> {
        match self.arg(i).await? {
            Value::Bool(b) => Ok(b),
            other => Err(self.error(format!("expected boolean, got {}", other.type_name()))),
        }
    }

    /// Evaluate position `i` as an array and snapshot its elements.
    pub async fn arg_arr(&self, i: usize) -> Result<Vec<Value>, ScriptError> {
        match self.arg(i).await? {
            Value::Arr(items) => Ok(items.read().clone()),
            other => Err(self.error(format!("expected array, got {}", other.type_name()))),
        }
    }

    /// An error positioned at this operator.
    pub fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::new(message)
    }
}

fn charge(ctx: &EvalCtx) -> Result<(), ScriptError> {
    use std::sync::atomic::Ordering;
    let n = ctx.env.fn_run_count.fetch_add(1, Ordering::Relaxed) + 1;
    if n > MAX_FN_RUN_COUNT {
        return Err(ScriptError::new("max function run count exceeded"));
    }
    Ok(())
}

/// Evaluate one AST node.
pub fn eval<'a>(
    ast: &'a Json,
    ctx: &'a EvalCtx,
    scope: &'a Arc<Scope>,
) -> BoxFuture<'a, Result<Value, ScriptError>> {
    Box::pin(async move {
        let items = match ast {
            Json::Array(items) if !items.is_empty() => items,
            _ => return Ok(Value::from_ast(ast)),
        };

        match &items[0] {
            Json::String(name) => eval_named(name, items, ctx, scope).await,
            Json::Array(_) => {
                charge(ctx)?;
                let head = eval(&items[0], ctx, scope).await?;
                match head {
                    Value::Func(f) => {
                        let mut args = Vec::with_capacity(items.len() - 1);
                        for item in &items[1..] {
                            args.push(eval(item, ctx, scope).await?);
                        }
                        apply(&f, args, ctx).await
                    }
                    other => Ok(other),
                }
            }
            // A plain data array, e.g. [1, 2, 3].
            _ => Ok(Value::from_ast(ast)),
        }
    })
}

async fn eval_named(
    name: &str,
    items: &[Json],
    ctx: &EvalCtx,
    scope: &Arc<Scope>,
) -> Result<Value, ScriptError> {
    charge(ctx)?;

    if let Some(bound) = scope.lookup(name) {
        return match bound {
            Value::Func(f) => {
                let mut args = Vec::with_capacity(items.len() - 1);
                for item in &items[1..] {
                    args.push(eval(item, ctx, scope).await?);
                }
                apply(&f, args, ctx).await.map_err(|e| e.push(name))
            }
            other => Ok(other),
        };
    }

    if let Some(builtin) = sandbox::lookup(name) {
        let frame = Frame {
            ctx,
            scope,
            form: items,
            name,
        };
        return builtin(frame).await.map_err(|e| e.push(name));
    }

    Err(ScriptError::new(format!(
        "function or variable not defined: {}",
        name
    )))
}

/// Call a lambda with already-evaluated arguments.
pub fn apply<'a>(
    f: &'a Arc<Lambda>,
    args: Vec<Value>,
    ctx: &'a EvalCtx,
) -> BoxFuture<'a, Result<Value, ScriptError>> {
    Box::pin(async move {
        let scope = Scope::child(&f.scope);
        for (i, param) in f.params.iter().enumerate() {
            scope.define(param, args.get(i).cloned().unwrap_or_default());
        }
        eval(&f.body, ctx, &scope).await
    })
}

/// Run a file's script against an environment. The returned error is
/// already rendered; with `lift_err` the operator stack is appended.
pub async fn run_file(
    file: &Arc<File>,
    env: &Arc<ScriptEnv>,
    lift_err: bool,
) -> Result<Vec<u8>, String> {
    let code = match &file.code {
        Some(code) => code,
        None => return Ok(Vec::new()),
    };

    let raw_query = env.req.lock().raw_query.clone();
    let ctx = EvalCtx {
        env: env.clone(),
        file: file.clone(),
        query: Arc::new(util::parse_query(&raw_query)),
        depth: 0,
    };
    let scope = Scope::new_root();

    match eval(code, &ctx, &scope).await {
        Ok(value) => Ok(finish(value, env)),
        Err(err) => Err(err.render(lift_err)),
    }
}

/// Coerce the final script value into response bytes and prepend the log
/// section when `log` was used.
fn finish(value: Value, env: &ScriptEnv) -> Vec<u8> {
    let body = match value {
        Value::Bytes(b) => Arc::try_unwrap(b).unwrap_or_else(|shared| shared.as_ref().clone()),
        Value::Str(s) => s.into_bytes(),
        other => serde_json::to_vec(&other.to_json()).unwrap_or_default(),
    };

    if env.has_log.load(std::sync::atomic::Ordering::Relaxed) {
        let log = env.log_buf.lock();
        let mut out = Vec::with_capacity(body.len() + log.len() + 32);
        out.extend_from_slice(b"gisp log:\n");
        out.extend_from_slice(&log);
        out.extend_from_slice(b"\ngisp value:\n");
        out.extend_from_slice(&body);
        out
    } else {
        body
    }
}
