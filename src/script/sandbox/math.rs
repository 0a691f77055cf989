//! Arithmetic, comparison and equality operators.

use futures::future::BoxFuture;

use crate::script::error::ScriptError;
use crate::script::value::Value;
use crate::script::Frame;

use super::{BuiltinFn, Registry};

/// Register the arithmetic and comparison operators.
pub fn register(table: &mut Registry) {
    table.insert("+", op_add as BuiltinFn);
    table.insert("-", op_sub as BuiltinFn);
    table.insert("*", op_mul as BuiltinFn);
    table.insert("**", op_pow as BuiltinFn);
    table.insert("/", op_div as BuiltinFn);
    table.insert("%", op_mod as BuiltinFn);
    table.insert("=", op_eq as BuiltinFn);
    table.insert("==", op_eq as BuiltinFn);
    table.insert("!=", op_ne as BuiltinFn);
    table.insert("<", op_lt as BuiltinFn);
    table.insert("<=", op_le as BuiltinFn);
    table.insert(">", op_gt as BuiltinFn);
    table.insert(">=", op_ge as BuiltinFn);
}

async fn eval_args(f: &Frame<'_>) -> Result<Vec<Value>, ScriptError> {
    let mut args = Vec::with_capacity(f.len().saturating_sub(1));
    for i in 1..f.len() {
        args.push(f.arg(i).await?);
    }
    Ok(args)
}

/// `+` sums numbers; any non-numeric argument turns the whole form into
/// string concatenation.
fn op_add(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move {
        let args = eval_args(&f).await?;
        if args.iter().all(|a| matches!(a, Value::Num(_))) {
            let sum = args
                .iter()
                .map(|a| match a {
                    Value::Num(n) => *n,
                    _ => 0.0,
                })
                .sum();
            Ok(Value::Num(sum))
        } else {
            let mut out = String::new();
            for arg in &args {
                out.push_str(&arg.display());
            }
            Ok(Value::Str(out))
        }
    })
}

fn numeric_fold<'a>(
    f: Frame<'a>,
    op: fn(f64, f64) -> f64,
) -> BoxFuture<'a, Result<Value, ScriptError>> {
    Box::pin(async move {
        let mut acc = f.arg_num(1).await?;
        for i in 2..f.len() {
            acc = op(acc, f.arg_num(i).await?);
        }
        Ok(Value::Num(acc))
    })
}

fn op_sub(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    if f.len() == 2 {
        return Box::pin(async move { Ok(Value::Num(-f.arg_num(1).await?)) });
    }
    numeric_fold(f, |a, b| a - b)
}

fn op_mul(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    numeric_fold(f, |a, b| a * b)
}

fn op_pow(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    numeric_fold(f, f64::powf)
}

fn op_div(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    numeric_fold(f, |a, b| a / b)
}

fn op_mod(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    numeric_fold(f, |a, b| a % b)
}

fn op_eq(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move { Ok(Value::Bool(f.arg(1).await? == f.arg(2).await?)) })
}

fn op_ne(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    Box::pin(async move { Ok(Value::Bool(f.arg(1).await? != f.arg(2).await?)) })
}

fn compare<'a>(
    f: Frame<'a>,
    check: fn(std::cmp::Ordering) -> bool,
) -> BoxFuture<'a, Result<Value, ScriptError>> {
    Box::pin(async move {
        let a = f.arg(1).await?;
        let b = f.arg(2).await?;
        match a.compare(&b) {
            Some(ord) => Ok(Value::Bool(check(ord))),
            None => Err(f.error(format!(
                "cannot compare {} with {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    })
}

fn op_lt(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    compare(f, std::cmp::Ordering::is_lt)
}

fn op_le(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    compare(f, std::cmp::Ordering::is_le)
}

fn op_gt(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    compare(f, std::cmp::Ordering::is_gt)
}

fn op_ge(f: Frame<'_>) -> BoxFuture<'_, Result<Value, ScriptError>> {
    compare(f, std::cmp::Ordering::is_ge)
}
