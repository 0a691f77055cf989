//! The builtin sandbox: the fixed vocabulary scripts may call.
//!
//! Builtins are grouped by concern; each group registers its operators
//! into the shared table. The table is built once per process; scripts
//! cannot extend it, only shadow names with their own bindings.

mod collections;
mod core;
mod http;
mod io;
mod math;
mod strings;

use std::collections::HashMap;

use futures::future::BoxFuture;
use once_cell::sync::Lazy;

use super::error::ScriptError;
use super::value::Value;
use super::Frame;

/// Signature every builtin operator implements.
pub type BuiltinFn = for<'a> fn(Frame<'a>) -> BoxFuture<'a, Result<Value, ScriptError>>;

/// Registration hook each builtin group exposes.
pub type Registry = HashMap<&'static str, BuiltinFn>;

static SANDBOX: Lazy<Registry> = Lazy::new(|| {
    let mut table = Registry::new();
    core::register(&mut table);
    math::register(&mut table);
    collections::register(&mut table);
    strings::register(&mut table);
    io::register(&mut table);
    http::register(&mut table);
    table
});

/// Resolve a builtin by name.
pub fn lookup(name: &str) -> Option<BuiltinFn> {
    SANDBOX.get(name).copied()
}

/// All builtin names, sorted.
pub fn names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = SANDBOX.keys().copied().collect();
    names.sort_unstable();
    names
}
