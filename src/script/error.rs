//! Script evaluation errors.

use thiserror::Error;

/// An error raised during script evaluation, carrying the chain of
/// operator names it bubbled through (innermost first).
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ScriptError {
    /// What went wrong.
    pub message: String,
    /// Operator names from the failure point outwards.
    pub stack: Vec<String>,
}

impl ScriptError {
    /// A fresh error with an empty stack.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: Vec::new(),
        }
    }

    /// Record the operator the error is currently unwinding through.
    pub fn push(mut self, op: &str) -> Self {
        self.stack.push(op.to_string());
        self
    }

    /// Render for the caller: with `lift` the JSON-marshalled stack is
    /// appended to the message.
    pub fn render(&self, lift: bool) -> String {
        if lift {
            let stack = serde_json::to_string(&self.stack).unwrap_or_default();
            format!("{}\nstack: {}", self.message, stack)
        } else {
            self.message.clone()
        }
    }
}
