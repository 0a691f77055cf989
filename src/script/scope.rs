//! Lexical scope chain.
//!
//! Scopes form a linked chain of frames: `def` creates in the current
//! frame (shadowing outer bindings), `redef` mutates the nearest frame
//! that already holds the name. Lambdas and file imports get child frames.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::value::Value;

/// One frame in the scope chain.
pub struct Scope {
    vars: Mutex<HashMap<String, Value>>,
    parent: Option<Arc<Scope>>,
}

impl Scope {
    /// A frame with no parent.
    pub fn new_root() -> Arc<Scope> {
        Arc::new(Scope {
            vars: Mutex::new(HashMap::new()),
            parent: None,
        })
    }

    /// A child frame seeing everything in `parent`.
    pub fn child(parent: &Arc<Scope>) -> Arc<Scope> {
        Arc::new(Scope {
            vars: Mutex::new(HashMap::new()),
            parent: Some(parent.clone()),
        })
    }

    /// Walk the chain for a binding.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.vars.lock().get(name) {
            return Some(v.clone());
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    /// Create or shadow a binding in this frame.
    pub fn define(&self, name: &str, value: Value) {
        self.vars.lock().insert(name.to_string(), value);
    }

    /// Mutate the nearest frame holding `name`. Returns false when no
    /// frame holds it.
    pub fn assign(&self, name: &str, value: Value) -> bool {
        {
            let mut vars = self.vars.lock();
            if vars.contains_key(name) {
                vars.insert(name.to_string(), value);
                return true;
            }
        }
        match &self.parent {
            Some(p) => p.assign(name, value),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_and_lookup() {
        let root = Scope::new_root();
        root.define("a", Value::Num(1.0));
        assert_eq!(root.lookup("a"), Some(Value::Num(1.0)));
        assert_eq!(root.lookup("b"), None);
    }

    #[test]
    fn test_child_sees_parent() {
        let root = Scope::new_root();
        root.define("a", Value::Num(1.0));
        let child = Scope::child(&root);
        assert_eq!(child.lookup("a"), Some(Value::Num(1.0)));
    }

    #[test]
    fn test_define_shadows() {
        let root = Scope::new_root();
        root.define("a", Value::Num(1.0));
        let child = Scope::child(&root);
        child.define("a", Value::Num(2.0));
        assert_eq!(child.lookup("a"), Some(Value::Num(2.0)));
        assert_eq!(root.lookup("a"), Some(Value::Num(1.0)));
    }

    #[test]
    fn test_assign_mutates_nearest() {
        let root = Scope::new_root();
        root.define("a", Value::Num(1.0));
        let child = Scope::child(&root);
        assert!(child.assign("a", Value::Num(3.0)));
        assert_eq!(root.lookup("a"), Some(Value::Num(3.0)));
        assert!(!child.assign("missing", Value::Null));
    }
}
