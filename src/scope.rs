//! Named-value lookup context passed to expression evaluation.
//!
//! A [`Scope`] never mutates its input: every merge produces a new scope,
//! matching the spec's invariant that evaluation never mutates its input
//! scope.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::EvalError;

/// A value bound inside a [`Scope`]: a plain JSON value, a nested scope, or
/// a function from the registry.
#[derive(Clone)]
pub enum ScopeValue {
    Value(Value),
    Scope(Scope),
    Function(Arc<dyn Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync>),
}

impl fmt::Debug for ScopeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeValue::Value(v) => write!(f, "Value({v})"),
            ScopeValue::Scope(s) => write!(f, "Scope({s:?})"),
            ScopeValue::Function(_) => write!(f, "Function(..)"),
        }
    }
}

impl From<Value> for ScopeValue {
    fn from(v: Value) -> Self {
        ScopeValue::Value(v)
    }
}

/// An ordered name -> value mapping. Cheap to clone: the map itself clones,
/// but `Function` bindings are `Arc`-shared.
#[derive(Clone, Debug, Default)]
pub struct Scope {
    bindings: IndexMap<String, ScopeValue>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ScopeValue>) {
        self.bindings.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ScopeValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ScopeValue> {
        self.bindings.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ScopeValue)> {
        self.bindings.iter()
    }

    /// Merges `other` on top of `self`: bindings in `other` override
    /// bindings in `self` with the same name. Neither input is mutated.
    pub fn merged(&self, other: &Scope) -> Scope {
        let mut out = self.clone();
        for (k, v) in other.bindings.iter() {
            out.bindings.insert(k.clone(), v.clone());
        }
        out
    }

    /// Convenience for building a scope from a record, one binding per key.
    pub fn from_record(record: &crate::value::Record) -> Scope {
        let mut scope = Scope::new();
        for (k, v) in record {
            scope.set(k.clone(), v.clone());
        }
        scope
    }
}
