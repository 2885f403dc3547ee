//! The embedded expression DSL: a small, intentionally limited interpreter
//! standing in for the "expression evaluator" the spec treats as an
//! external collaborator (opaque expression string + scope -> value).
//!
//! Grammar (highest to lowest precedence): primary / postfix (`.attr`,
//! `[index]`, `(call, args)`) > unary (`!`, `-`) > `* / %` > `+ -` >
//! comparisons > `&&` > `||`. This is deliberately not a sandboxed version
//! of any host language — arithmetic, comparison, attribute/index access,
//! and calls into a fixed function registry are all it supports.

mod ast;
mod builtins;
mod eval;
mod lexer;
mod parser;

use serde_json::Value;

use crate::error::EvalError;
use crate::scope::Scope;

/// A compiled expression: its AST plus the original source text (kept for
/// error messages and config round-tripping).
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: ast::Ast,
}

impl Expression {
    pub fn parse(source: impl Into<String>) -> Result<Self, EvalError> {
        let source = source.into();
        let ast = parser::parse(&source).map_err(EvalError::Parse)?;
        Ok(Expression { source, ast })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, scope: &Scope) -> Result<Value, EvalError> {
        eval::eval(&self.ast, scope)
    }

    /// Evaluates and coerces the result to a boolean using the DSL's
    /// truthiness rules (matches Python-style truthiness, since the
    /// original evaluator this one replaces was Python-based).
    pub fn eval_bool(&self, scope: &Scope) -> Result<bool, EvalError> {
        Ok(eval::truthy(&self.eval(scope)?))
    }
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}
