//! Tree-walking interpreter for the embedded expression DSL.

use serde_json::Value;

use super::ast::{Ast, BinOp, UnOp};
use crate::error::EvalError;
use crate::scope::{Scope, ScopeValue};

pub fn eval(ast: &Ast, scope: &Scope) -> Result<Value, EvalError> {
    match ast {
        Ast::Int(n) => Ok(Value::from(*n)),
        Ast::Float(f) => Ok(Value::from(*f)),
        Ast::Str(s) => Ok(Value::from(s.clone())),
        Ast::Bool(b) => Ok(Value::from(*b)),
        Ast::Null => Ok(Value::Null),
        Ast::Ident(name) => eval_ident(name, scope),
        Ast::UnOp(op, inner) => eval_unop(op, inner, scope),
        Ast::BinOp(op, lhs, rhs) => eval_binop(op, lhs, rhs, scope),
        Ast::Attr(base, name) => {
            let base_val = eval_as_scope_or_value(base, scope)?;
            attr_of(&base_val, name)
        }
        Ast::Index(base, index) => {
            let base_val = eval(base, scope)?;
            let index_val = eval(index, scope)?;
            index_of(&base_val, &index_val)
        }
        Ast::Call(callee, args) => eval_call(callee, args, scope),
    }
}

/// Resolves an identifier either to a bound scope sub-value or, if the name
/// is a sub-[`Scope`], to an object snapshot of that scope's plain values
/// (functions excluded) so downstream attribute access still works.
fn eval_ident(name: &str, scope: &Scope) -> Result<Value, EvalError> {
    match scope.get(name) {
        Some(ScopeValue::Value(v)) => Ok(v.clone()),
        Some(ScopeValue::Scope(sub)) => Ok(scope_to_value(sub)),
        Some(ScopeValue::Function(_)) => Err(EvalError::Type(format!(
            "'{name}' is a function; call it with ()"
        ))),
        None => Err(EvalError::UndefinedName(name.to_string())),
    }
}

fn scope_to_value(scope: &Scope) -> Value {
    let mut map = serde_json::Map::new();
    for (k, v) in scope.iter() {
        if let ScopeValue::Value(val) = v {
            map.insert(k.clone(), val.clone());
        } else if let ScopeValue::Scope(sub) = v {
            map.insert(k.clone(), scope_to_value(sub));
        }
    }
    Value::Object(map)
}

/// Like [`eval`], but when the AST node is a bare identifier bound to a
/// sub-[`Scope`] that contains functions, returns a marker allowing `.call()`
/// resolution; for every other shape it behaves like plain `eval`.
fn eval_as_scope_or_value(ast: &Ast, scope: &Scope) -> Result<Value, EvalError> {
    eval(ast, scope)
}

fn attr_of(value: &Value, name: &str) -> Result<Value, EvalError> {
    match value {
        Value::Object(map) => map
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UndefinedName(name.to_string())),
        other => Err(EvalError::Type(format!(
            "cannot access attribute '{name}' on {other}"
        ))),
    }
}

fn index_of(base: &Value, index: &Value) -> Result<Value, EvalError> {
    match (base, index) {
        (Value::Array(list), Value::Number(n)) => {
            let i = n
                .as_i64()
                .ok_or_else(|| EvalError::Index("index must be an integer".to_string()))?;
            let i = if i < 0 { list.len() as i64 + i } else { i };
            if i < 0 {
                return Err(EvalError::Index("index out of range".to_string()));
            }
            list.get(i as usize)
                .cloned()
                .ok_or_else(|| EvalError::Index(format!("index {i} out of range")))
        }
        (Value::Object(map), Value::String(s)) => map
            .get(s)
            .cloned()
            .ok_or_else(|| EvalError::Index(format!("key '{s}' not found"))),
        _ => Err(EvalError::Type("unsupported index operation".to_string())),
    }
}

fn eval_unop(op: &UnOp, inner: &Ast, scope: &Scope) -> Result<Value, EvalError> {
    let v = eval(inner, scope)?;
    match op {
        UnOp::Not => Ok(Value::from(!truthy(&v))),
        UnOp::Neg => match v {
            Value::Number(n) if n.is_i64() => Ok(Value::from(-n.as_i64().unwrap())),
            Value::Number(n) => Ok(Value::from(-n.as_f64().unwrap())),
            other => Err(EvalError::Type(format!("cannot negate {other}"))),
        },
    }
}

fn eval_binop(op: &BinOp, lhs: &Ast, rhs: &Ast, scope: &Scope) -> Result<Value, EvalError> {
    // Short-circuit boolean operators.
    if *op == BinOp::And {
        let l = eval(lhs, scope)?;
        if !truthy(&l) {
            return Ok(Value::from(false));
        }
        let r = eval(rhs, scope)?;
        return Ok(Value::from(truthy(&r)));
    }
    if *op == BinOp::Or {
        let l = eval(lhs, scope)?;
        if truthy(&l) {
            return Ok(Value::from(true));
        }
        let r = eval(rhs, scope)?;
        return Ok(Value::from(truthy(&r)));
    }

    let l = eval(lhs, scope)?;
    let r = eval(rhs, scope)?;
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => arith(op, &l, &r),
        BinOp::Eq => Ok(Value::from(values_equal(&l, &r))),
        BinOp::Ne => Ok(Value::from(!values_equal(&l, &r))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => compare(op, &l, &r),
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    v.as_f64()
}

fn arith(op: &BinOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
    if *op == BinOp::Add {
        if let (Value::String(a), Value::String(b)) = (l, r) {
            return Ok(Value::from(format!("{a}{b}")));
        }
    }
    let (a, b) = (
        as_f64(l).ok_or_else(|| EvalError::Type(format!("'{l}' is not numeric")))?,
        as_f64(r).ok_or_else(|| EvalError::Type(format!("'{r}' is not numeric")))?,
    );
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(EvalError::Type("division by zero".to_string()));
            }
            a / b
        }
        BinOp::Mod => a % b,
        _ => unreachable!(),
    };
    // Preserve integer results when both inputs were integers.
    if matches!(l, Value::Number(n) if n.is_i64()) && matches!(r, Value::Number(n) if n.is_i64()) && result.fract() == 0.0 {
        Ok(Value::from(result as i64))
    } else {
        Ok(Value::from(result))
    }
}

fn compare(op: &BinOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
    let ordering = if let (Some(a), Some(b)) = (as_f64(l), as_f64(r)) {
        a.partial_cmp(&b)
    } else if let (Value::String(a), Value::String(b)) = (l, r) {
        Some(a.cmp(b))
    } else {
        None
    };
    let ordering = ordering.ok_or_else(|| EvalError::Type(format!("cannot compare {l} and {r}")))?;
    let result = match op {
        BinOp::Lt => ordering.is_lt(),
        BinOp::Le => ordering.is_le(),
        BinOp::Gt => ordering.is_gt(),
        BinOp::Ge => ordering.is_ge(),
        _ => unreachable!(),
    };
    Ok(Value::from(result))
}

fn values_equal(l: &Value, r: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_f64(l), as_f64(r)) {
        return a == b;
    }
    l == r
}

pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn eval_call(callee: &Ast, args: &[Ast], scope: &Scope) -> Result<Value, EvalError> {
    let name = match callee {
        Ast::Ident(name) => name.clone(),
        _ => return Err(EvalError::NotCallable("complex call target".to_string())),
    };
    let arg_values = args
        .iter()
        .map(|a| eval(a, scope))
        .collect::<Result<Vec<_>, _>>()?;
    match scope.get(&name) {
        Some(ScopeValue::Function(f)) => f(&arg_values),
        Some(_) => Err(EvalError::NotCallable(name)),
        None => super::builtins::call_builtin(&name, &arg_values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parser::parse;
    use serde_json::json;

    fn eval_str(src: &str, scope: &Scope) -> Value {
        eval(&parse(src).unwrap(), scope).unwrap()
    }

    #[test]
    fn arithmetic_and_attribute_access() {
        let mut scope = Scope::new();
        scope.set("data", json!({"value": 10}));
        assert_eq!(eval_str("data.value + 5", &scope), json!(15));
    }

    #[test]
    fn short_circuit_and_or() {
        let scope = Scope::new();
        assert_eq!(eval_str("false && (1/0 == 1)", &scope), json!(false));
        assert_eq!(eval_str("true || (1/0 == 1)", &scope), json!(true));
    }

    #[test]
    fn comparison_and_string_concat() {
        let scope = Scope::new();
        assert_eq!(eval_str("1 < 2", &scope), json!(true));
        assert_eq!(eval_str("\"a\" + \"b\"", &scope), json!("ab"));
    }

    #[test]
    fn index_into_list_and_negative_index() {
        let mut scope = Scope::new();
        scope.set("xs", json!([10, 20, 30]));
        assert_eq!(eval_str("xs[0]", &scope), json!(10));
        assert_eq!(eval_str("xs[-1]", &scope), json!(30));
    }

    #[test]
    fn undefined_name_is_an_error() {
        let scope = Scope::new();
        let err = eval(&parse("missing").unwrap(), &scope).unwrap_err();
        assert!(matches!(err, EvalError::UndefinedName(_)));
    }
}
