//! Built-in functions available to every expression without explicit
//! registration: `min`, `max`, `len`, `str`, `int`, `float`, `abs`.

use serde_json::Value;

use crate::error::EvalError;

pub fn call_builtin(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match name {
        "min" => reduce_numeric(args, f64::min),
        "max" => reduce_numeric(args, f64::max),
        "abs" => {
            let v = one_numeric_arg("abs", args)?;
            Ok(Value::from(v.abs()))
        }
        "len" => {
            let arg = args
                .first()
                .ok_or_else(|| EvalError::Type("len() requires one argument".to_string()))?;
            let n = match arg {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => return Err(EvalError::Type(format!("len() not supported on {other}"))),
            };
            Ok(Value::from(n as i64))
        }
        "str" => {
            let arg = args
                .first()
                .ok_or_else(|| EvalError::Type("str() requires one argument".to_string()))?;
            let s = match arg {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Ok(Value::from(s))
        }
        "int" => {
            let arg = args
                .first()
                .ok_or_else(|| EvalError::Type("int() requires one argument".to_string()))?;
            match arg {
                Value::Number(n) => Ok(Value::from(n.as_f64().unwrap_or(0.0) as i64)),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| EvalError::Type(format!("cannot convert '{s}' to int"))),
                Value::Bool(b) => Ok(Value::from(*b as i64)),
                other => Err(EvalError::Type(format!("cannot convert {other} to int"))),
            }
        }
        "float" => {
            let arg = args
                .first()
                .ok_or_else(|| EvalError::Type("float() requires one argument".to_string()))?;
            match arg {
                Value::Number(n) => Ok(Value::from(n.as_f64().unwrap_or(0.0))),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::from)
                    .map_err(|_| EvalError::Type(format!("cannot convert '{s}' to float"))),
                other => Err(EvalError::Type(format!("cannot convert {other} to float"))),
            }
        }
        other => Err(EvalError::UnknownFunction(other.to_string())),
    }
}

fn one_numeric_arg(fname: &str, args: &[Value]) -> Result<f64, EvalError> {
    args.first()
        .and_then(|v| v.as_f64())
        .ok_or_else(|| EvalError::Type(format!("{fname}() requires one numeric argument")))
}

fn reduce_numeric(args: &[Value], f: fn(f64, f64) -> f64) -> Result<Value, EvalError> {
    if args.is_empty() {
        return Err(EvalError::Type("expected at least one argument".to_string()));
    }
    let mut values = Vec::with_capacity(args.len());
    for a in args {
        values.push(
            a.as_f64()
                .ok_or_else(|| EvalError::Type(format!("'{a}' is not numeric")))?,
        );
    }
    let all_ints = args.iter().all(|a| matches!(a, Value::Number(n) if n.is_i64()));
    let result = values.into_iter().reduce(f).unwrap();
    if all_ints {
        Ok(Value::from(result as i64))
    } else {
        Ok(Value::from(result))
    }
}
