//! The conditional template engine: `$def` / `$if` / `$opts` blocks
//! evaluated against a [`Scope`], deep-merged together.
//!
//! Grounded line-for-line on
//! `yamc/writers/writer.py::Writer.process_conditional_dict`. The `onoff`
//! flag (the original's `$onoff` marker inside `$opts`) only re-emits a
//! block's data when its `$if` result changes from the previous
//! evaluation, tracked per block path in `last_if_eval` so a block that
//! stays `true` across repeated calls doesn't repeatedly emit.

use std::collections::HashMap;
use std::sync::Mutex;

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::error::Error;
use crate::expr::Expression;
use crate::scope::Scope;
use crate::value::{deep_merge_record, Record};

/// A parsed template node: either a literal JSON value, a single
/// expression leaf, or a structural list/dict of further nodes. Produced
/// from YAML config by [`TemplateValue::from_yaml`].
#[derive(Clone, Debug)]
pub enum TemplateValue {
    Value(Value),
    Expr(Expression),
    List(Vec<TemplateValue>),
    Dict(IndexMap<String, TemplateValue>),
}

/// YAML scalar strings prefixed with `=` are parsed as expressions;
/// everything else is a literal. Replaces the original's custom `!py` YAML
/// tag, which has no direct `serde_yaml` equivalent.
pub fn from_yaml(value: &serde_yaml::Value) -> Result<TemplateValue, Error> {
    match value {
        serde_yaml::Value::String(s) => {
            if let Some(expr_src) = s.strip_prefix('=') {
                let expr = Expression::parse(expr_src.trim())
                    .map_err(|e| Error::validation(format!("invalid expression '{expr_src}': {e}")))?;
                Ok(TemplateValue::Expr(expr))
            } else {
                Ok(TemplateValue::Value(Value::String(s.clone())))
            }
        }
        serde_yaml::Value::Sequence(items) => {
            let converted = items.iter().map(from_yaml).collect::<Result<Vec<_>, _>>()?;
            Ok(TemplateValue::List(converted))
        }
        serde_yaml::Value::Mapping(map) => {
            let mut out = IndexMap::new();
            for (k, v) in map {
                let key = k
                    .as_str()
                    .ok_or_else(|| Error::validation("template keys must be strings"))?
                    .to_string();
                out.insert(key, from_yaml(v)?);
            }
            Ok(TemplateValue::Dict(out))
        }
        other => {
            let json = serde_json::to_value(other).map_err(|e| Error::validation(e.to_string()))?;
            Ok(TemplateValue::Value(json))
        }
    }
}

/// Recursively evaluates every [`TemplateValue::Expr`] leaf in `node`
/// against `scope`, producing a plain JSON value with the same shape.
/// Shared by the conditional template engine and by collectors evaluating
/// their own `data` definition (which has no `$if`/`$opts` wrapper).
pub fn deep_eval(node: &TemplateValue, scope: &Scope, path: &str) -> Result<Value, Error> {
    match node {
        TemplateValue::Value(v) => Ok(v.clone()),
        TemplateValue::Expr(e) => e
            .eval(scope)
            .map_err(|source| Error::Eval { path: path.to_string(), source }),
        TemplateValue::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                out.push(deep_eval(item, scope, &format!("{path}[{i}]/"))?);
            }
            Ok(Value::Array(out))
        }
        TemplateValue::Dict(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), deep_eval(v, scope, &format!("{path}/{k}"))?);
            }
            Ok(Value::Object(out))
        }
    }
}

fn as_record(value: &Value, path: &str) -> Result<Record, Error> {
    match value {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Record::new()),
        _ => Err(Error::validation(format!(
            "the conditional template at {path} must evaluate to an object"
        ))),
    }
}

/// One conditional template, compiled from a writer definition's full
/// `{ $def: ... }` tree. Holds the onoff edge-detection state across
/// repeated `eval` calls, so it must be reused (not rebuilt) across writes.
pub struct ConditionalTemplate {
    root: TemplateValue,
    last_if_eval: Mutex<HashMap<String, bool>>,
}

impl ConditionalTemplate {
    pub fn new(root: TemplateValue) -> Self {
        ConditionalTemplate {
            root,
            last_if_eval: Mutex::new(HashMap::new()),
        }
    }

    pub fn eval(&self, scope: &Scope) -> Result<Record, Error> {
        let def = match &self.root {
            TemplateValue::Dict(map) => map
                .get("$def")
                .ok_or_else(|| Error::validation("there must be a '$def' property"))?,
            _ => return Err(Error::validation("the writer definition must be an object")),
        };
        self.process(def, scope, "$def")
    }

    fn process(&self, node: &TemplateValue, scope: &Scope, path: &str) -> Result<Record, Error> {
        match node {
            TemplateValue::Expr(e) => {
                let v = e
                    .eval(scope)
                    .map_err(|source| Error::Eval { path: path.to_string(), source })?;
                as_record(&v, path)
            }
            TemplateValue::List(items) => {
                let mut data = Record::new();
                for (i, item) in items.iter().enumerate() {
                    let block_path = format!("{path}[{i}]");
                    let block_data = self.process_block(item, scope, &block_path)?;
                    data = deep_merge_record(&data, &block_data);
                }
                Ok(data)
            }
            TemplateValue::Dict(_) => self.process_block(node, scope, path),
            TemplateValue::Value(v) => as_record(v, path),
        }
    }

    fn process_block(&self, block: &TemplateValue, scope: &Scope, path: &str) -> Result<Record, Error> {
        let TemplateValue::Dict(map) = block else {
            return self.process(block, scope, path);
        };

        let if_expr = map.get("$if");
        let opts: Vec<String> = match map.get("$opts") {
            Some(TemplateValue::Value(Value::String(s))) => s.split(',').map(|o| o.trim().to_string()).collect(),
            _ => Vec::new(),
        };
        let onoff = opts.iter().any(|o| o == "onoff");

        let eval_result = match if_expr {
            None => true,
            Some(TemplateValue::Expr(e)) => e
                .eval_bool(scope)
                .map_err(|source| Error::Eval { path: format!("{path}/$if"), source })?,
            Some(_) => {
                return Err(Error::validation(format!(
                    "the '$if' expression must be an expression in {path}"
                )))
            }
        };

        let should_emit = if if_expr.is_none() {
            true
        } else if !eval_result {
            false
        } else if onoff {
            let last = self.last_if_eval.lock().expect("template lock poisoned");
            last.get(path) != Some(&eval_result)
        } else {
            true
        };

        let mut data = Record::new();
        if should_emit {
            if let Some(nested) = map.get("$def") {
                let nested_data = self.process(nested, scope, &format!("{path}/$def"))?;
                data = deep_merge_record(&nested_data, &data);
            } else {
                let mut filtered = IndexMap::new();
                for (k, v) in map {
                    if k != "$if" && k != "$opts" {
                        filtered.insert(k.clone(), v.clone());
                    }
                }
                let evaluated = deep_eval(&TemplateValue::Dict(filtered), scope, path)?;
                data = deep_merge_record(&as_record(&evaluated, path)?, &data);
            }
        }

        if if_expr.is_some() {
            self.last_if_eval
                .lock()
                .expect("template lock poisoned")
                .insert(path.to_string(), eval_result);
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dict(pairs: Vec<(&str, TemplateValue)>) -> TemplateValue {
        let mut map = IndexMap::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v);
        }
        TemplateValue::Dict(map)
    }

    fn lit(v: Value) -> TemplateValue {
        TemplateValue::Value(v)
    }

    fn expr(src: &str) -> TemplateValue {
        TemplateValue::Expr(Expression::parse(src).unwrap())
    }

    #[test]
    fn simple_def_without_if_always_emits() {
        let root = dict(vec![("$def", dict(vec![("e", lit(json!(1)))]))]);
        let template = ConditionalTemplate::new(root);
        let scope = Scope::new();
        assert_eq!(template.eval(&scope).unwrap(), as_record(&json!({"e": 1}), "").unwrap());
    }

    /// S6 — feeding states on, on, off, on through an onoff-flagged `$if`
    /// block emits on events 1 and 4 only.
    #[test]
    fn s6_onoff_edge_detection() {
        let block = dict(vec![
            ("$if", expr("data.state == \"on\"")),
            ("$opts", lit(json!("onoff"))),
            ("e", lit(json!(1))),
        ]);
        let root = dict(vec![("$def", TemplateValue::List(vec![block]))]);
        let template = ConditionalTemplate::new(root);

        let make_scope = |state: &str| {
            let mut scope = Scope::new();
            scope.set("data", json!({"state": state}));
            scope
        };

        let r1 = template.eval(&make_scope("on")).unwrap();
        assert_eq!(r1.get("e"), Some(&json!(1)));

        let r2 = template.eval(&make_scope("on")).unwrap();
        assert!(r2.is_empty());

        let r3 = template.eval(&make_scope("off")).unwrap();
        assert!(r3.is_empty());

        let r4 = template.eval(&make_scope("on")).unwrap();
        assert_eq!(r4.get("e"), Some(&json!(1)));
    }

    #[test]
    fn plain_if_without_onoff_emits_every_time_true() {
        let block = dict(vec![("$if", expr("data.on")), ("e", lit(json!(1)))]);
        let root = dict(vec![("$def", TemplateValue::List(vec![block]))]);
        let template = ConditionalTemplate::new(root);
        let mut scope = Scope::new();
        scope.set("data", json!({"on": true}));
        assert_eq!(template.eval(&scope).unwrap().get("e"), Some(&json!(1)));
        assert_eq!(template.eval(&scope).unwrap().get("e"), Some(&json!(1)));
    }

    #[test]
    fn nested_def_merges_with_outer_list_order() {
        let inner = dict(vec![("a", lit(json!(1)))]);
        let outer_block = dict(vec![("$def", TemplateValue::List(vec![inner]))]);
        let second_block = dict(vec![("b", lit(json!(2)))]);
        let root = dict(vec![("$def", TemplateValue::List(vec![outer_block, second_block]))]);
        let template = ConditionalTemplate::new(root);
        let result = template.eval(&Scope::new()).unwrap();
        assert_eq!(result.get("a"), Some(&json!(1)));
        assert_eq!(result.get("b"), Some(&json!(2)));
    }

    #[test]
    fn later_block_overrides_earlier_on_key_conflict() {
        let first_block = dict(vec![("a", lit(json!(1)))]);
        let second_block = dict(vec![("a", lit(json!(2)))]);
        let root = dict(vec![("$def", TemplateValue::List(vec![first_block, second_block]))]);
        let template = ConditionalTemplate::new(root);
        let result = template.eval(&Scope::new()).unwrap();
        assert_eq!(result.get("a"), Some(&json!(2)));
    }

    #[test]
    fn from_yaml_parses_equals_prefixed_strings_as_expressions() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("e: \"=data.value + 1\"").unwrap();
        let tv = from_yaml(&yaml).unwrap();
        match tv {
            TemplateValue::Dict(map) => assert!(matches!(map.get("e"), Some(TemplateValue::Expr(_)))),
            _ => panic!("expected dict"),
        }
    }
}
