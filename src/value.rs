//! The record/value model shared across providers, templates, and writers.
//!
//! A [`Record`] is the unordered string-keyed map the spec calls a "record";
//! we represent it directly as a `serde_json::Map` since every value that
//! flows through siphon (provider output, template payloads, writer
//! envelopes) is already JSON-shaped.

use serde_json::{Map, Value};

pub type Record = Map<String, Value>;

/// Deep-merges `b` into `a`, with `b` winning on scalar conflicts and
/// sub-objects merging recursively. Mirrors `yamc.utils.merge_dicts`.
pub fn deep_merge(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Object(map_a), Value::Object(map_b)) => {
            let mut out = map_a.clone();
            for (k, v_b) in map_b {
                match out.get(k) {
                    Some(v_a) => {
                        let merged = deep_merge(v_a, v_b);
                        out.insert(k.clone(), merged);
                    }
                    None => {
                        out.insert(k.clone(), v_b.clone());
                    }
                }
            }
            Value::Object(out)
        }
        _ => b.clone(),
    }
}

pub fn deep_merge_record(a: &Record, b: &Record) -> Record {
    let merged = deep_merge(&Value::Object(a.clone()), &Value::Object(b.clone()));
    match merged {
        Value::Object(map) => map,
        _ => unreachable!("merging two objects always yields an object"),
    }
}

/// Looks up a slash-delimited path (`"a/b/0/c"`) inside a JSON value,
/// treating numeric path segments as list indices. Mirrors
/// `yamc.utils.deep_find`.
pub fn deep_find<'a>(value: &'a Value, path: &str, delim: char) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split(delim).filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(list) => {
                let idx: usize = segment.parse().ok()?;
                list.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Walks a JSON value depth-first, invoking `callback` with the slash-joined
/// path (no trailing slash) and the sub-value at every node except the
/// root. Mirrors `yamc.providers.event.StateProvider.on_data::_walk`, whose
/// list segments render as `name[index]`.
pub fn walk_paths<'a>(value: &'a Value, callback: &mut dyn FnMut(&str, &'a Value)) {
    fn walk_inner<'a>(value: &'a Value, path: &str, callback: &mut dyn FnMut(&str, &'a Value)) {
        if !path.is_empty() {
            callback(path, value);
        }
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    let next = if path.is_empty() {
                        k.clone()
                    } else {
                        format!("{path}/{k}")
                    };
                    walk_inner(v, &next, callback);
                }
            }
            Value::Array(list) => {
                for (i, v) in list.iter().enumerate() {
                    let next = format!("{path}[{i}]");
                    walk_inner(v, &next, callback);
                }
            }
            _ => {}
        }
    }
    walk_inner(value, "", callback);
}

/// Coerces a textual/numeric value the way the CSV/XML providers do: try
/// `i64`, then `f64`, then fall back to the original string.
pub fn coerce_numeric_or_string(raw: &str) -> Value {
    if let Ok(i) = raw.trim().parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.trim().parse::<f64>() {
        return Value::from(f);
    }
    Value::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deep_merge_overrides_scalars_and_merges_objects() {
        let a = json!({"x": 1, "nested": {"a": 1, "b": 2}});
        let b = json!({"x": 2, "nested": {"b": 3, "c": 4}});
        let merged = deep_merge(&a, &b);
        assert_eq!(merged, json!({"x": 2, "nested": {"a": 1, "b": 3, "c": 4}}));
    }

    #[test]
    fn deep_find_walks_objects_and_arrays() {
        let v = json!({"a": {"b": [{"c": 42}]}});
        assert_eq!(deep_find(&v, "a/b/0/c", '/'), Some(&json!(42)));
        assert_eq!(deep_find(&v, "a/b/1/c", '/'), None);
    }

    #[test]
    fn walk_paths_uses_bracket_segments_for_lists() {
        let v = json!({"a": {"b": [{"c": 1}, {"c": 2}]}});
        let mut seen = Vec::new();
        walk_paths(&v, &mut |path, _| seen.push(path.to_string()));
        assert!(seen.contains(&"a/b[0]/c".to_string()));
        assert!(seen.contains(&"a/b[1]/c".to_string()));
    }

    #[test]
    fn coerce_numeric_prefers_int_then_float_then_string() {
        assert_eq!(coerce_numeric_or_string("42"), json!(42));
        assert_eq!(coerce_numeric_or_string("4.5"), json!(4.5));
        assert_eq!(coerce_numeric_or_string("hello"), json!("hello"));
    }
}
