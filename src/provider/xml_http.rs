//! XML-over-HTTP provider with an XPath-lite accessor. A full XPath 1.0
//! engine is explicitly out of scope; `xpath` supports `/a/b` (first
//! matching descendant's text), `/a/b/@attr`, and `/a/b/text()`.
//!
//! Grounded on `yamc/providers/provider.py::XmlHttpProvider`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde_json::Value;

use super::{DiffStorage, HttpProvider, Provider, ProviderError};
use crate::error::EvalError;
use crate::runtime::TerminationSignal;
use crate::scope::ScopeValue;
use crate::value::coerce_numeric_or_string;
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
struct XmlElement {
    name: String,
    attrs: HashMap<String, String>,
    text: String,
    children: Vec<XmlElement>,
}

fn parse_tree(bytes: &[u8]) -> Result<XmlElement, ProviderError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let mut attrs = HashMap::new();
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                    let value = attr.unescape_value().unwrap_or_default().to_string();
                    attrs.insert(key, value);
                }
                stack.push(XmlElement {
                    name,
                    attrs,
                    text: String::new(),
                    children: Vec::new(),
                });
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let mut attrs = HashMap::new();
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                    let value = attr.unescape_value().unwrap_or_default().to_string();
                    attrs.insert(key, value);
                }
                let element = XmlElement {
                    name,
                    attrs,
                    text: String::new(),
                    children: Vec::new(),
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Ok(Event::Text(e)) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&e.unescape().unwrap_or_default());
                }
            }
            Ok(Event::End(_)) => {
                if let Some(finished) = stack.pop() {
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(finished),
                        None => root = Some(finished),
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ProviderError::Operational(format!("xml parse error: {e}"))),
            _ => {}
        }
        buf.clear();
    }

    root.ok_or_else(|| ProviderError::Operational("the document has no root element".to_string()))
}

fn find_path<'a>(root: &'a XmlElement, segments: &[&str]) -> Option<&'a XmlElement> {
    let mut current = root;
    for (i, segment) in segments.iter().enumerate() {
        if i == 0 {
            if *segment != current.name {
                return None;
            }
            continue;
        }
        current = current.children.iter().find(|c| c.name == *segment)?;
    }
    Some(current)
}

pub struct XmlHttpProvider {
    http: HttpProvider,
    str_decode_unicode: bool,
    tree: Mutex<Option<XmlElement>>,
    diff: DiffStorage,
}

impl XmlHttpProvider {
    pub fn new(
        component_id: impl Into<String>,
        url: impl Into<String>,
        max_age: Duration,
        str_decode_unicode: bool,
        term: Arc<TerminationSignal>,
    ) -> Self {
        XmlHttpProvider {
            http: HttpProvider::new(component_id, url, max_age, None, None, term),
            str_decode_unicode,
            tree: Mutex::new(None),
            diff: DiffStorage::new(),
        }
    }

    fn ensure_parsed(&self) -> Result<(), ProviderError> {
        let refreshed = self.http.refresh()?;
        let mut tree = self.tree.lock().expect("xml provider lock poisoned");
        if refreshed || tree.is_none() {
            let bytes = self
                .http
                .cached_data()
                .ok_or_else(|| ProviderError::Operational("no data fetched yet".to_string()))?;
            *tree = Some(parse_tree(&bytes)?);
        }
        Ok(())
    }

    /// `/a/b` -> text of the first matching element; `/a/b/@attr` -> that
    /// attribute; `/a/b/text()` -> element text, explicitly.
    pub fn xpath(&self, path: &str, diff: bool) -> Result<Value, ProviderError> {
        self.ensure_parsed()?;
        let tree = self.tree.lock().expect("xml provider lock poisoned");
        let root = tree.as_ref().expect("parsed by ensure_parsed");

        let mut segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let last = segments.pop().unwrap_or("");

        let raw_value = if let Some(attr) = last.strip_prefix('@') {
            let element = find_path(root, &prefixed(root, &segments))
                .ok_or_else(|| ProviderError::Other(format!("the xpath '{path}' cannot be evaluated")))?;
            element
                .attrs
                .get(attr)
                .cloned()
                .ok_or_else(|| ProviderError::Other(format!("the xpath '{path}' cannot be evaluated")))?
        } else if last == "text()" {
            let element = find_path(root, &prefixed(root, &segments))
                .ok_or_else(|| ProviderError::Other(format!("the xpath '{path}' cannot be evaluated")))?;
            element.text.clone()
        } else {
            segments.push(last);
            let element = find_path(root, &prefixed(root, &segments))
                .ok_or_else(|| ProviderError::Other(format!("the xpath '{path}' cannot be evaluated")))?;
            element.text.clone()
        };

        Ok(self.coerce(path, &raw_value, diff))
    }

    fn coerce(&self, path: &str, raw: &str, diff: bool) -> Value {
        let value = coerce_numeric_or_string(raw);
        let value = match (&value, self.str_decode_unicode) {
            (Value::String(s), true) => Value::from(deunicode::deunicode(s)),
            _ => value,
        };
        if diff {
            if let Some(n) = value.as_f64() {
                return Value::from(self.diff.diff(path, n));
            }
        }
        value
    }
}

fn prefixed<'a>(root: &'a XmlElement, segments: &[&'a str]) -> Vec<&'a str> {
    let mut out = vec![root.name.as_str()];
    out.extend(segments.iter().copied());
    out
}

impl Provider for XmlHttpProvider {
    fn component_id(&self) -> &str {
        self.http.component_id()
    }

    fn source(&self) -> String {
        self.http.source()
    }

    fn refresh(&self) -> Result<bool, ProviderError> {
        self.ensure_parsed()?;
        Ok(true)
    }

    /// Exposes `providers.<id>.xpath(path, diff = false)` to expressions.
    fn scope_functions(self: Arc<Self>) -> Vec<(&'static str, ScopeValue)> {
        let provider = self.clone();
        vec![(
            "xpath",
            ScopeValue::Function(Arc::new(move |args: &[Value]| {
                let path = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| EvalError::Type("xpath() expects a string path as its first argument".to_string()))?;
                let diff = args.get(1).and_then(Value::as_bool).unwrap_or(false);
                provider.xpath(path, diff).map_err(|e| EvalError::Type(e.to_string()))
            })),
        )]
    }
}
