//! In-process pub-sub: named [`Topic`]s with history and pattern-based
//! fan-out, collected under an [`EventBus`].
//!
//! Grounded on `yamc.providers.event.{Topic, EventSource}`: exact-match
//! lookup first, then `re.match`-style (prefix, not full-string) regular
//! expression matching against topic ids, de-duplicated and in insertion
//! order.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::Error;
use crate::value::Record;

const DEFAULT_HISTORY_CAPACITY: usize = 256;

struct TopicInner {
    last_time: f64,
    last_data: Option<Record>,
    history: Vec<Record>,
    subscribers: Vec<Sender<Record>>,
}

/// A named channel with bounded history and fan-out to subscriber queues.
pub struct Topic {
    id: String,
    history_capacity: usize,
    inner: Mutex<TopicInner>,
}

impl Topic {
    fn new(id: impl Into<String>, history_capacity: usize) -> Self {
        Topic {
            id: id.into(),
            history_capacity,
            inner: Mutex::new(TopicInner {
                last_time: 0.0,
                last_data: None,
                history: Vec::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Atomically records the timestamp, appends to history, and delivers
    /// to every live subscriber exactly once, in call order.
    pub fn update(&self, data: Record) {
        let mut inner = self.inner.lock().expect("topic lock poisoned");
        inner.last_time = now_secs();
        inner.last_data = Some(data.clone());
        inner.history.push(data.clone());
        if inner.history.len() > self.history_capacity {
            let overflow = inner.history.len() - self.history_capacity;
            inner.history.drain(0..overflow);
        }
        inner.subscribers.retain(|s| s.send(data.clone()).is_ok());
    }

    pub fn subscribe(&self, sender: Sender<Record>) {
        self.inner.lock().expect("topic lock poisoned").subscribers.push(sender);
    }

    pub fn last_time(&self) -> f64 {
        self.inner.lock().expect("topic lock poisoned").last_time
    }

    pub fn last_data(&self) -> Option<Record> {
        self.inner.lock().expect("topic lock poisoned").last_data.clone()
    }

    /// Returns the last `n` history entries, oldest first.
    pub fn history_tail(&self, n: usize) -> Vec<Record> {
        let inner = self.inner.lock().expect("topic lock poisoned");
        let len = inner.history.len();
        let start = len.saturating_sub(n);
        inner.history[start..].to_vec()
    }

    /// `{topic_id, time, ...record fields}`.
    pub fn as_dict(&self) -> Record {
        let inner = self.inner.lock().expect("topic lock poisoned");
        let mut map = Map::new();
        map.insert("topic_id".to_string(), Value::from(self.id.clone()));
        map.insert("time".to_string(), serde_json::Number::from_f64(inner.last_time)
            .map(Value::Number)
            .unwrap_or(Value::Null));
        if let Some(data) = &inner.last_data {
            for (k, v) in data {
                map.insert(k.clone(), v.clone());
            }
        }
        map
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX epoch")
        .as_secs_f64()
}

/// A collection of topics with pattern-based selection. Shared by the
/// process-wide bus and by every provider that is also an event source
/// (`EventProvider`, `StateProvider`).
#[derive(Default)]
pub struct EventSource {
    topics: RwLock<HashMap<String, std::sync::Arc<Topic>>>,
    order: Mutex<Vec<String>>,
}

impl EventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_topic(&self, id: impl Into<String>) -> Result<std::sync::Arc<Topic>, Error> {
        let id = id.into();
        let mut topics = self.topics.write().expect("topics lock poisoned");
        if topics.contains_key(&id) {
            return Err(Error::validation(format!("the topic with id '{id}' already exists")));
        }
        let topic = std::sync::Arc::new(Topic::new(id.clone(), DEFAULT_HISTORY_CAPACITY));
        topics.insert(id.clone(), topic.clone());
        self.order.lock().expect("order lock poisoned").push(id);
        Ok(topic)
    }

    pub fn select_one(&self, id: &str) -> Option<std::sync::Arc<Topic>> {
        self.select(&[id]).into_iter().next()
    }

    /// Every topic owned by this source, in insertion order. Used by
    /// `EventProvider` to subscribe to all of its own topics at once.
    pub fn topics(&self) -> Vec<std::sync::Arc<Topic>> {
        let topics = self.topics.read().expect("topics lock poisoned");
        let order = self.order.lock().expect("order lock poisoned");
        order.iter().filter_map(|id| topics.get(id).cloned()).collect()
    }

    /// Exact match first, then `re.match`-style regex match against every
    /// remaining topic id, de-duplicated and in insertion order.
    pub fn select(&self, patterns: &[&str]) -> Vec<std::sync::Arc<Topic>> {
        let topics = self.topics.read().expect("topics lock poisoned");
        let order = self.order.lock().expect("order lock poisoned");
        let mut out = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for pattern in patterns {
            if let Some(topic) = topics.get(*pattern) {
                if seen.insert(topic.id().to_string()) {
                    out.push(topic.clone());
                }
                continue;
            }
            let re = match Regex::new(&format!("^(?:{pattern})")) {
                Ok(re) => re,
                Err(_) => continue,
            };
            for id in order.iter() {
                if re.is_match(id) {
                    if let Some(topic) = topics.get(id) {
                        if seen.insert(topic.id().to_string()) {
                            out.push(topic.clone());
                        }
                    }
                }
            }
        }
        out
    }
}

/// The process-wide event bus: one global [`EventSource`] shared through
/// the [`crate::context::AppContext`].
pub type EventBus = EventSource;
