//! Event-bridging provider: turns topic pushes into a pollable provider
//! snapshot. Grounded on `yamc/providers/event.py::EventProvider`.

use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::{Provider, ProviderError};
use crate::bus::EventSource;
use crate::runtime::TerminationSignal;
use crate::value::Record;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct EventProvider {
    component_id: String,
    topics: Arc<EventSource>,
    data: Arc<Mutex<Record>>,
}

impl EventProvider {
    /// Creates one topic per id in `topic_ids` and starts the background
    /// thread that keeps `data[topic_id]` current as updates arrive.
    pub fn new(component_id: impl Into<String>, topic_ids: &[String], term: Arc<TerminationSignal>) -> Arc<Self> {
        let component_id = component_id.into();
        let topics = Arc::new(EventSource::new());
        for id in topic_ids {
            topics.add_topic(id.clone()).expect("topic ids within one provider must be unique");
        }

        let provider = Arc::new(EventProvider {
            component_id,
            topics: topics.clone(),
            data: Arc::new(Mutex::new(Record::new())),
        });

        let mut receivers: Vec<(Arc<crate::bus::Topic>, Receiver<Record>)> = Vec::new();
        for topic in topics.topics() {
            let (tx, rx) = mpsc::channel();
            topic.subscribe(tx);
            receivers.push((topic, rx));
        }

        let data = provider.data.clone();
        thread::spawn(move || {
            while !term.wait_timeout(POLL_INTERVAL) {
                for (topic, rx) in &receivers {
                    if rx.try_recv().is_ok() {
                        let mut data = data.lock().expect("event provider lock poisoned");
                        data.insert(topic.id().to_string(), serde_json::Value::Object(topic.as_dict()));
                    }
                }
            }
        });

        provider
    }

    pub fn topics(&self) -> &Arc<EventSource> {
        &self.topics
    }

    pub fn snapshot(&self) -> Record {
        self.data.lock().expect("event provider lock poisoned").clone()
    }
}

impl Provider for EventProvider {
    fn component_id(&self) -> &str {
        &self.component_id
    }

    fn source(&self) -> String {
        "n/a".to_string()
    }

    /// Data is already current via the background subscription thread;
    /// there is nothing to pull.
    fn refresh(&self) -> Result<bool, ProviderError> {
        Ok(true)
    }
}
