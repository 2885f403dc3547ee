//! Event-triggered collector: subscribes to one or more topics and, once
//! per short poll, drains whatever events arrived and runs
//! `prepare_data`/`write` once per event with `event` bound in scope.
//!
//! Grounded on `yamc/collectors/collector.py::EventCollector`.

use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::info;
use serde_json::Value;

use super::BaseCollector;
use crate::bus::Topic;
use crate::runtime::{TerminationSignal, WorkerComponent};
use crate::scope::Scope;
use crate::value::Record;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct EventCollector {
    base: BaseCollector,
    topics: Vec<Arc<Topic>>,
}

impl EventCollector {
    pub fn new(base: BaseCollector, topics: Vec<Arc<Topic>>) -> Self {
        EventCollector { base, topics }
    }

    fn now_epoch_secs() -> f64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
    }

    fn handle_event(&self, topic_id: &str, event: Record) {
        let mut scope = Scope::new();
        scope.set("event", Value::Object(event));
        let result = self
            .base
            .prepare_data(Some(&scope))
            .and_then(|data| self.base.write(data, Some(&scope), Self::now_epoch_secs()));
        if let Err(e) = result {
            log::error!("the job '{}' failed processing an event from '{topic_id}' due to: {e}", self.base.component_id());
        }
    }
}

impl WorkerComponent for EventCollector {
    fn component_id(&self) -> &str {
        self.base.component_id()
    }

    fn worker(self: Arc<Self>, term: Arc<TerminationSignal>) {
        if !self.base.enabled() {
            return;
        }
        info!("starting the event collector thread for '{}'", self.base.component_id());
        info!(
            "subscribing to events from the following topics: {}",
            self.topics.iter().map(|t| t.id().to_string()).collect::<Vec<_>>().join(", ")
        );

        let mut receivers: Vec<(Arc<Topic>, Receiver<Record>)> = Vec::new();
        for topic in &self.topics {
            let (tx, rx) = mpsc::channel();
            topic.subscribe(tx);
            receivers.push((topic.clone(), rx));
        }

        loop {
            for (topic, rx) in &receivers {
                while let Ok(event) = rx.try_recv() {
                    self.handle_event(topic.id(), event);
                }
            }
            if term.wait_timeout(POLL_INTERVAL) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventSource;
    use crate::collector::DataDef;
    use crate::writer::template::TemplateValue;
    use serde_json::json;
    use std::thread;

    #[test]
    fn event_triggers_prepare_and_write_with_event_in_scope() {
        let source = EventSource::new();
        let topic = source.add_topic("t1".to_string()).unwrap();

        let base = BaseCollector::new(
            "c1",
            true,
            DataDef::Expr(crate::expr::Expression::parse("event").unwrap()),
            10,
            Vec::new(),
            Scope::new(),
        );
        let collector = Arc::new(EventCollector::new(base, vec![topic.clone()]));
        let term = TerminationSignal::new();
        let worker_term = term.clone();
        let worker_collector = collector.clone();
        let handle = thread::spawn(move || worker_collector.worker(worker_term));

        thread::sleep(Duration::from_millis(100));
        topic.update({
            let mut m = Record::new();
            m.insert("x".to_string(), json!(42));
            m
        });

        let mut found = false;
        for _ in 0..20 {
            thread::sleep(Duration::from_millis(100));
            if !collector.base.history().is_empty() {
                found = true;
                break;
            }
        }
        term.set();
        handle.join().unwrap();
        assert!(found, "expected the event to trigger prepare_data");
    }
}
