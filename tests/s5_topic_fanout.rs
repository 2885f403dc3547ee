//! S5 from spec.md §8: two event collectors subscribed to the same topic
//! must each see every update, in order, through their own writer.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::json;
use siphon::bus::EventSource;
use siphon::collector::event::EventCollector;
use siphon::collector::{BaseCollector, DataDef, WriterBinding};
use siphon::error::Error;
use siphon::expr::Expression;
use siphon::runtime::{TerminationSignal, WorkerComponent};
use siphon::scope::Scope;
use siphon::value::Record;
use siphon::writer::template::{from_yaml, ConditionalTemplate};
use siphon::writer::{Writer, WriterBackend, WriterConfig, WriterEnvelope};

struct RecordingBackend {
    writes: Mutex<Vec<WriterEnvelope>>,
}

impl RecordingBackend {
    fn new() -> Arc<Self> {
        Arc::new(RecordingBackend { writes: Mutex::new(Vec::new()) })
    }
}

impl WriterBackend for RecordingBackend {
    fn do_write(&self, batch: &[WriterEnvelope]) -> Result<(), Error> {
        self.writes.lock().unwrap().extend_from_slice(batch);
        Ok(())
    }
}

fn writer_binding(id: &str, backend: Arc<RecordingBackend>, dir: &std::path::Path) -> WriterBinding {
    let writer = Writer::new(
        id.to_string(),
        backend,
        WriterConfig { write_interval: Duration::from_millis(10), ..Default::default() },
        dir.join(format!("{id}-backlog")),
        Scope::new(),
    )
    .unwrap();
    let yaml: serde_yaml::Value = serde_yaml::from_str("$def:\n  x: \"=data.x\"\n").unwrap();
    let template = ConditionalTemplate::new(from_yaml(&yaml).unwrap());
    WriterBinding { writer_id: id.to_string(), writer, template }
}

fn event_collector(id: &str, binding: WriterBinding, topic: Arc<siphon::bus::Topic>) -> Arc<EventCollector> {
    let base = BaseCollector::new(
        id.to_string(),
        true,
        DataDef::Expr(Expression::parse("event").unwrap()),
        10,
        vec![binding],
        Scope::new(),
    );
    Arc::new(EventCollector::new(base, vec![topic]))
}

#[test]
fn both_collectors_see_every_update_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let bus = EventSource::new();
    let topic = bus.add_topic("t1").unwrap();

    let backend1 = RecordingBackend::new();
    let backend2 = RecordingBackend::new();
    let binding1 = writer_binding("w1", backend1.clone(), dir.path());
    let binding2 = writer_binding("w2", backend2.clone(), dir.path());
    let writer1 = binding1.writer.clone();
    let writer2 = binding2.writer.clone();

    let collector1 = event_collector("c1", binding1, topic.clone());
    let collector2 = event_collector("c2", binding2, topic.clone());

    let term = TerminationSignal::new();
    let handles = vec![
        thread::spawn({
            let writer1 = writer1.clone();
            let term = term.clone();
            move || writer1.worker(term)
        }),
        thread::spawn({
            let writer2 = writer2.clone();
            let term = term.clone();
            move || writer2.worker(term)
        }),
        thread::spawn({
            let term = term.clone();
            move || collector1.worker(term)
        }),
        thread::spawn({
            let term = term.clone();
            move || collector2.worker(term)
        }),
    ];

    thread::sleep(Duration::from_millis(150));
    let mut e1 = Record::new();
    e1.insert("x".to_string(), json!(1));
    topic.update(e1);
    let mut e2 = Record::new();
    e2.insert("x".to_string(), json!(2));
    topic.update(e2);

    let mut result1 = Vec::new();
    let mut result2 = Vec::new();
    for _ in 0..50 {
        thread::sleep(Duration::from_millis(100));
        let w1 = backend1.writes.lock().unwrap();
        let w2 = backend2.writes.lock().unwrap();
        if w1.len() >= 2 && w2.len() >= 2 {
            result1 = w1.clone();
            result2 = w2.clone();
            break;
        }
    }

    term.set();
    for handle in handles {
        handle.join().unwrap();
    }

    let values = |envelopes: &[WriterEnvelope]| -> Vec<serde_json::Value> {
        envelopes.iter().map(|e| e.data.get("x").cloned().unwrap_or(serde_json::Value::Null)).collect()
    };
    assert_eq!(values(&result1), vec![json!(1), json!(2)], "collector 1's writer must see both updates in order");
    assert_eq!(values(&result2), vec![json!(1), json!(2)], "collector 2's writer must see both updates in order");
}
