//! Persists every governed provider's performance telemetry to the
//! rotated, headerless CSV files described in spec.md §6 — column order
//! `STARTED_TIME, TOPIC_ID, ID, RUNNING_TIME, RECORDS, WAIT_CYCLES,
//! IS_ERROR, REASON_TO_WAIT, ERROR`, daily rotation, 30-day retention.
//!
//! Grounded on `yamc/commands/provider.py::provider_perf`, which reads these
//! files back (`header=None`, one file per provider, named by the
//! provider's component id) — this module is the write side that original
//! command assumes exists. In the Python project that write side lives
//! implicitly in a `logging.handlers.TimedRotatingFileHandler` wired to
//! each provider's performance topic; here it's an explicit
//! [`WorkerComponent`] subscribed to every `yamc/performance/providers/*`
//! topic on the bus.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::bus::{EventBus, Topic};
use crate::runtime::{TerminationSignal, WorkerComponent};
use crate::value::Record;
use crate::writer::rotation::DailyRotatingCsv;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const RETENTION_DAYS: u32 = 30;
const TOPIC_PATTERN: &str = r"yamc/performance/providers/.*";

pub struct PerfRecorder {
    bus: Arc<EventBus>,
    perf_dir: PathBuf,
    files: Mutex<HashMap<String, DailyRotatingCsv>>,
}

impl PerfRecorder {
    pub fn new(bus: Arc<EventBus>, perf_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(PerfRecorder {
            bus,
            perf_dir: perf_dir.into(),
            files: Mutex::new(HashMap::new()),
        })
    }

    fn provider_id(topic_id: &str) -> &str {
        topic_id.rsplit('/').next().unwrap_or(topic_id)
    }

    fn record_row(topic_id: &str, record: &Record) -> Vec<String> {
        let get_f64 = |key: &str| record.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        let started_time = get_f64("started_time");
        let id = record.get("id").and_then(Value::as_str).unwrap_or("n/a").to_string();
        let running_time = get_f64("running_time");
        let records = record.get("records").and_then(Value::as_i64).unwrap_or(0);
        let wait_cycles = record.get("wait_cycles").and_then(Value::as_i64).unwrap_or(0);
        let is_error = match record.get("is_error") {
            Some(Value::Bool(true)) => "True".to_string(),
            Some(Value::Bool(false)) => "False".to_string(),
            _ => String::new(),
        };
        let reason_to_wait = record.get("reason_to_wait").and_then(Value::as_i64).unwrap_or(0);
        let error = record.get("error").and_then(Value::as_str).unwrap_or("-").to_string();

        vec![
            started_time.to_string(),
            topic_id.to_string(),
            id,
            running_time.to_string(),
            records.to_string(),
            wait_cycles.to_string(),
            is_error,
            reason_to_wait.to_string(),
            error,
        ]
    }

    fn append(&self, topic_id: &str, record: &Record) {
        let provider_id = Self::provider_id(topic_id);
        let row = Self::record_row(topic_id, record);

        let mut files = self.files.lock().expect("perf csv files lock poisoned");
        let file = files.entry(provider_id.to_string()).or_insert_with(|| {
            DailyRotatingCsv::new(self.perf_dir.join(format!("{provider_id}.csv")), None, Some(RETENTION_DAYS))
        });
        if let Err(e) = file.append(&row) {
            log::error!("failed to write the performance record for '{provider_id}': {e}");
        }
    }
}

impl WorkerComponent for PerfRecorder {
    fn component_id(&self) -> &str {
        "perf-recorder"
    }

    /// Subscribes once, at startup, to every topic matching
    /// `yamc/performance/providers/*` that already exists on the bus — same
    /// ordering constraint as `EventCollector`: providers register their
    /// topics at construction time, before any worker starts.
    fn worker(self: Arc<Self>, term: Arc<TerminationSignal>) {
        let topics = self.bus.select(&[TOPIC_PATTERN]);
        let mut receivers: Vec<(Arc<Topic>, Receiver<Record>)> = Vec::new();
        for topic in &topics {
            let (tx, rx) = mpsc::channel();
            topic.subscribe(tx);
            receivers.push((topic.clone(), rx));
        }

        loop {
            for (topic, rx) in &receivers {
                while let Ok(record) = rx.try_recv() {
                    self.append(topic.id(), &record);
                }
            }
            if term.wait_timeout(POLL_INTERVAL) {
                break;
            }
        }
    }

    fn destroy(&self) {
        let files = self.files.lock().expect("perf csv files lock poisoned");
        for file in files.values() {
            file.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use std::thread;

    #[test]
    fn provider_id_extracts_last_topic_segment() {
        assert_eq!(PerfRecorder::provider_id("yamc/performance/providers/p1"), "p1");
    }

    #[test]
    fn record_row_matches_spec_column_order() {
        let mut record = Record::new();
        record.insert("id".into(), json!("n/a"));
        record.insert("started_time".into(), json!(100.5));
        record.insert("records".into(), json!(3));
        record.insert("running_time".into(), json!(0.25));
        record.insert("wait_cycles".into(), json!(0));
        record.insert("reason_to_wait".into(), json!(0));
        record.insert("is_error".into(), json!(false));
        record.insert("error".into(), json!("-"));

        let row = PerfRecorder::record_row("yamc/performance/providers/p1", &record);
        assert_eq!(
            row,
            vec!["100.5", "yamc/performance/providers/p1", "n/a", "0.25", "3", "0", "False", "0", "-"]
        );
    }

    #[test]
    fn worker_writes_one_file_per_provider() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let topic = bus.add_topic("yamc/performance/providers/p1").unwrap();
        let recorder = PerfRecorder::new(bus.clone(), dir.path());
        let term = TerminationSignal::new();

        let worker_recorder = recorder.clone();
        let worker_term = term.clone();
        let handle = thread::spawn(move || worker_recorder.worker(worker_term));

        thread::sleep(Duration::from_millis(100));
        let mut record = Record::new();
        record.insert("id".into(), json!("n/a"));
        record.insert("started_time".into(), json!(1.0));
        record.insert("records".into(), json!(1));
        record.insert("running_time".into(), json!(0.1));
        record.insert("wait_cycles".into(), json!(0));
        record.insert("reason_to_wait".into(), json!(0));
        record.insert("is_error".into(), json!(false));
        record.insert("error".into(), json!("-"));
        topic.update(record);

        let mut found = false;
        for _ in 0..20 {
            thread::sleep(Duration::from_millis(100));
            if dir.path().join("p1.csv").parent().map(|p| fs::read_dir(p).unwrap().count() > 0).unwrap_or(false) {
                found = true;
                break;
            }
        }
        term.set();
        handle.join().unwrap();
        assert!(found, "expected a rotated perf csv file to appear in the perf directory");
    }
}
