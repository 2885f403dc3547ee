//! S4 from spec.md §8: a writer whose backend fails its first three flushes
//! then recovers must still deliver every envelope, in submission order,
//! and leave its backlog directory empty.
//!
//! `batch_size` is left at its default (100), so all ten envelopes queue
//! and are pulled into a single batch before the first flush attempt - one
//! `do_write` call is one "flush" the way the scenario describes it, and
//! order is trivially preserved since the batch is carried as one `Vec`
//! through the queue, the backlog file, and back.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::json;
use siphon::error::Error;
use siphon::runtime::{TerminationSignal, WorkerComponent};
use siphon::scope::Scope;
use siphon::value::Record;
use siphon::writer::template::{from_yaml, ConditionalTemplate};
use siphon::writer::{Writer, WriterBackend, WriterConfig, WriterEnvelope};

struct FlakyBackend {
    failures_remaining: AtomicUsize,
    writes: Mutex<Vec<WriterEnvelope>>,
}

impl FlakyBackend {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(FlakyBackend { failures_remaining: AtomicUsize::new(failures), writes: Mutex::new(Vec::new()) })
    }
}

impl WriterBackend for FlakyBackend {
    fn do_write(&self, batch: &[WriterEnvelope]) -> Result<(), Error> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::HealthCheck(format!("not ready yet, {remaining} flush(es) left to fail")));
        }
        self.writes.lock().unwrap().extend_from_slice(batch);
        Ok(())
    }
}

fn template() -> ConditionalTemplate {
    let yaml: serde_yaml::Value = serde_yaml::from_str("$def:\n  v: \"=data.v\"\n").unwrap();
    ConditionalTemplate::new(from_yaml(&yaml).unwrap())
}

#[test]
fn ten_envelopes_recover_in_order_after_three_failed_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let backlog_dir = dir.path().join("backlog");
    let backend = FlakyBackend::new(3);
    let writer = Writer::new(
        "w1",
        backend.clone(),
        WriterConfig {
            write_interval: Duration::from_millis(10),
            healthcheck_interval: Duration::from_millis(5),
            ..Default::default()
        },
        backlog_dir.clone(),
        Scope::new(),
    )
    .unwrap();

    let tpl = template();
    for i in 0..10 {
        let mut record = Record::new();
        record.insert("v".to_string(), json!(i as i64));
        writer.write("c1", vec![record], &tpl, &Scope::new()).unwrap();
    }

    let term = TerminationSignal::new();
    let worker_writer = writer.clone();
    let worker_term = term.clone();
    let handle = thread::spawn(move || worker_writer.worker(worker_term));

    let mut delivered = Vec::new();
    for _ in 0..100 {
        thread::sleep(Duration::from_millis(50));
        let writes = backend.writes.lock().unwrap();
        if writes.len() >= 10 {
            delivered = writes.clone();
            break;
        }
    }

    term.set();
    handle.join().unwrap();

    assert_eq!(delivered.len(), 10, "all ten envelopes must eventually be delivered");
    for (i, envelope) in delivered.iter().enumerate() {
        assert_eq!(envelope.data.get("v"), Some(&json!(i as i64)), "envelopes must be delivered in submission order");
    }

    let remaining_backlog_files = fs::read_dir(&backlog_dir).unwrap().count();
    assert_eq!(remaining_backlog_files, 0, "the backlog directory must end up empty after recovery");
}
