//! Writer pipeline: healthcheck caching, a non-blocking `write()` collectors
//! call, and a supervised `worker()` loop that batches the queue and drains
//! an on-disk backlog while unhealthy.
//!
//! Grounded on `yamc/writers/writer.py::Writer`.

pub mod backlog;
pub mod csv_writer;
pub mod rotation;
pub mod state_writer;
pub mod template;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::runtime::{TerminationSignal, WorkerComponent};
use crate::scope::Scope;
use crate::testutil::is_test_mode;
use crate::value::Record;

use backlog::Backlog;
pub use template::ConditionalTemplate;

/// One record queued for (or read back from) a writer, tagged with the
/// collector that produced it. Serializes to a flat `Record` for backlog
/// storage.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WriterEnvelope {
    pub collector_id: String,
    pub data: Record,
}

impl WriterEnvelope {
    fn to_record(&self) -> Record {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Record::new(),
        }
    }

    fn from_record(record: &Record) -> Result<Self, Error> {
        serde_json::from_value(Value::Object(record.clone())).map_err(|e| Error::validation(e.to_string()))
    }
}

/// A concrete write destination. `healthcheck` probes reachability without
/// writing; `do_write` delivers one already-batched slice of envelopes.
/// Returning `Error::HealthCheck` from either routes the batch to the
/// backlog and marks the writer unhealthy; any other error discards the
/// batch and only logs it, matching the original's `HealthCheckException`
/// vs. bare `Exception` split.
pub trait WriterBackend: Send + Sync {
    fn healthcheck(&self) -> Result<(), Error> {
        Ok(())
    }

    fn do_write(&self, batch: &[WriterEnvelope]) -> Result<(), Error>;

    /// Releases any file handles or sockets the backend holds open. Default
    /// no-op for backends (like [`state_writer`]) with nothing to release.
    fn close(&self) {}
}

#[derive(Clone, Debug)]
pub struct WriterConfig {
    pub write_interval: Duration,
    pub write_empty: bool,
    pub healthcheck_interval: Duration,
    pub disable_backlog: bool,
    pub batch_size: usize,
    pub disable_writer: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            write_interval: Duration::from_secs(10),
            write_empty: true,
            healthcheck_interval: Duration::from_secs(20),
            disable_backlog: false,
            batch_size: 100,
            disable_writer: false,
        }
    }
}

pub struct Writer {
    component_id: String,
    backend: Arc<dyn WriterBackend>,
    config: WriterConfig,
    is_healthy: AtomicBool,
    last_healthcheck: Mutex<Option<Instant>>,
    queue: Mutex<VecDeque<WriterEnvelope>>,
    backlog: Backlog,
    base_scope: Scope,
}

impl Writer {
    pub fn new(
        component_id: impl Into<String>,
        backend: Arc<dyn WriterBackend>,
        config: WriterConfig,
        backlog_dir: impl Into<PathBuf>,
        base_scope: Scope,
    ) -> Result<Arc<Self>, Error> {
        Ok(Arc::new(Writer {
            component_id: component_id.into(),
            backend,
            config,
            is_healthy: AtomicBool::new(false),
            last_healthcheck: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            backlog: Backlog::open(backlog_dir)?,
            base_scope,
        }))
    }

    fn healthcheck(&self) -> Result<(), Error> {
        if self.config.disable_writer {
            return Err(Error::HealthCheck(format!("writer '{}' is temporarily disabled", self.component_id)));
        }
        self.backend.healthcheck()
    }

    /// Re-probes only while unhealthy, and only after `healthcheck_interval`
    /// has elapsed since the last attempt — a writer that's currently
    /// healthy is trusted until a write actually fails.
    pub fn is_healthy(&self) -> bool {
        if !self.is_healthy.load(Ordering::SeqCst) {
            let mut last = self.last_healthcheck.lock().expect("writer lock poisoned");
            let due = match *last {
                None => true,
                Some(t) => t.elapsed() > self.config.healthcheck_interval,
            };
            if due {
                *last = Some(Instant::now());
                match self.healthcheck() {
                    Ok(()) => {
                        self.is_healthy.store(true, Ordering::SeqCst);
                        info!("the healthcheck succeeded for writer '{}'", self.component_id);
                    }
                    Err(e) => {
                        error!("the healthcheck failed on writer '{}': {e}", self.component_id);
                        info!("the backlog size is {}", self.backlog.size());
                        self.is_healthy.store(false, Ordering::SeqCst);
                    }
                }
            }
        }
        self.is_healthy.load(Ordering::SeqCst)
    }

    /// Non-blocking: called from a collector's thread, so it must never
    /// block on I/O. Builds `data_out` by running each data item through
    /// the conditional template, then enqueues (if healthy) or backlogs
    /// (if not, and backlog isn't disabled).
    pub fn write(
        &self,
        collector_id: &str,
        data: Vec<Record>,
        template: &ConditionalTemplate,
        call_scope: &Scope,
    ) -> Result<(), Error> {
        if data.is_empty() {
            debug!("the data for writer '{}' is empty", self.component_id);
            return Ok(());
        }

        let merged_base = self.base_scope.merged(call_scope);
        let mut data_out = Vec::with_capacity(data.len());
        for item in data {
            let mut scope = merged_base.clone();
            scope.set("data", item);
            let processed = template.eval(&scope)?;
            if !processed.is_empty() || self.config.write_empty {
                data_out.push(WriterEnvelope {
                    collector_id: collector_id.to_string(),
                    data: processed,
                });
            }
        }

        if self.is_healthy() {
            self.queue.lock().expect("writer lock poisoned").extend(data_out);
        } else if !self.config.disable_backlog {
            let records: Vec<Record> = data_out.iter().map(WriterEnvelope::to_record).collect();
            self.backlog.put(&records)?;
        }

        Ok(())
    }

    fn take_batch(&self) -> Vec<WriterEnvelope> {
        let mut queue = self.queue.lock().expect("writer lock poisoned");
        let n = self.config.batch_size.min(queue.len());
        queue.drain(..n).collect()
    }

    fn drain_queue(&self) -> Vec<WriterEnvelope> {
        self.queue.lock().expect("writer lock poisoned").drain(..).collect()
    }

    fn queue_len(&self) -> usize {
        self.queue.lock().expect("writer lock poisoned").len()
    }

    pub(crate) fn process_queue(&self) {
        if !self.is_healthy() {
            return;
        }
        let batch = self.take_batch();
        if batch.is_empty() {
            return;
        }
        debug!(
            "writing the batch for writer '{}', batch-size={}, queue-size={}",
            self.component_id,
            batch.len(),
            self.queue_len()
        );
        if is_test_mode() {
            debug!("running in test mode, the writing operation is disabled");
            return;
        }
        match self.backend.do_write(&batch) {
            Ok(()) => {}
            Err(Error::HealthCheck(msg)) => {
                error!(
                    "cannot write the batch for writer '{}' due to the writer's problem: {msg}. \
                     the batch will be stored in the backlog",
                    self.component_id
                );
                self.is_healthy.store(false, Ordering::SeqCst);
                let records: Vec<Record> = batch.iter().map(WriterEnvelope::to_record).collect();
                if let Err(e) = self.backlog.put(&records) {
                    error!("failed to persist batch to the backlog: {e}");
                }
            }
            Err(e) => {
                error!(
                    "cannot write the batch for writer '{}', it will be discarded due to: {e}",
                    self.component_id
                );
            }
        }
    }

    fn process_backlog(&self) {
        let backend = &self.backend;
        let ok = self.backlog.process(self.config.batch_size, |records| {
            let envelopes = records
                .iter()
                .map(WriterEnvelope::from_record)
                .collect::<Result<Vec<_>, _>>()?;
            backend.do_write(&envelopes)
        });
        if !ok {
            self.is_healthy.store(false, Ordering::SeqCst);
        }
    }
}

impl WorkerComponent for Writer {
    fn component_id(&self) -> &str {
        &self.component_id
    }

    fn worker(self: Arc<Self>, term: Arc<TerminationSignal>) {
        loop {
            self.process_queue();
            if self.is_healthy() {
                self.process_backlog();
            }
            if term.wait_timeout(self.config.write_interval) {
                break;
            }
        }

        info!("ending the writer thread '{}'", self.component_id);
        self.process_queue();

        let remaining = self.drain_queue();
        if !remaining.is_empty() {
            info!(
                "there are {} unprocessed items in the queue of writer '{}', writing them all to the backlog",
                remaining.len(),
                self.component_id
            );
            let records: Vec<Record> = remaining.iter().map(WriterEnvelope::to_record).collect();
            if let Err(e) = self.backlog.put(&records) {
                error!("failed to persist the remaining queue to the backlog: {e}");
            }
        }
        info!("the writer thread '{}' ended", self.component_id);
    }

    fn destroy(&self) {
        self.backend.close();
    }
}
