//! Worker thread lifecycle: a process-wide termination latch, the worker
//! component contract, and the supervisor that starts/stops them in order.
//!
//! Grounded on `yamc.component.WorkerComponent` (start/running/join over a
//! daemon thread) for the per-component shape, and on the teacher's
//! notifier/shutdown-flag idiom for the latch itself, reimplemented here as
//! a `Condvar`-backed flag instead of a platform eventfd since siphon's
//! shutdown signal is in-process only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A broadcastable, idempotent "please stop" signal shared by every worker
/// thread in the process.
#[derive(Default)]
pub struct TerminationSignal {
    flag: Mutex<bool>,
    cv: Condvar,
}

impl TerminationSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sets the flag and wakes every thread blocked in [`wait_timeout`].
    /// Idempotent.
    pub fn set(&self) {
        let mut flag = self.flag.lock().expect("termination signal lock poisoned");
        *flag = true;
        self.cv.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock().expect("termination signal lock poisoned")
    }

    /// Sleeps up to `timeout`, waking early if the signal is set. Returns
    /// `true` if the signal was (or became) set. This is the primitive
    /// collectors use for their cron/poll sleep instead of a plain
    /// `thread::sleep`, so shutdown isn't delayed by the sleep interval.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let flag = self.flag.lock().expect("termination signal lock poisoned");
        if *flag {
            return true;
        }
        let (flag, _) = self
            .cv
            .wait_timeout(flag, timeout)
            .expect("termination signal lock poisoned");
        *flag
    }
}

/// The contract every daemon thread (provider-driving collector, writer
/// flush loop) implements. `worker` runs until `term.is_set()`, checking
/// periodically via `term.wait_timeout`.
pub trait WorkerComponent: Send + Sync {
    fn component_id(&self) -> &str;
    fn worker(self: Arc<Self>, term: Arc<TerminationSignal>);

    /// Releases non-memory resources (file handles, sockets) the component
    /// holds. Called once per component, after its worker thread has been
    /// joined, so it never races the worker loop. Default no-op for
    /// components with nothing to release beyond ordinary `Drop`.
    fn destroy(&self) {}
}

struct Started {
    component_id: String,
    start_time: Instant,
    handle: JoinHandle<()>,
    component: Arc<dyn WorkerComponent>,
}

/// Starts writers before collectors (so no collected record is ever produced
/// before a writer exists to receive it) and joins them in reverse order on
/// shutdown.
pub struct Supervisor {
    term: Arc<TerminationSignal>,
    writers: Vec<Arc<dyn WorkerComponent>>,
    collectors: Vec<Arc<dyn WorkerComponent>>,
    started: Mutex<Vec<Started>>,
    is_started: AtomicBool,
}

impl Supervisor {
    pub fn new(term: Arc<TerminationSignal>) -> Self {
        Supervisor {
            term,
            writers: Vec::new(),
            collectors: Vec::new(),
            started: Mutex::new(Vec::new()),
            is_started: AtomicBool::new(false),
        }
    }

    pub fn add_writer(&mut self, writer: Arc<dyn WorkerComponent>) {
        self.writers.push(writer);
    }

    pub fn add_collector(&mut self, collector: Arc<dyn WorkerComponent>) {
        self.collectors.push(collector);
    }

    /// Spawns every registered worker thread. A no-op on any call after the
    /// first, so a caller that can't easily tell whether `start` already ran
    /// (e.g. retried startup logic) never ends up with duplicate threads
    /// racing over the same writers and collectors.
    pub fn start(&self) {
        if self.is_started.swap(true, Ordering::SeqCst) {
            log::warn!(target: "siphon::runtime", "supervisor already started, ignoring the duplicate start() call");
            return;
        }
        let mut started = self.started.lock().expect("supervisor lock poisoned");
        for component in self.writers.iter().chain(self.collectors.iter()) {
            started.push(self.spawn(component.clone()));
        }
    }

    fn spawn(&self, component: Arc<dyn WorkerComponent>) -> Started {
        let component_id = component.component_id().to_string();
        log::info!(target: "siphon::runtime", "starting the worker thread '{component_id}'");
        let term = self.term.clone();
        let worker_component = component.clone();
        let handle = thread::Builder::new()
            .name(component_id.clone())
            .spawn(move || worker_component.worker(term))
            .expect("failed to spawn worker thread");
        Started {
            component_id,
            start_time: Instant::now(),
            handle,
            component,
        }
    }

    /// Signals termination and joins every worker thread, writers last so
    /// they have the chance to drain whatever collectors just produced. Each
    /// component's `destroy()` runs right after its own thread is joined, so
    /// resource release never races that component's worker loop.
    pub fn destroy(self) {
        self.term.set();
        let mut started = self.started.into_inner().expect("supervisor lock poisoned");
        started.reverse();
        for component in started {
            log::info!(
                target: "siphon::runtime",
                "joining the worker thread '{}' after {:.1}s uptime",
                component.component_id,
                component.start_time.elapsed().as_secs_f64()
            );
            if component.handle.join().is_err() {
                log::error!(target: "siphon::runtime", "worker thread '{}' panicked", component.component_id);
            }
            component.component.destroy();
        }
    }

    pub fn running_count(&self) -> usize {
        self.started
            .lock()
            .expect("supervisor lock poisoned")
            .iter()
            .filter(|s| !s.handle.is_finished())
            .count()
    }
}
