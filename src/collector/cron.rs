//! Cron-scheduled collector: runs `BaseCollector::prepare_data`/`write` on
//! a `cron`-expression schedule, catching up (logging, not sleeping
//! negative durations) if a run was missed.
//!
//! Grounded on `yamc/collectors/collector.py::CronCollector`.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Local;
use cron::Schedule;
use log::{debug, error, info, warn};

use super::BaseCollector;
use crate::runtime::{TerminationSignal, WorkerComponent};

pub struct CronCollector {
    base: BaseCollector,
    schedule: Schedule,
}

impl CronCollector {
    pub fn new(base: BaseCollector, cron_expr: &str) -> Result<Self, crate::error::Error> {
        let schedule = Schedule::from_str(cron_expr)
            .map_err(|e| crate::error::Error::validation(format!("invalid schedule '{cron_expr}': {e}")))?;
        Ok(CronCollector { base, schedule })
    }

    /// Seconds until the next scheduled run, re-querying the schedule if
    /// the computed run time has already passed (matches the original's
    /// "next run already passed, trying the next iteration" loop).
    fn time_to_sleep(&self) -> Duration {
        loop {
            let now = Local::now();
            let Some(next_run) = self.schedule.after(&now).next() else {
                return Duration::from_secs(60);
            };
            let seconds = (next_run - now).num_milliseconds();
            if seconds > 0 {
                info!(
                    "the next job of '{}' will run in {:.1}s (@{next_run})",
                    self.base.component_id(),
                    seconds as f64 / 1000.0
                );
                return Duration::from_millis(seconds as u64);
            }
            warn!(
                "the next run of the job '{}' already passed by {:.1}s, trying the next iteration",
                self.base.component_id(),
                -(seconds as f64) / 1000.0
            );
        }
    }

    fn now_epoch_secs() -> f64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
    }

    fn run_once(&self) {
        info!("running job '{}'", self.base.component_id());
        let result = self
            .base
            .prepare_data(None)
            .and_then(|data| self.base.write(data, None, Self::now_epoch_secs()));
        if let Err(e) = result {
            error!("the job '{}' failed due to: {e}", self.base.component_id());
        }
    }
}

impl WorkerComponent for CronCollector {
    fn component_id(&self) -> &str {
        self.base.component_id()
    }

    fn worker(self: Arc<Self>, term: Arc<TerminationSignal>) {
        if !self.base.enabled() {
            debug!("the collector '{}' is disabled, the worker is not running", self.base.component_id());
            return;
        }
        debug!("running the cron collector thread for '{}'", self.base.component_id());
        let mut sleep_for = self.time_to_sleep();
        loop {
            if term.wait_timeout(sleep_for) {
                break;
            }
            self.run_once();
            sleep_for = self.time_to_sleep();
        }
    }
}
