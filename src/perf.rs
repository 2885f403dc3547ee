//! Adaptive circuit-breaker around provider calls.
//!
//! Grounded line-for-line on
//! `yamc.providers.performance.PerformanceProvider.wrapper`: pause cycles
//! on error or on a slow response, optional exponential backoff, capped at
//! `max_waiting_cycles`, and a performance record published to
//! `yamc/performance/providers/<component_id>` on every invocation
//! (including skipped ones).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::bus::Topic;
use crate::testutil::is_test_mode;
use crate::value::Record;

/// Errors a governed call can raise. Only `Operational` is handled by the
/// governor; any other error is unexpected and bubbles straight out of
/// [`Governor::call`].
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("operational error: {0}")]
    Operational(String),
    #[error("unexpected provider error: {0}")]
    Other(String),
}

/// A deterministic fingerprint over a governed call's identity, used to key
/// [`PerfState`] so unrelated calls from the same component don't share a
/// pause cycle.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PerfKey(pub [u8; 32]);

impl PerfKey {
    pub fn new(component_id: &str, call_args: &str, id_value: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(component_id.as_bytes());
        hasher.update(call_args.as_bytes());
        hasher.update(id_value.as_bytes());
        PerfKey(*hasher.finalize().as_bytes())
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReasonToWait {
    Ok = 0,
    Error = 1,
    Slow = 2,
}

struct PerfState {
    id_value: String,
    started_time: f64,
    last_running_time_sec: f64,
    records: usize,
    cycles_to_wait: u32,
    cycles_to_wait_int: u32,
    last_error: Option<String>,
    reason_to_wait: ReasonToWait,
}

impl PerfState {
    fn new(id_value: String) -> Self {
        PerfState {
            id_value,
            started_time: 0.0,
            last_running_time_sec: 0.0,
            records: 0,
            cycles_to_wait: 0,
            cycles_to_wait_int: 0,
            last_error: None,
            reason_to_wait: ReasonToWait::Ok,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PauseConfig {
    pub running_time: f64,
    pub duration_cycles: u32,
    pub exponential_backoff: bool,
    pub max_waiting_cycles: u32,
}

impl Default for PauseConfig {
    fn default() -> Self {
        PauseConfig {
            running_time: 99_999_999.0,
            duration_cycles: 1,
            exponential_backoff: false,
            max_waiting_cycles: 10,
        }
    }
}

/// Wraps governed provider calls for one component, keyed by [`PerfKey`].
pub struct Governor {
    component_id: String,
    config: PauseConfig,
    perf_topic: Arc<Topic>,
    states: Mutex<HashMap<PerfKey, PerfState>>,
}

impl Governor {
    pub fn new(component_id: impl Into<String>, config: PauseConfig, perf_topic: Arc<Topic>) -> Self {
        Governor {
            component_id: component_id.into(),
            config,
            perf_topic,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `f` under the governor for `key`/`id_value`. Returns `Ok(None)`
    /// when the call was skipped because the key is currently pausing,
    /// `Ok(Some(record))` on a successful (governed) call, and `Err` only
    /// for non-operational errors, or for operational errors in test mode.
    pub fn call<F>(&self, key: &PerfKey, id_value: &str, f: F) -> Result<Option<Record>, ProviderError>
    where
        F: FnOnce() -> Result<Record, ProviderError>,
    {
        let should_run = {
            let mut states = self.states.lock().expect("perf states lock poisoned");
            let state = states
                .entry(key.clone())
                .or_insert_with(|| PerfState::new(id_value.to_string()));
            state.started_time = now_secs();
            state.last_error = None;
            if state.cycles_to_wait > 0 {
                state.cycles_to_wait -= 1;
                state.last_running_time_sec = 0.0;
                state.records = 0;
                false
            } else {
                true
            }
        };

        let result = if should_run {
            let start = Instant::now();
            match f() {
                Ok(record) => {
                    let elapsed = start.elapsed().as_secs_f64();
                    self.settle(key, Ok((elapsed, record.len())));
                    Some(Ok(record))
                }
                Err(ProviderError::Operational(msg)) => {
                    self.settle(key, Err(msg.clone()));
                    if is_test_mode() {
                        Some(Err(ProviderError::Operational(msg)))
                    } else {
                        None
                    }
                }
                Err(other) => Some(Err(other)),
            }
        } else {
            None
        };

        self.publish(key);

        match result {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => Err(e),
            None if should_run => Ok(None), // swallowed OperationalError, non-test-mode
            None => Ok(None),               // call skipped while pausing
        }
    }

    fn settle(&self, key: &PerfKey, outcome: Result<(f64, usize), String>) {
        let mut states = self.states.lock().expect("perf states lock poisoned");
        let state = states.get_mut(key).expect("perf state must exist");

        match outcome {
            Ok((elapsed, records)) => {
                state.last_running_time_sec = elapsed;
                state.records = records;
                state.last_error = None;
            }
            Err(msg) => {
                state.last_running_time_sec = 0.0;
                state.records = 0;
                state.last_error = Some(msg);
            }
        }

        let is_faulty = state.last_error.is_some() || state.last_running_time_sec > self.config.running_time;
        if is_faulty {
            if state.cycles_to_wait_int > 0 {
                if self.config.exponential_backoff {
                    state.cycles_to_wait_int = state.cycles_to_wait_int.saturating_mul(2);
                } else {
                    state.cycles_to_wait_int += 1;
                }
                state.cycles_to_wait_int = state.cycles_to_wait_int.min(self.config.max_waiting_cycles);
            } else {
                state.cycles_to_wait_int = self.config.duration_cycles.min(self.config.max_waiting_cycles);
            }
            state.cycles_to_wait = state.cycles_to_wait_int;
            state.reason_to_wait = if state.last_error.is_some() {
                ReasonToWait::Error
            } else {
                ReasonToWait::Slow
            };
        } else {
            state.cycles_to_wait = 0;
            state.cycles_to_wait_int = 0;
            state.reason_to_wait = ReasonToWait::Ok;
        }
    }

    fn publish(&self, key: &PerfKey) {
        let states = self.states.lock().expect("perf states lock poisoned");
        let state = states.get(key).expect("perf state must exist");

        let mut map = Map::new();
        map.insert("id".to_string(), Value::from(state.id_value.clone()));
        map.insert(
            "started_time".to_string(),
            serde_json::Number::from_f64(state.started_time)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        );
        map.insert("records".to_string(), Value::from(state.records as i64));
        map.insert(
            "running_time".to_string(),
            serde_json::Number::from_f64(state.last_running_time_sec)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        );
        map.insert("wait_cycles".to_string(), Value::from(state.cycles_to_wait));
        map.insert("reason_to_wait".to_string(), Value::from(state.reason_to_wait as i64));
        let is_error = if state.last_error.is_some() {
            Value::Bool(true)
        } else if state.reason_to_wait == ReasonToWait::Ok {
            Value::Bool(false)
        } else {
            Value::Null
        };
        map.insert("is_error".to_string(), is_error);
        map.insert(
            "error".to_string(),
            Value::from(state.last_error.clone().unwrap_or_else(|| "-".to_string())),
        );
        drop(states);

        self.perf_topic.update(map);
    }

    #[cfg(test)]
    fn cycles_to_wait(&self, key: &PerfKey) -> u32 {
        self.states
            .lock()
            .unwrap()
            .get(key)
            .map(|s| s.cycles_to_wait)
            .unwrap_or(0)
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX epoch")
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use std::cell::Cell;
    use std::thread;
    use std::time::Duration;

    fn governor(config: PauseConfig) -> Governor {
        let bus = EventBus::new();
        let topic = bus.add_topic("yamc/performance/providers/p1").unwrap();
        Governor::new("p1", config, topic)
    }

    fn empty_record() -> Record {
        Map::new()
    }

    #[test]
    fn cycles_to_wait_never_exceeds_max() {
        let gov = governor(PauseConfig {
            running_time: 99_999.0,
            duration_cycles: 100,
            exponential_backoff: true,
            max_waiting_cycles: 5,
            ..Default::default()
        });
        let key = PerfKey::new("p1", "[]", "n/a");
        for _ in 0..10 {
            let _ = gov.call(&key, "n/a", || Err(ProviderError::Operational("boom".into())));
            assert!(gov.cycles_to_wait(&key) <= 5);
        }
    }

    /// S2 — governor slow path: a 2s call with running_time=1.0 triggers
    /// reason=2 and a 2-cycle pause; the next two calls are skipped.
    #[test]
    fn s2_slow_path_pauses_then_resumes() {
        let gov = governor(PauseConfig {
            running_time: 1.0,
            duration_cycles: 2,
            exponential_backoff: false,
            max_waiting_cycles: 5,
        });
        let key = PerfKey::new("p1", "[]", "n/a");
        let calls = Cell::new(0);

        // Call 1: slow (simulated by sleeping past running_time).
        let r1 = gov.call(&key, "n/a", || {
            calls.set(calls.get() + 1);
            thread::sleep(Duration::from_millis(1100));
            Ok(empty_record())
        });
        assert!(r1.unwrap().is_some());
        assert_eq!(gov.cycles_to_wait(&key), 2);

        // Calls 2 and 3 are skipped (still pausing).
        let r2 = gov.call(&key, "n/a", || {
            calls.set(calls.get() + 1);
            Ok(empty_record())
        });
        assert!(r2.unwrap().is_none());
        let r3 = gov.call(&key, "n/a", || {
            calls.set(calls.get() + 1);
            Ok(empty_record())
        });
        assert!(r3.unwrap().is_none());
        assert_eq!(calls.get(), 1);

        // Call 4 runs again.
        let r4 = gov.call(&key, "n/a", || {
            calls.set(calls.get() + 1);
            Ok(empty_record())
        });
        assert!(r4.unwrap().is_some());
        assert_eq!(calls.get(), 2);
        assert_eq!(gov.cycles_to_wait(&key), 0);
    }

    /// S3 — governor error path with backoff: cycles_to_wait sequence
    /// 1, 2, 4, 5, 5 (capped) across consecutive failures.
    #[test]
    fn s3_error_path_backoff_sequence() {
        let gov = governor(PauseConfig {
            running_time: 1.0,
            duration_cycles: 1,
            exponential_backoff: true,
            max_waiting_cycles: 5,
        });
        let key = PerfKey::new("p1", "[]", "n/a");

        let expect_seq = [1u32, 2, 4, 5, 5];
        for expected in expect_seq {
            // Drain the pause from the previous failure, if any.
            while gov.cycles_to_wait(&key) > 0 {
                let _ = gov.call(&key, "n/a", || Ok(empty_record()));
            }
            let _ = gov.call(&key, "n/a", || Err(ProviderError::Operational("boom".into())));
            assert_eq!(gov.cycles_to_wait(&key), expected);
        }
    }

    #[test]
    fn test_mode_reraises_operational_error() {
        let _guard = crate::testutil::TestModeGuard::enable();
        let gov = governor(PauseConfig::default());
        let key = PerfKey::new("p1", "[]", "n/a");
        let result = gov.call(&key, "n/a", || Err(ProviderError::Operational("boom".into())));
        assert!(matches!(result, Err(ProviderError::Operational(_))));
    }

    #[test]
    fn non_operational_error_always_bubbles() {
        let gov = governor(PauseConfig::default());
        let key = PerfKey::new("p1", "[]", "n/a");
        let result = gov.call(&key, "n/a", || Err(ProviderError::Other("bug".into())));
        assert!(matches!(result, Err(ProviderError::Other(_))));
    }
}
