//! Shared, mergeable state containers with an embedded timer facility.
//!
//! Grounded on `yamc.component.{State, GlobalState}`: a [`State`] holds a
//! [`Record`](crate::value::Record) that only ever grows by deep merge, plus
//! named timers that fire once and re-enter the same update path. Providers
//! like `StateProvider` read a `State`; writers and collectors update it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::value::{deep_merge_record, Record};

type DataCallback = Arc<dyn Fn(&Record) + Send + Sync>;

struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

struct StateInner {
    data: Record,
    timers: HashMap<String, TimerHandle>,
}

/// A named, shared data container. Cheap to clone the handle (`Arc<State>`);
/// the container itself is interior-mutable.
pub struct State {
    name: String,
    inner: Mutex<StateInner>,
    data_callbacks: Mutex<Vec<DataCallback>>,
}

impl State {
    fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(State {
            name: name.into(),
            inner: Mutex::new(StateInner {
                data: Record::new(),
                timers: HashMap::new(),
            }),
            data_callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> Record {
        self.inner.lock().expect("state lock poisoned").data.clone()
    }

    pub fn add_data_callback(&self, callback: DataCallback) {
        self.data_callbacks
            .lock()
            .expect("callbacks lock poisoned")
            .push(callback);
    }

    /// Processes a `timer` block if present (arming, cancelling, or no-op
    /// on a already-armed timer), strips it from `data`, notifies every
    /// data callback with the remainder, then deep-merges it into state.
    pub fn update(self: &Arc<Self>, mut data: Record) {
        if let Some(Value::Object(timer_block)) = data.get("timer").cloned() {
            for (name, entry) in timer_block.iter() {
                self.handle_timer_entry(name, entry, &timer_block);
            }
        }
        data.remove("timer");

        self.notify_callbacks(&data);

        let mut inner = self.inner.lock().expect("state lock poisoned");
        inner.data = deep_merge_record(&inner.data, &data);
    }

    fn handle_timer_entry(self: &Arc<Self>, name: &str, entry: &Value, timer_block: &Record) {
        let value = match entry.get("value").and_then(Value::as_f64) {
            Some(v) => v,
            None => {
                log::error!(target: "siphon::state", "cannot handle the timer '{name}': missing or invalid 'value'");
                return;
            }
        };

        let mut inner = self.inner.lock().expect("state lock poisoned");
        let exists = inner.timers.contains_key(name);

        if !exists && value > 0.0 {
            log::info!(target: "siphon::state", "the timer created, name='{name}', timeout={value}");
            let cancelled = Arc::new(AtomicBool::new(false));
            inner.timers.insert(
                name.to_string(),
                TimerHandle {
                    cancelled: cancelled.clone(),
                },
            );
            drop(inner);
            self.spawn_timer(name.to_string(), value, timer_block.clone(), cancelled);
        } else if exists && value == 0.0 {
            log::info!(target: "siphon::state", "the timer cancelled, name='{name}', timeout=0");
            if let Some(handle) = inner.timers.remove(name) {
                handle.cancelled.store(true, Ordering::SeqCst);
            }
        } else if exists {
            log::debug!(target: "siphon::state", "the timer '{name}' already exists and it will not be updated");
        }
    }

    fn spawn_timer(self: &Arc<Self>, name: String, seconds: f64, timer_block: Record, cancelled: Arc<AtomicBool>) {
        let state = Arc::clone(self);
        thread::spawn(move || {
            const POLL: Duration = Duration::from_millis(100);
            let mut waited = Duration::ZERO;
            let target = Duration::from_secs_f64(seconds.max(0.0));
            while waited < target {
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }
                let step = POLL.min(target - waited);
                thread::sleep(step);
                waited += step;
            }
            if !cancelled.load(Ordering::SeqCst) {
                state.on_timer_fired(&name, timer_block);
            }
        });
    }

    fn on_timer_fired(self: &Arc<Self>, name: &str, timer_block: Record) {
        let still_armed = {
            let mut inner = self.inner.lock().expect("state lock poisoned");
            inner.timers.remove(name).is_some()
        };
        if !still_armed {
            return;
        }
        let value = timer_block
            .get(name)
            .and_then(|v| v.get("value"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        log::info!(target: "siphon::state", "timer elapsed after {value} seconds");

        let mut payload = Record::new();
        payload.insert("timer".to_string(), Value::Object(timer_block));
        self.notify_callbacks(&payload);
    }

    fn notify_callbacks(&self, data: &Record) {
        for cb in self.data_callbacks.lock().expect("callbacks lock poisoned").iter() {
            cb(data);
        }
    }
}

/// Keyed `State` allocation, one per distinct name, shared across every
/// component that asks for it. Mirrors `yamc.component.GlobalState`.
#[derive(Default)]
pub struct StateRegistry {
    states: Mutex<HashMap<String, Arc<State>>>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, name: &str) -> Arc<State> {
        let mut states = self.states.lock().expect("state registry lock poisoned");
        states
            .entry(name.to_string())
            .or_insert_with(|| State::new(name))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;
    use std::time::Duration as StdDuration;

    fn record_from(v: serde_json::Value) -> Record {
        match v {
            serde_json::Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn update_deep_merges_and_strips_timer_block() {
        let registry = StateRegistry::new();
        let state = registry.get_or_create("s1");
        state.update(record_from(json!({"x": 1, "nested": {"a": 1}})));
        state.update(record_from(json!({"nested": {"b": 2}}, )));
        assert_eq!(state.data().get("x"), Some(&json!(1)));
        assert_eq!(state.data().get("nested"), Some(&json!({"a": 1, "b": 2})));
        assert!(!state.data().contains_key("timer"));
    }

    #[test]
    fn get_or_create_returns_the_same_instance() {
        let registry = StateRegistry::new();
        let a = registry.get_or_create("shared");
        a.update(record_from(json!({"x": 1})));
        let b = registry.get_or_create("shared");
        assert_eq!(b.data().get("x"), Some(&json!(1)));
    }

    #[test]
    fn data_callback_receives_data_without_timer_block() {
        let registry = StateRegistry::new();
        let state = registry.get_or_create("s2");
        let (tx, rx) = mpsc::channel();
        state.add_data_callback(Arc::new(move |data: &Record| {
            tx.send(data.clone()).unwrap();
        }));
        state.update(record_from(json!({"x": 5, "timer": {"t1": {"value": 0}}})));
        let received = rx.recv().unwrap();
        assert_eq!(received.get("x"), Some(&json!(5)));
        assert!(!received.contains_key("timer"));
    }

    #[test]
    fn cancelling_an_unarmed_timer_is_a_no_op() {
        let registry = StateRegistry::new();
        let state = registry.get_or_create("s3");
        // value == 0 with no existing timer: neither arms nor errors.
        state.update(record_from(json!({"timer": {"t1": {"value": 0}}})));
    }

    #[test]
    fn short_timer_fires_and_invokes_callback() {
        let registry = StateRegistry::new();
        let state = registry.get_or_create("s4");
        let (tx, rx) = mpsc::channel();
        state.add_data_callback(Arc::new(move |data: &Record| {
            if data.contains_key("timer") {
                tx.send(()).unwrap();
            }
        }));
        state.update(record_from(json!({"timer": {"t1": {"value": 0.05}}})));
        rx.recv_timeout(StdDuration::from_secs(2))
            .expect("timer callback should fire within 2s");
    }

    #[test]
    fn cancelling_an_armed_timer_prevents_it_firing() {
        let registry = StateRegistry::new();
        let state = registry.get_or_create("s5");
        let (tx, rx) = mpsc::channel::<()>();
        state.add_data_callback(Arc::new(move |data: &Record| {
            if data.contains_key("timer") {
                let _ = tx.send(());
            }
        }));
        state.update(record_from(json!({"timer": {"t1": {"value": 0.3}}})));
        state.update(record_from(json!({"timer": {"t1": {"value": 0}}})));
        assert!(rx.recv_timeout(StdDuration::from_millis(600)).is_err());
    }
}
