//! Data providers: the pull (HTTP/XML/CSV) and push (event/state) sources
//! collectors read from. Grounded on `yamc/providers/provider.py` and
//! `yamc/providers/event.py`.

mod csv_http;
mod event;
mod http;
mod state_provider;
mod xml_http;

pub use csv_http::CsvHttpProvider;
pub use event::EventProvider;
pub use http::HttpProvider;
pub use state_provider::StateProvider;
pub use xml_http::XmlHttpProvider;

use std::collections::HashMap;
use std::sync::Mutex;

pub use crate::perf::ProviderError;
use crate::scope::ScopeValue;

/// Every provider kind's shared interface: identity, a human-readable
/// source description (used in log lines), and the one-shot refresh that
/// the governor wraps.
pub trait Provider: Send + Sync {
    fn component_id(&self) -> &str;
    fn source(&self) -> String;

    /// Pulls fresh data if the cache is stale, returning `true` if a fetch
    /// actually happened. Wrapped by `siphon::perf::Governor::call` in the
    /// collector path.
    fn refresh(&self) -> Result<bool, ProviderError>;

    /// Bindings exposed to expressions as `providers.<id>.<name>(...)`.
    fn scope_functions(self: std::sync::Arc<Self>) -> Vec<(&'static str, ScopeValue)>
    where
        Self: Sized,
    {
        Vec::new()
    }
}

#[derive(Default)]
struct DiffEntry {
    prev_value: Option<f64>,
    last_value: Option<f64>,
}

/// Per-provider running-difference tracker, shared by every provider kind.
/// Grounded on `BaseProvider.diff`: the first observation of an id returns
/// `0`; every later one returns `value - previous`.
#[derive(Default)]
pub struct DiffStorage {
    entries: Mutex<HashMap<String, DiffEntry>>,
}

impl DiffStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diff(&self, id: &str, value: f64) -> f64 {
        let mut entries = self.entries.lock().expect("diff storage lock poisoned");
        let entry = entries.entry(id.to_string()).or_default();
        match entry.last_value {
            Some(last) => {
                entry.prev_value = Some(last);
                entry.last_value = Some(value);
                value - last
            }
            None => {
                entry.last_value = Some(value);
                0.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_first_call_is_zero_then_deltas() {
        let storage = DiffStorage::new();
        assert_eq!(storage.diff("x", 10.0), 0.0);
        assert_eq!(storage.diff("x", 14.0), 4.0);
        assert_eq!(storage.diff("x", 12.0), -2.0);
    }

    #[test]
    fn diff_tracks_ids_independently() {
        let storage = DiffStorage::new();
        assert_eq!(storage.diff("a", 1.0), 0.0);
        assert_eq!(storage.diff("b", 100.0), 0.0);
        assert_eq!(storage.diff("a", 3.0), 2.0);
    }
}
