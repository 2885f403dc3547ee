//! Provider bridging a [`crate::state::State`] object's merged data into
//! per-path topics. Grounded on
//! `yamc/providers/event.py::StateProvider.on_data`.

use std::sync::Arc;

use serde_json::Value;

use super::{Provider, ProviderError};
use crate::bus::EventSource;
use crate::state::{State, StateRegistry};
use crate::value::{deep_find, walk_paths, Record};

pub struct StateProvider {
    component_id: String,
    topics: Arc<EventSource>,
    state: Arc<State>,
}

impl StateProvider {
    /// `topic_paths` are slash-joined paths into the state object's data
    /// (list segments as `a/b[0]/c`); each becomes its own topic, updated
    /// whenever the state's data changes at that path.
    pub fn new(
        component_id: impl Into<String>,
        state_name: &str,
        topic_paths: &[String],
        states: &StateRegistry,
    ) -> Arc<Self> {
        let component_id = component_id.into();
        let topics = Arc::new(EventSource::new());
        for path in topic_paths {
            topics
                .add_topic(path.clone())
                .expect("topic paths within one state provider must be unique");
        }

        let provider = Arc::new(StateProvider {
            component_id,
            topics,
            state: states.get_or_create(state_name),
        });

        let callback_target = provider.clone();
        provider
            .state
            .add_data_callback(Arc::new(move |data: &Record| callback_target.on_data(data)));

        provider
    }

    fn on_data(&self, data: &Record) {
        let value = Value::Object(data.clone());
        walk_paths(&value, &mut |path, sub_value| {
            if let Some(topic) = self.topics.select_one(path) {
                let record = match sub_value {
                    Value::Object(map) => map.clone(),
                    other => {
                        let mut m = Record::new();
                        m.insert("value".to_string(), other.clone());
                        m
                    }
                };
                topic.update(record);
            }
        });
    }

    pub fn topics(&self) -> &Arc<EventSource> {
        &self.topics
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        let data = Value::Object(self.state.data());
        deep_find(&data, path, '/').cloned()
    }
}

impl Provider for StateProvider {
    fn component_id(&self) -> &str {
        &self.component_id
    }

    fn source(&self) -> String {
        "n/a".to_string()
    }

    fn refresh(&self) -> Result<bool, ProviderError> {
        Ok(true)
    }
}
