//! [`WriterBackend`] that deep-merges every envelope's data into a named
//! [`State`], instead of persisting it externally.
//!
//! Grounded on `yamc/writers/state.py::StateWriter`: a trivial healthcheck
//! (state is always available in-process) and a `do_write` that merges each
//! item in turn, in batch order.

use std::sync::Arc;

use log::debug;

use super::{WriterBackend, WriterEnvelope};
use crate::error::Error;
use crate::state::State;

pub struct StateWriter {
    state: Arc<State>,
}

impl StateWriter {
    pub fn new(state: Arc<State>) -> Self {
        StateWriter { state }
    }
}

impl WriterBackend for StateWriter {
    fn do_write(&self, batch: &[WriterEnvelope]) -> Result<(), Error> {
        debug!("writing {} row(s) to the state object '{}'", batch.len(), self.state.name());
        for envelope in batch {
            self.state.update(envelope.data.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateRegistry;
    use crate::value::Record;
    use serde_json::json;

    #[test]
    fn do_write_merges_each_envelope_into_state() {
        let registry = StateRegistry::new();
        let state = registry.get_or_create("s1");
        let writer = StateWriter::new(state.clone());

        let mut d1 = Record::new();
        d1.insert("a".into(), json!(1));
        let mut d2 = Record::new();
        d2.insert("b".into(), json!(2));

        writer
            .do_write(&[
                WriterEnvelope { collector_id: "c1".into(), data: d1 },
                WriterEnvelope { collector_id: "c1".into(), data: d2 },
            ])
            .unwrap();

        assert_eq!(state.data().get("a"), Some(&json!(1)));
        assert_eq!(state.data().get("b"), Some(&json!(2)));
    }
}
