//! Process-wide shared state, replacing the original's module-level
//! globals (`yamc.config.exit_event`, `yamc.providers.EventSource`
//! singleton, `yamc.component.global_state`) with an explicit, owned
//! bundle threaded through every component at construction time.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::runtime::TerminationSignal;
use crate::scope::Scope;
use crate::state::StateRegistry;

/// Everything a provider, writer, or collector needs beyond its own config
/// block.
pub struct AppContext {
    pub bus: Arc<EventBus>,
    pub states: Arc<StateRegistry>,
    pub term: Arc<TerminationSignal>,
    /// Merge of the top-level config `scope:` block and registered custom
    /// functions, available to every expression evaluated in this process.
    pub base_scope: Scope,
}

impl AppContext {
    pub fn new(base_scope: Scope) -> Self {
        AppContext {
            bus: Arc::new(EventBus::new()),
            states: Arc::new(StateRegistry::new()),
            term: TerminationSignal::new(),
            base_scope,
        }
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new(Scope::new())
    }
}
