//! Generic name -> factory registry, replacing the reflective class loading
//! the original implementation used to instantiate providers, writers, and
//! collectors from a config-file type string.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Error;

type Factory<T> = Arc<dyn Fn(&serde_yaml::Value) -> Result<Arc<T>, Error> + Send + Sync>;

/// Maps a `type:` string from config (e.g. `"http"`, `"csv"`) to a factory
/// that builds the concrete implementation from that block's YAML.
pub struct Registry<T: ?Sized> {
    factories: HashMap<String, Factory<T>>,
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Registry {
            factories: HashMap::new(),
        }
    }
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&serde_yaml::Value) -> Result<Arc<T>, Error> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn build(&self, name: &str, config: &serde_yaml::Value) -> Result<Arc<T>, Error> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::validation(format!("unknown component type '{name}'")))?;
        factory(config)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}
