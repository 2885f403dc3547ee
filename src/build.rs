//! Turns a loaded [`Config`] into a live object graph registered with a
//! [`Supervisor`]: writers first, then providers (capturing their scope
//! functions before they're type-erased), then collectors bound to both.
//!
//! Grounded on `yamc/commands/run.py::run`, which walks the same three
//! config sections in the same order and hands each block's `class:` string
//! to `yamc.utils.import_class` for reflective instantiation. `registry.rs`
//! is the static, compile-time substitute for that reflection; this module
//! is the part of `run.py` that decides *which* factories exist and wires
//! their outputs together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_yaml::{Mapping, Value};

use crate::bus::{EventBus, EventSource, Topic};
use crate::collector::cron::CronCollector;
use crate::collector::event::EventCollector;
use crate::collector::{BaseCollector, DataDef, WriterBinding};
use crate::config::Config;
use crate::error::Error;
use crate::expr::Expression;
use crate::provider::{CsvHttpProvider, EventProvider, HttpProvider, Provider, StateProvider, XmlHttpProvider};
use crate::registry::Registry;
use crate::runtime::{Supervisor, TerminationSignal};
use crate::scope::{Scope, ScopeValue};
use crate::state::StateRegistry;
use crate::writer::csv_writer::CsvWriter;
use crate::writer::state_writer::StateWriter;
use crate::writer::template::from_yaml;
use crate::writer::{ConditionalTemplate, Writer, WriterBackend, WriterConfig};

/// A provider built from config: the erased trait object collectors call
/// through, the scope functions captured from the concrete type before
/// erasure (`Provider::scope_functions` needs `Self: Sized`), and, for the
/// push-based kinds, the private topic source `topics:` entries resolve
/// against.
#[derive(Clone)]
struct BuiltProvider {
    provider: Arc<dyn Provider>,
    scope_functions: Vec<(&'static str, ScopeValue)>,
    topics: Option<Arc<EventSource>>,
}

fn req_str<'a>(block: &'a Value, key: &str) -> Result<&'a str, Error> {
    block
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::validation(format!("'{key}' is required and must be a string")))
}

fn opt_str(block: &Value, key: &str) -> Option<String> {
    block.get(key).and_then(Value::as_str).map(str::to_string)
}

fn opt_u64(block: &Value, key: &str) -> Option<u64> {
    block.get(key).and_then(Value::as_i64).map(|n| n.max(0) as u64)
}

fn secs(block: &Value, key: &str, default: u64) -> Duration {
    Duration::from_secs(opt_u64(block, key).unwrap_or(default))
}

fn opt_bool(block: &Value, key: &str, default: bool) -> bool {
    block.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn opt_usize(block: &Value, key: &str, default: usize) -> usize {
    block.get(key).and_then(Value::as_i64).map(|n| n.max(0) as usize).unwrap_or(default)
}

fn str_list(block: &Value, key: &str) -> Vec<String> {
    match block.get(key) {
        Some(Value::Sequence(items)) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

/// Registry factories see only the component's own config block, which has
/// no notion of the `id` under which it's registered in config, or of the
/// config file's directory `filename`-style keys are resolved against.
/// Stashing both under the block itself lets every factory stay a plain
/// `Fn(&Value) -> ... + 'static` closure with no borrow of `Config` itself
/// (which does not outlive `wire`).
fn with_id(config: &Config, block: &Value, id: &str) -> Value {
    let mut map = match block {
        Value::Mapping(m) => m.clone(),
        _ => Mapping::new(),
    };
    map.insert(Value::String("__id".to_string()), Value::String(id.to_string()));
    if let Some(filename) = block.get("filename").and_then(Value::as_str) {
        let resolved = config.resolve_path(filename).to_string_lossy().into_owned();
        map.insert(Value::String("filename".to_string()), Value::String(resolved));
    }
    Value::Mapping(map)
}

fn component_id(block: &Value) -> Result<String, Error> {
    req_str(block, "__id").map(str::to_string)
}

fn writer_config_from(block: &Value) -> WriterConfig {
    WriterConfig {
        write_interval: secs(block, "write_interval", 10),
        write_empty: opt_bool(block, "write_empty", true),
        healthcheck_interval: secs(block, "healthcheck_interval", 20),
        disable_backlog: opt_bool(block, "disable_backlog", false),
        batch_size: opt_usize(block, "batch_size", 100),
        disable_writer: opt_bool(block, "disable_writer", false),
    }
}

fn writer_backend_registry(states: Arc<StateRegistry>) -> Registry<dyn WriterBackend> {
    let mut registry: Registry<dyn WriterBackend> = Registry::new();

    registry.register("csv", move |cfg: &Value| {
        // `filename` arrives already resolved to an absolute path by `with_id`.
        let filename = req_str(cfg, "filename")?.to_string();
        let columns = str_list(cfg, "columns");
        if columns.is_empty() {
            return Err(Error::validation("a csv writer requires a non-empty 'columns' list"));
        }
        let retention_days = opt_u64(cfg, "retention_days").map(|n| n as u32);
        Ok(Arc::new(CsvWriter::new(filename, columns, retention_days)) as Arc<dyn WriterBackend>)
    });

    registry.register("state", {
        let states = states.clone();
        move |cfg: &Value| {
            let name = req_str(cfg, "name")?;
            Ok(Arc::new(StateWriter::new(states.get_or_create(name))) as Arc<dyn WriterBackend>)
        }
    });

    registry
}

fn provider_registry(term: Arc<TerminationSignal>, states: Arc<StateRegistry>) -> Registry<BuiltProvider> {
    let mut registry: Registry<BuiltProvider> = Registry::new();

    registry.register("http", {
        let term = term.clone();
        move |cfg: &Value| {
            let id = component_id(cfg)?;
            let url = req_str(cfg, "url")?.to_string();
            let max_age = secs(cfg, "max_age", 10);
            let init_url = opt_str(cfg, "init_url");
            let init_max_age = opt_u64(cfg, "init_max_age").map(Duration::from_secs);
            let provider = Arc::new(HttpProvider::new(id, url, max_age, init_url, init_max_age, term.clone()));
            let scope_functions = provider.clone().scope_functions();
            Ok(Arc::new(BuiltProvider { provider, scope_functions, topics: None }))
        }
    });

    registry.register("xml_http", {
        let term = term.clone();
        move |cfg: &Value| {
            let id = component_id(cfg)?;
            let url = req_str(cfg, "url")?.to_string();
            let max_age = secs(cfg, "max_age", 10);
            let str_decode_unicode = opt_bool(cfg, "str_decode_unicode", true);
            let provider = Arc::new(XmlHttpProvider::new(id, url, max_age, str_decode_unicode, term.clone()));
            let scope_functions = provider.clone().scope_functions();
            Ok(Arc::new(BuiltProvider { provider, scope_functions, topics: None }))
        }
    });

    registry.register("csv_http", {
        let term = term.clone();
        move |cfg: &Value| {
            let id = component_id(cfg)?;
            let url = req_str(cfg, "url")?.to_string();
            let max_age = secs(cfg, "max_age", 10);
            let delimiter = opt_str(cfg, "delimiter").and_then(|d| d.chars().next()).unwrap_or(',');
            let str_decode_unicode = opt_bool(cfg, "str_decode_unicode", true);
            let provider = Arc::new(CsvHttpProvider::new(id, url, max_age, delimiter, str_decode_unicode, term.clone()));
            let scope_functions = provider.clone().scope_functions();
            Ok(Arc::new(BuiltProvider { provider, scope_functions, topics: None }))
        }
    });

    registry.register("event", {
        let term = term.clone();
        move |cfg: &Value| {
            let id = component_id(cfg)?;
            let topic_ids = str_list(cfg, "topics");
            let provider = EventProvider::new(id, &topic_ids, term.clone());
            let topics = provider.topics().clone();
            Ok(Arc::new(BuiltProvider { provider, scope_functions: Vec::new(), topics: Some(topics) }))
        }
    });

    registry.register("state", {
        let states = states.clone();
        move |cfg: &Value| {
            let id = component_id(cfg)?;
            let state_name = req_str(cfg, "name")?;
            let topic_paths = str_list(cfg, "topics");
            let provider = StateProvider::new(id, state_name, &topic_paths, &states);
            let topics = provider.topics().clone();
            Ok(Arc::new(BuiltProvider { provider, scope_functions: Vec::new(), topics: Some(topics) }))
        }
    });

    registry
}

/// Resolves one `collectors.*.topics[]` entry to a live topic. An entry
/// containing `/` addresses a push-based provider's own topic by
/// `<provider_id>/<topic_path>` (the provider's topic ids are themselves
/// slash-joined paths for `state`, so only the first segment is taken as the
/// provider id); a bare entry addresses a topic on the shared process-wide
/// bus, created on first reference.
fn resolve_topic(
    entry: &str,
    providers: &HashMap<String, BuiltProvider>,
    bus: &Arc<EventBus>,
) -> Result<Arc<Topic>, Error> {
    if let Some((provider_id, topic_path)) = entry.split_once('/') {
        let built = providers
            .get(provider_id)
            .ok_or_else(|| Error::validation(format!("the topic '{entry}' references an unknown provider '{provider_id}'")))?;
        let source = built
            .topics
            .as_ref()
            .ok_or_else(|| Error::validation(format!("the provider '{provider_id}' does not expose any topics")))?;
        return source
            .select_one(topic_path)
            .ok_or_else(|| Error::validation(format!("the topic '{topic_path}' does not exist on provider '{provider_id}'")));
    }

    match bus.select_one(entry) {
        Some(topic) => Ok(topic),
        None => bus.add_topic(entry.to_string()),
    }
}

fn data_def_from(block: &Value, default_bare_event: bool) -> Result<DataDef, Error> {
    match block.get("data") {
        Some(value) => {
            let template = from_yaml(value)?;
            Ok(match template {
                crate::writer::template::TemplateValue::Expr(e) => DataDef::Expr(e),
                other => DataDef::Template(other),
            })
        }
        None if default_bare_event => Ok(DataDef::Expr(
            Expression::parse("event").expect("the literal expression 'event' always parses"),
        )),
        None => Err(Error::validation("a collector requires a 'data' property")),
    }
}

fn writer_bindings(
    block: &Value,
    writers: &HashMap<String, Arc<Writer>>,
) -> Result<Vec<WriterBinding>, Error> {
    let Some(Value::Sequence(entries)) = block.get("writers") else {
        return Ok(Vec::new());
    };

    let mut bindings = Vec::with_capacity(entries.len());
    for entry in entries {
        let writer_id = req_str(entry, "writer_id")?.to_string();
        let writer = writers
            .get(&writer_id)
            .ok_or_else(|| Error::validation(format!("the writer '{writer_id}' referenced by a collector does not exist")))?
            .clone();

        let mut template_map = match entry {
            Value::Mapping(m) => m.clone(),
            _ => Mapping::new(),
        };
        template_map.remove(Value::String("writer_id".to_string()));
        let template = ConditionalTemplate::new(from_yaml(&Value::Mapping(template_map))?);

        bindings.push(WriterBinding { writer_id, writer, template });
    }
    Ok(bindings)
}

/// Builds every configured writer, provider, and collector and registers
/// them with `supervisor` in the order `Supervisor::start` requires
/// (writers, then collectors). Providers share one `base_scope` exposing
/// `providers.<id>.<fn>(...)` so any collector's `data` expression can call
/// into any provider, matching the original's module-global provider
/// lookup.
pub fn wire(config: &Config, supervisor: &mut Supervisor, term: Arc<TerminationSignal>) -> Result<(), Error> {
    let bus: Arc<EventBus> = Arc::new(EventBus::new());
    let states = Arc::new(StateRegistry::new());
    let backlog_dir = config.data_dir().join("backlog");

    let writer_backends = writer_backend_registry(states.clone());
    let mut writers: HashMap<String, Arc<Writer>> = HashMap::new();
    for id in config.component_ids("writers") {
        let block = config
            .component("writers", &id)
            .ok_or_else(|| Error::validation(format!("the writer '{id}' is missing its config block")))?;
        let class = req_str(block, "class")?;
        let backend = writer_backends.build(class, &with_id(config, block, &id))?;
        let writer = Writer::new(id.clone(), backend, writer_config_from(block), backlog_dir.join(&id), Scope::new())?;
        supervisor.add_writer(writer.clone());
        writers.insert(id, writer);
    }

    let providers_registry = provider_registry(term.clone(), states.clone());
    let mut providers: HashMap<String, BuiltProvider> = HashMap::new();
    let mut providers_scope = Scope::new();
    for id in config.component_ids("providers") {
        let block = config
            .component("providers", &id)
            .ok_or_else(|| Error::validation(format!("the provider '{id}' is missing its config block")))?;
        let class = req_str(block, "class")?;
        let built = providers_registry.build(class, &with_id(config, block, &id))?;

        let mut scope = Scope::new();
        for (name, func) in &built.scope_functions {
            scope.set(*name, func.clone());
        }
        providers_scope.set(id.clone(), ScopeValue::Scope(scope));
        providers.insert(id, Arc::try_unwrap(built).unwrap_or_else(|arc| (*arc).clone()));
    }
    let base_scope = Scope::new().with("providers", ScopeValue::Scope(providers_scope));

    for id in config.component_ids("collectors") {
        let block = config
            .component("collectors", &id)
            .ok_or_else(|| Error::validation(format!("the collector '{id}' is missing its config block")))?;
        let class = req_str(block, "class")?;
        let enabled = opt_bool(block, "enabled", true);
        let max_history = opt_usize(block, "max_history", 120);
        let bindings = writer_bindings(block, &writers)?;

        match class {
            "cron" => {
                let schedule = req_str(block, "schedule")?;
                let data_def = data_def_from(block, false)?;
                let base = BaseCollector::new(id.clone(), enabled, data_def, max_history, bindings, base_scope.clone());
                let collector = Arc::new(CronCollector::new(base, schedule)?);
                supervisor.add_collector(collector);
            }
            "event" => {
                let topic_entries = str_list(block, "topics");
                let mut topics = Vec::with_capacity(topic_entries.len());
                for entry in &topic_entries {
                    topics.push(resolve_topic(entry, &providers, &bus)?);
                }
                let data_def = data_def_from(block, true)?;
                let base = BaseCollector::new(id.clone(), enabled, data_def, max_history, bindings, base_scope.clone());
                let collector = Arc::new(EventCollector::new(base, topics));
                supervisor.add_collector(collector);
            }
            other => return Err(Error::validation(format!("unknown collector class '{other}'"))),
        }
    }

    Ok(())
}
