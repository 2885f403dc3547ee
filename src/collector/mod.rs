//! Collectors: the scheduling half of the pipeline. A [`BaseCollector`]
//! evaluates its `data` definition into zero or more records and routes
//! them to the writers it's bound to; [`CronCollector`] and
//! [`EventCollector`] decide *when* that happens.
//!
//! Grounded on `yamc/collectors/collector.py`.

pub mod cron;
pub mod event;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::debug;
use serde_json::Value;

use crate::error::Error;
use crate::scope::Scope;
use crate::value::Record;
use crate::writer::template::{deep_eval, TemplateValue};
use crate::writer::{ConditionalTemplate, Writer};

/// One writer a collector feeds, with the per-binding `$def/$if/$opts`
/// template that decides what that writer actually receives.
pub struct WriterBinding {
    pub writer_id: String,
    pub writer: Arc<Writer>,
    pub template: ConditionalTemplate,
}

/// The `data` property of a collector config: either a literal/expression
/// template (most collectors) or, for [`event::EventCollector`], defaulted
/// to the bare `event` expression when left unset.
pub enum DataDef {
    Template(TemplateValue),
    Expr(crate::expr::Expression),
}

pub struct BaseCollector {
    component_id: String,
    enabled: bool,
    data_def: DataDef,
    max_history: usize,
    history: Mutex<VecDeque<Record>>,
    writers: Vec<WriterBinding>,
    base_scope: Scope,
}

impl BaseCollector {
    pub fn new(
        component_id: impl Into<String>,
        enabled: bool,
        data_def: DataDef,
        max_history: usize,
        writers: Vec<WriterBinding>,
        base_scope: Scope,
    ) -> Self {
        BaseCollector {
            component_id: component_id.into(),
            enabled,
            data_def,
            max_history,
            history: Mutex::new(VecDeque::new()),
            writers,
            base_scope,
        }
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Evaluates the collector's `data` definition against an optional
    /// extra scope (e.g. the triggering event), returning zero or more
    /// records and recording them into the bounded history ring.
    pub fn prepare_data(&self, extra: Option<&Scope>) -> Result<Vec<Record>, Error> {
        let scope = match extra {
            Some(extra) => self.base_scope.merged(extra),
            None => self.base_scope.clone(),
        };

        let evaluated = match &self.data_def {
            DataDef::Template(tv) => deep_eval(tv, &scope, "data")?,
            DataDef::Expr(e) => e
                .eval(&scope)
                .map_err(|source| Error::Eval { path: "data".to_string(), source })?,
        };

        let items: Vec<Record> = match evaluated {
            Value::Null => Vec::new(),
            Value::Array(values) => values
                .into_iter()
                .map(|v| match v {
                    Value::Object(map) => Ok(map),
                    other => Err(Error::validation(format!("the data must be an object, got {other}"))),
                })
                .collect::<Result<_, _>>()?,
            Value::Object(map) => vec![map],
            other => return Err(Error::validation(format!("the data must be an object or a list, got {other}"))),
        };

        if self.max_history > 0 {
            let mut history = self.history.lock().expect("collector history lock poisoned");
            for item in &items {
                history.push_back(item.clone());
            }
            while history.len() > self.max_history {
                history.pop_front();
            }
        }

        Ok(items)
    }

    pub fn history(&self) -> Vec<Record> {
        self.history.lock().expect("collector history lock poisoned").iter().cloned().collect()
    }

    /// Routes `data` to every bound writer, tagging the call scope with
    /// `collection.time` the way the original always does.
    pub fn write(&self, data: Vec<Record>, extra: Option<&Scope>, collection_time: f64) -> Result<(), Error> {
        if data.is_empty() {
            debug!("there is no data to write for collector '{}'", self.component_id);
            return Ok(());
        }
        let mut call_scope = match extra {
            Some(extra) => extra.clone(),
            None => Scope::new(),
        };
        call_scope.set("collection", serde_json::json!({"time": collection_time}));

        for binding in &self.writers {
            binding
                .writer
                .write(&self.component_id, data.clone(), &binding.template, &call_scope)?;
        }
        Ok(())
    }

    pub fn test(&self) -> Result<Vec<Record>, Error> {
        self.prepare_data(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::template::from_yaml;
    use crate::writer::{WriterBackend, WriterConfig};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        count: AtomicUsize,
    }

    impl WriterBackend for CountingBackend {
        fn do_write(&self, batch: &[crate::writer::WriterEnvelope]) -> Result<(), Error> {
            self.count.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    fn dict(pairs: Vec<(&str, TemplateValue)>) -> TemplateValue {
        let mut map = indexmap::IndexMap::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v);
        }
        TemplateValue::Dict(map)
    }

    #[test]
    fn prepare_data_evaluates_dict_definition_into_one_record() {
        let data_def = dict(vec![("x", TemplateValue::Value(json!(1)))]);
        let collector = BaseCollector::new(
            "c1",
            true,
            DataDef::Template(data_def),
            10,
            Vec::new(),
            Scope::new(),
        );
        let data = collector.prepare_data(None).unwrap();
        assert_eq!(data, vec![{ let mut r = Record::new(); r.insert("x".into(), json!(1)); r }]);
        assert_eq!(collector.history().len(), 1);
    }

    #[test]
    fn max_history_zero_disables_history_tracking() {
        let data_def = dict(vec![("x", TemplateValue::Value(json!(1)))]);
        let collector = BaseCollector::new("c1", true, DataDef::Template(data_def), 0, Vec::new(), Scope::new());
        collector.prepare_data(None).unwrap();
        assert!(collector.history().is_empty());
    }

    #[test]
    fn write_routes_data_through_bound_writer() {
        let backend = Arc::new(CountingBackend { count: AtomicUsize::new(0) });
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::new(
            "w1",
            backend.clone(),
            WriterConfig::default(),
            dir.path().join("backlog"),
            Scope::new(),
        )
        .unwrap();
        let yaml: serde_yaml::Value = serde_yaml::from_str("$def:\n  e: \"=data.x\"\n").unwrap();
        let template = ConditionalTemplate::new(from_yaml(&yaml).unwrap());
        let binding = WriterBinding { writer_id: "w1".to_string(), writer: writer.clone(), template };

        let data_def = dict(vec![("x", TemplateValue::Value(json!(5)))]);
        let collector = BaseCollector::new("c1", true, DataDef::Template(data_def), 10, vec![binding], Scope::new());

        let data = collector.prepare_data(None).unwrap();
        collector.write(data, None, 0.0).unwrap();
        writer.process_queue();
        assert_eq!(backend.count.load(Ordering::SeqCst), 1);
    }
}
