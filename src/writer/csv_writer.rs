//! CSV [`WriterBackend`](super::WriterBackend): one line per queued record.
//!
//! Grounded on `yamc/writers/csv_writer.py::CsvWriter`. The original wraps a
//! dynamically-imported `logging.Handler` subclass in its own `logging.Logger`
//! and formats each item with a hand-rolled `_format_value` (quote strings,
//! escape `"` and newlines, `str()` everything else) before handing the
//! joined line to the handler. There's no dynamic-class-loading equivalent
//! here, so the handler is replaced outright with the teacher's own
//! `csv::Writer<File>` idiom (`stream/replay/sink.rs::CsvSink`), and
//! `_format_value`'s escaping is replaced by the `csv` crate's own quoting,
//! which is strictly more correct (it also handles embedded commas, which
//! the original's formatter did not).

use std::path::PathBuf;

use super::rotation::DailyRotatingCsv;
use super::{WriterBackend, WriterEnvelope};
use crate::error::Error;

/// Column order is derived from the union of keys across the first batch
/// seen; subsequent batches are expected to share that shape. Mirrors the
/// original's assumption that a single `csv_writer` config targets
/// structurally uniform records.
pub struct CsvWriter {
    columns: Vec<String>,
    file: DailyRotatingCsv,
}

impl CsvWriter {
    /// `filename` is resolved relative to the config directory by the
    /// caller (`Config::resolve_path`) before reaching here. `retention_days`
    /// mirrors the general rotation knob; pass `None` to keep a single
    /// unrotated file, matching the original's default plain `FileHandler`.
    pub fn new(filename: impl Into<PathBuf>, columns: Vec<String>, retention_days: Option<u32>) -> Self {
        let filename = filename.into();
        let header: Vec<&str> = columns.iter().map(String::as_str).collect();
        CsvWriter {
            columns,
            file: DailyRotatingCsv::new(filename, Some(&header), retention_days),
        }
    }

    fn format_value(value: Option<&serde_json::Value>) -> String {
        match value {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

impl WriterBackend for CsvWriter {
    fn do_write(&self, batch: &[WriterEnvelope]) -> Result<(), Error> {
        for envelope in batch {
            let row: Vec<String> = self
                .columns
                .iter()
                .map(|col| Self::format_value(envelope.data.get(col)))
                .collect();
            self.file.append(&row)?;
        }
        Ok(())
    }

    fn close(&self) {
        self.file.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Record;
    use serde_json::json;
    use std::fs;

    #[test]
    fn do_write_appends_one_csv_line_per_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CsvWriter::new(dir.path().join("metrics.csv"), vec!["a".into(), "b".into()], None);

        let mut data = Record::new();
        data.insert("a".into(), json!(1));
        data.insert("b".into(), json!("hello, world"));
        let batch = vec![WriterEnvelope { collector_id: "c1".into(), data }];

        writer.do_write(&batch).unwrap();

        let today = chrono::Local::now().date_naive();
        let path = dir.path().join(format!("metrics.{}.csv", today.format("%Y-%m-%d")));
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2, "header plus one data row");
        assert!(contents.lines().last().unwrap().contains("\"hello, world\""), "embedded commas get quoted");
    }

    #[test]
    fn missing_columns_render_as_empty_fields() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CsvWriter::new(dir.path().join("metrics.csv"), vec!["a".into(), "missing".into()], None);
        let mut data = Record::new();
        data.insert("a".into(), json!(5));
        writer.do_write(&[WriterEnvelope { collector_id: "c1".into(), data }]).unwrap();

        let today = chrono::Local::now().date_naive();
        let path = dir.path().join(format!("metrics.{}.csv", today.format("%Y-%m-%d")));
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().last().unwrap(), "5,");
    }
}
