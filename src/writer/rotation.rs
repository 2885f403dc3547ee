//! A date-suffixed rotating file, shared by [`super::csv_writer`] and
//! `siphon::perf_csv`.
//!
//! The original yamc processes rotate log/CSV output through Python's
//! `logging.handlers.TimedRotatingFileHandler`, configured via a dynamically
//! imported handler class. There's no dynamic-class-loading equivalent here
//! (see `config` module docs), so rotation is reimplemented directly: the
//! active file is named `<stem>.<YYYY-MM-DD><ext>`, a new one opens on the
//! first write after local midnight, and files older than `retention_days`
//! are deleted at that point. Mirrors `TimedRotatingFileHandler`'s
//! `when="midnight"` behavior closely enough for the spec's purposes.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{Local, NaiveDate};
use log::warn;

use crate::error::Error;

/// Opens (creating parent directories as needed) a CSV writer appending to
/// `path`, writing `header` first only if the file doesn't already exist
/// and a header was given at all.
fn open_csv_append(path: &Path, header: Option<&[&str]>) -> Result<csv::Writer<File>, Error> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let exists = path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    if !exists {
        if let Some(header) = header {
            writer.write_record(header).map_err(csv_err)?;
        }
    }
    Ok(writer)
}

fn csv_err(e: csv::Error) -> Error {
    Error::validation(format!("csv write failed: {e}"))
}

struct RotationState {
    date: NaiveDate,
    writer: csv::Writer<File>,
}

/// A single logical CSV destination that physically rotates to a new,
/// date-suffixed file once a day and prunes files past `retention_days`.
pub struct DailyRotatingCsv {
    stem: PathBuf,
    header: Option<Vec<String>>,
    retention_days: Option<u32>,
    state: Mutex<Option<RotationState>>,
}

impl DailyRotatingCsv {
    /// `stem` is the path without its rotation suffix, e.g.
    /// `<perf_dir>/provider_id` becomes `provider_id.2026-07-26.csv`. Pass
    /// `None` for `header` for a headerless dump (the performance CSV's
    /// format, to stay compatible with the original's `header=None` reader).
    pub fn new(stem: impl Into<PathBuf>, header: Option<&[&str]>, retention_days: Option<u32>) -> Self {
        DailyRotatingCsv {
            stem: stem.into(),
            header: header.map(|h| h.iter().map(|s| s.to_string()).collect()),
            retention_days,
            state: Mutex::new(None),
        }
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        let ext = self.stem.extension().map(|e| e.to_string_lossy().to_string());
        let mut file_stem = self.stem.clone();
        file_stem.set_extension("");
        let name = match &ext {
            Some(ext) => format!("{}.{}.{ext}", file_stem.file_name().unwrap_or_default().to_string_lossy(), date.format("%Y-%m-%d")),
            None => format!("{}.{}", file_stem.file_name().unwrap_or_default().to_string_lossy(), date.format("%Y-%m-%d")),
        };
        file_stem.with_file_name(name)
    }

    fn prune(&self, today: NaiveDate) {
        let Some(retention_days) = self.retention_days else { return };
        let Some(dir) = self.stem.parent() else { return };
        let Ok(entries) = fs::read_dir(dir) else { return };
        let cutoff = today - chrono::Duration::days(retention_days as i64);
        let prefix = self.stem.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&prefix) {
                continue;
            }
            if let Some(date) = extract_date(&name) {
                if date < cutoff {
                    if let Err(e) = fs::remove_file(entry.path()) {
                        warn!("failed to prune the rotated file '{name}': {e}");
                    }
                }
            }
        }
    }

    /// Appends `row` through whichever file is current for today's date,
    /// rotating and pruning first if the day has changed since the last
    /// write.
    pub fn append(&self, row: &[String]) -> Result<(), Error> {
        let today = Local::now().date_naive();
        let mut state = self.state.lock().expect("rotation lock poisoned");

        let needs_rotation = match &*state {
            Some(s) => s.date != today,
            None => true,
        };
        if needs_rotation {
            if let Some(mut s) = state.take() {
                let _ = s.writer.flush();
            }
            let header_refs: Option<Vec<&str>> = self.header.as_ref().map(|h| h.iter().map(String::as_str).collect());
            let writer = open_csv_append(&self.path_for(today), header_refs.as_deref())?;
            self.prune(today);
            *state = Some(RotationState { date: today, writer });
        }

        let s = state.as_mut().expect("rotation state just initialized");
        s.writer.write_record(row).map_err(csv_err)?;
        s.writer.flush()?;
        Ok(())
    }

    /// Flushes and drops the currently open file handle, if any. Safe to
    /// call any number of times; the next `append` reopens on demand.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("rotation lock poisoned");
        if let Some(mut s) = state.take() {
            let _ = s.writer.flush();
        }
    }
}

fn extract_date(name: &str) -> Option<NaiveDate> {
    let re = regex::Regex::new(r"(\d{4}-\d{2}-\d{2})").ok()?;
    let caps = re.captures(name)?;
    NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_creates_file_with_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let rot = DailyRotatingCsv::new(dir.path().join("out.csv"), Some(&["a", "b"]), None);
        rot.append(&["1".into(), "2".into()]).unwrap();
        rot.append(&["3".into(), "4".into()]).unwrap();

        let today = Local::now().date_naive();
        let path = dir.path().join(format!("out.{}.csv", today.format("%Y-%m-%d")));
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3, "one header line plus two data rows");
        assert!(contents.lines().next().unwrap().contains("a,b"));
    }

    #[test]
    fn prune_removes_files_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let stale_date = Local::now().date_naive() - chrono::Duration::days(40);
        let stale_path = dir.path().join(format!("out.{}.csv", stale_date.format("%Y-%m-%d")));
        fs::write(&stale_path, "a,b\n1,2\n").unwrap();

        let rot = DailyRotatingCsv::new(dir.path().join("out.csv"), Some(&["a", "b"]), Some(30));
        rot.append(&["1".into(), "2".into()]).unwrap();

        assert!(!stale_path.exists(), "a file older than the retention window must be pruned");
    }
}
