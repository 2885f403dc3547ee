//! On-disk backlog for items a writer couldn't deliver. A length-prefixed,
//! checksummed binary format (`.data` files under
//! `<data_dir>/backlog/<writer_id>/`) replaces the original's
//! pickle-based `Backlog` class — pickle has no Rust equivalent and this
//! project's records are already `serde_json::Value`, so a flat
//! length+json+crc32 framing is the natural fit.
//!
//! File format:
//! ```text
//! header := magic("SIBL", 4B) version(u8) count(u32 LE)
//! record := len(u32 LE) json_bytes(len) crc32(u32 LE)
//! ```
//!
//! Grounded on `yamc/writers/writer.py::Backlog`.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, info};

use crate::error::Error;
use crate::testutil::is_test_mode;
use crate::value::Record;

const MAGIC: &[u8; 4] = b"SIBL";
const VERSION: u8 = 1;

static FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn random_suffix() -> String {
    let n = FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let seed = format!(
        "{}-{}-{n}",
        std::process::id(),
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos()
    );
    blake3::hash(seed.as_bytes()).to_hex()[..16].to_string()
}

fn write_batch(path: &Path, items: &[Record]) -> Result<(), Error> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    buf.push(VERSION);
    buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
    for item in items {
        let json = serde_json::to_vec(item).map_err(|e| Error::validation(e.to_string()))?;
        buf.extend_from_slice(&(json.len() as u32).to_le_bytes());
        buf.extend_from_slice(&json);
        let crc = crc32fast::hash(&json);
        buf.extend_from_slice(&crc.to_le_bytes());
    }
    fs::write(path, buf)?;
    Ok(())
}

fn read_batch(path: &Path) -> Result<Vec<Record>, Error> {
    let mut buf = Vec::new();
    fs::File::open(path)?.read_to_end(&mut buf)?;
    if buf.len() < 9 || &buf[0..4] != MAGIC {
        return Err(Error::validation(format!("{} is not a valid backlog file", path.display())));
    }
    let count = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
    let mut pos = 9;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        if pos + 4 > buf.len() {
            return Err(Error::validation(format!("{} is truncated", path.display())));
        }
        let len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + len + 4 > buf.len() {
            return Err(Error::validation(format!("{} is truncated", path.display())));
        }
        let json_bytes = &buf[pos..pos + len];
        pos += len;
        let crc = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
        pos += 4;
        if crc32fast::hash(json_bytes) != crc {
            return Err(Error::validation(format!("{} has a checksum mismatch", path.display())));
        }
        let record: Record = serde_json::from_slice(json_bytes).map_err(|e| Error::validation(e.to_string()))?;
        items.push(record);
    }
    Ok(items)
}

pub struct Backlog {
    dir: PathBuf,
    files: Mutex<Vec<PathBuf>>,
}

impl Backlog {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let backlog = Backlog { dir, files: Mutex::new(Vec::new()) };
        backlog.refresh()?;
        Ok(backlog)
    }

    pub fn refresh(&self) -> Result<(), Error> {
        let mut entries: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if path.is_file() && name.starts_with("items_") && name.ends_with(".data") {
                let mtime = entry.metadata()?.modified()?;
                entries.push((path, mtime));
            }
        }
        entries.sort_by_key(|(_, mtime)| *mtime);
        *self.files.lock().expect("backlog lock poisoned") = entries.into_iter().map(|(p, _)| p).collect();
        Ok(())
    }

    pub fn put(&self, items: &[Record]) -> Result<(), Error> {
        if items.is_empty() {
            return Ok(());
        }
        if is_test_mode() {
            info!("running in test mode, the backlog item will not be created");
            return Ok(());
        }
        let path = self.dir.join(format!("items_{}.data", random_suffix()));
        write_batch(&path, items)?;
        self.files.lock().expect("backlog lock poisoned").push(path);
        debug!("writing data to the writer's backlog, the backlog size is {}", self.size());
        Ok(())
    }

    pub fn peek(&self, size: usize) -> Result<(Vec<PathBuf>, Vec<Record>), Error> {
        let files = self.files.lock().expect("backlog lock poisoned");
        let take = size.min(files.len());
        let chosen: Vec<PathBuf> = files[..take].to_vec();
        drop(files);
        let mut items = Vec::new();
        for file in &chosen {
            items.extend(read_batch(file)?);
        }
        Ok((chosen, items))
    }

    pub fn remove(&self, files: &[PathBuf]) -> Result<(), Error> {
        if !is_test_mode() {
            for file in files {
                fs::remove_file(file)?;
            }
        } else {
            info!("running in test mode, removing of backlog files is disabled");
        }
        self.files.lock().expect("backlog lock poisoned").retain(|f| !files.contains(f));
        debug!("removing data from the writer's backlog, the backlog size is {}", self.size());
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.files.lock().expect("backlog lock poisoned").len()
    }

    /// Drains the backlog via `do_write`, batch by batch. Stops and
    /// returns `false` (writer should be marked unhealthy) on the first
    /// write failure; returns `true` once fully drained.
    pub fn process<F>(&self, batch_size: usize, mut do_write: F) -> bool
    where
        F: FnMut(&[Record]) -> Result<(), Error>,
    {
        if self.size() == 0 {
            return true;
        }
        info!(
            "there are {} items in the backlog, writing items in batches of {batch_size}",
            self.size()
        );
        while self.size() > 0 {
            let (batch_files, batch) = match self.peek(batch_size) {
                Ok(v) => v,
                Err(e) => {
                    error!("cannot read backlog batch: {e}");
                    return false;
                }
            };
            let result = if is_test_mode() {
                info!("running in test mode, writing of backlog files is disabled (removed from memory only)");
                Ok(())
            } else {
                do_write(&batch)
            };
            match result {
                Ok(()) => {
                    if let Err(e) = self.remove(&batch_files) {
                        error!("cannot remove backlog batch: {e}");
                        return false;
                    }
                }
                Err(e) => {
                    error!("cannot write item from the writer's backlog due to: {e}");
                    return false;
                }
            }
        }
        info!("the processing of the backlog finished, the backlog size is {}", self.size());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestModeGuard;
    use serde_json::json;

    fn record(v: i64) -> Record {
        let mut r = Record::new();
        r.insert("v".to_string(), json!(v));
        r
    }

    #[test]
    fn put_peek_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backlog = Backlog::open(dir.path()).unwrap();
        backlog.put(&[record(1), record(2)]).unwrap();
        assert_eq!(backlog.size(), 1);
        let (files, items) = backlog.peek(10).unwrap();
        assert_eq!(items, vec![record(1), record(2)]);
        backlog.remove(&files).unwrap();
        assert_eq!(backlog.size(), 0);
    }

    #[test]
    fn refresh_picks_up_existing_files_in_mtime_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backlog = Backlog::open(dir.path()).unwrap();
            backlog.put(&[record(1)]).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(10));
            backlog.put(&[record(2)]).unwrap();
        }
        let reopened = Backlog::open(dir.path()).unwrap();
        assert_eq!(reopened.size(), 2);
        let (_, items) = reopened.peek(10).unwrap();
        assert_eq!(items, vec![record(1), record(2)]);
    }

    #[test]
    fn process_drains_backlog_via_do_write() {
        let dir = tempfile::tempdir().unwrap();
        let backlog = Backlog::open(dir.path()).unwrap();
        backlog.put(&[record(1)]).unwrap();
        backlog.put(&[record(2)]).unwrap();

        let mut seen = Vec::new();
        let ok = backlog.process(1, |batch| {
            seen.extend_from_slice(batch);
            Ok(())
        });
        assert!(ok);
        assert_eq!(backlog.size(), 0);
        assert_eq!(seen, vec![record(1), record(2)]);
    }

    #[test]
    fn process_stops_and_reports_unhealthy_on_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backlog = Backlog::open(dir.path()).unwrap();
        backlog.put(&[record(1)]).unwrap();
        let ok = backlog.process(1, |_| Err(Error::validation("boom")));
        assert!(!ok);
        assert_eq!(backlog.size(), 1, "failed batch stays in the backlog");
    }

    #[test]
    fn test_mode_skips_file_creation_and_removal() {
        let _guard = TestModeGuard::enable();
        let dir = tempfile::tempdir().unwrap();
        let backlog = Backlog::open(dir.path()).unwrap();
        backlog.put(&[record(1)]).unwrap();
        assert_eq!(backlog.size(), 0, "test mode does not persist to disk");
    }
}
