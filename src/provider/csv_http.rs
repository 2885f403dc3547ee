//! CSV-over-HTTP provider. Grounded on
//! `yamc/providers/provider.py::CsvHttpProvider`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use super::{DiffStorage, HttpProvider, Provider, ProviderError};
use crate::error::EvalError;
use crate::runtime::TerminationSignal;
use crate::scope::ScopeValue;
use crate::value::coerce_numeric_or_string;

struct ParsedCsv {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

pub struct CsvHttpProvider {
    http: HttpProvider,
    delimiter: u8,
    str_decode_unicode: bool,
    parsed: Mutex<Option<ParsedCsv>>,
    diff: DiffStorage,
}

impl CsvHttpProvider {
    pub fn new(
        component_id: impl Into<String>,
        url: impl Into<String>,
        max_age: Duration,
        delimiter: char,
        str_decode_unicode: bool,
        term: Arc<TerminationSignal>,
    ) -> Self {
        CsvHttpProvider {
            http: HttpProvider::new(component_id, url, max_age, None, None, term),
            delimiter: delimiter as u8,
            str_decode_unicode,
            parsed: Mutex::new(None),
            diff: DiffStorage::new(),
        }
    }

    fn ensure_parsed(&self) -> Result<(), ProviderError> {
        let refreshed = self.http.refresh()?;
        if !refreshed {
            return Ok(());
        }
        let bytes = self
            .http
            .cached_data()
            .ok_or_else(|| ProviderError::Operational("no data fetched yet".to_string()))?;
        let text = String::from_utf8_lossy(&bytes).to_string();
        let text = if self.str_decode_unicode {
            deunicode::deunicode(&text)
        } else {
            text
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());
        let header = reader
            .headers()
            .map_err(|e| ProviderError::Operational(format!("invalid csv header: {e}")))?
            .iter()
            .map(str::to_string)
            .collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| ProviderError::Operational(format!("invalid csv row: {e}")))?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        *self.parsed.lock().expect("csv provider lock poisoned") = Some(ParsedCsv { header, rows });
        Ok(())
    }

    /// Reads `name`'s column at `row_index` (supports negative indices from
    /// the end), coercing int/float/string the same way `xpath` does.
    pub fn field(&self, row_index: i64, name: &str) -> Result<Value, ProviderError> {
        self.ensure_parsed()?;
        let parsed = self.parsed.lock().expect("csv provider lock poisoned");
        let parsed = parsed
            .as_ref()
            .ok_or_else(|| ProviderError::Operational("no data fetched yet".to_string()))?;
        let col = parsed
            .header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| ProviderError::Other(format!("the field '{name}' does not exist")))?;
        let idx = if row_index < 0 {
            parsed.rows.len() as i64 + row_index
        } else {
            row_index
        };
        if idx < 0 || idx as usize >= parsed.rows.len() {
            return Err(ProviderError::Other(format!("the row index {row_index} is out of range")));
        }
        let raw = parsed.rows[idx as usize]
            .get(col)
            .ok_or_else(|| ProviderError::Other(format!("the field '{name}' is missing in row {row_index}")))?;
        Ok(coerce_numeric_or_string(raw))
    }
}

impl Provider for CsvHttpProvider {
    fn component_id(&self) -> &str {
        self.http.component_id()
    }

    fn source(&self) -> String {
        self.http.source()
    }

    fn refresh(&self) -> Result<bool, ProviderError> {
        self.ensure_parsed()?;
        Ok(true)
    }

    /// Exposes `providers.<id>.field(row_index, name)` to expressions.
    fn scope_functions(self: Arc<Self>) -> Vec<(&'static str, ScopeValue)> {
        let provider = self.clone();
        vec![(
            "field",
            ScopeValue::Function(Arc::new(move |args: &[Value]| {
                let row_index = args
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| EvalError::Type("field() expects an integer row index as its first argument".to_string()))?;
                let name = args
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| EvalError::Type("field() expects a string column name as its second argument".to_string()))?;
                provider.field(row_index, name).map_err(|e| EvalError::Type(e.to_string()))
            })),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn spawn_stub_server(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
        });
        format!("http://{addr}")
    }

    #[test]
    fn field_reads_numeric_and_string_columns() {
        let url = spawn_stub_server("name;value\r\na;1\r\nb;2\r\n");
        let provider = CsvHttpProvider::new("p1", url, Duration::from_secs(60), ';', true, TerminationSignal::new());
        assert_eq!(provider.field(0, "name").unwrap(), Value::from("a"));
        assert_eq!(provider.field(0, "value").unwrap(), Value::from(1));
        assert_eq!(provider.field(-1, "name").unwrap(), Value::from("b"));
    }

    #[test]
    fn field_missing_column_is_an_error() {
        let url = spawn_stub_server("name;value\r\na;1\r\n");
        let provider = CsvHttpProvider::new("p1", url, Duration::from_secs(60), ';', true, TerminationSignal::new());
        assert!(provider.field(0, "nope").is_err());
    }
}
