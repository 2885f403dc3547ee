//! Generic HTTP provider: TTL-cached GET with a bounded retry/backoff loop.
//! Grounded on `yamc/providers/provider.py::HttpProvider`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use super::{DiffStorage, Provider, ProviderError};
use crate::error::EvalError;
use crate::runtime::TerminationSignal;
use crate::scope::ScopeValue;

struct HttpState {
    data: Option<Vec<u8>>,
    updated_time: Option<Instant>,
    init_time: Option<Instant>,
}

pub struct HttpProvider {
    component_id: String,
    url: String,
    max_age: Duration,
    init_url: Option<String>,
    init_max_age: Option<Duration>,
    client: reqwest::blocking::Client,
    term: Arc<TerminationSignal>,
    pub(super) diff: DiffStorage,
    state: Mutex<HttpState>,
}

impl HttpProvider {
    pub fn new(
        component_id: impl Into<String>,
        url: impl Into<String>,
        max_age: Duration,
        init_url: Option<String>,
        init_max_age: Option<Duration>,
        term: Arc<TerminationSignal>,
    ) -> Self {
        HttpProvider {
            component_id: component_id.into(),
            url: url.into(),
            max_age,
            init_url,
            init_max_age,
            client: reqwest::blocking::Client::new(),
            term,
            diff: DiffStorage::new(),
            state: Mutex::new(HttpState {
                data: None,
                updated_time: None,
                init_time: None,
            }),
        }
    }

    /// Current cached response body, if any has been fetched yet.
    pub fn cached_data(&self) -> Option<Vec<u8>> {
        self.state.lock().expect("http provider lock poisoned").data.clone()
    }

    pub fn diff(&self, id: &str, value: f64) -> f64 {
        self.diff.diff(id, value)
    }

    fn init_session(&self, state: &mut HttpState) {
        let Some(init_url) = &self.init_url else { return };
        let stale = match state.init_time {
            None => true,
            Some(t) => self
                .init_max_age
                .map(|max_age| t.elapsed() > max_age)
                .unwrap_or(false),
        };
        if !stale {
            return;
        }
        state.init_time = Some(Instant::now());
        log::info!(target: &self.component_id, "running the initialization request at {init_url}");
        if let Err(e) = self.client.get(init_url).send() {
            log::error!(target: &self.component_id, "the initialization request failed: {e}");
        }
    }
}

impl Provider for HttpProvider {
    fn component_id(&self) -> &str {
        &self.component_id
    }

    fn source(&self) -> String {
        self.url.clone()
    }

    fn refresh(&self) -> Result<bool, ProviderError> {
        let mut state = self.state.lock().expect("http provider lock poisoned");
        let stale = state.updated_time.is_none() || state.data.is_none() || state.updated_time.unwrap().elapsed() > self.max_age;
        if !stale {
            log::debug!(target: &self.component_id, "the url '{}' retrieved data from cache", self.url);
            return Ok(false);
        }

        let start = Instant::now();
        self.init_session(&mut state);

        let mut num_retries = 0;
        loop {
            state.updated_time = Some(Instant::now());
            let result = self.client.get(&self.url).send();
            match result {
                Ok(resp) if resp.status().as_u16() == 404 => {
                    return Err(ProviderError::Other(format!(
                        "the resource at {} does not exist",
                        self.url
                    )));
                }
                Ok(resp) if resp.status().as_u16() >= 400 => {
                    log::error!(
                        target: &self.component_id,
                        "the request at {} failed, status-code={}, num-retries={num_retries}",
                        self.url,
                        resp.status().as_u16(),
                    );
                    num_retries += 1;
                    if num_retries == 3 {
                        return Err(ProviderError::Other(format!(
                            "cannot retrieve the resource at {} after {num_retries} attempts",
                            self.url
                        )));
                    }
                    if self.term.wait_timeout(Duration::from_secs(1)) {
                        return Err(ProviderError::Operational("terminated during retry wait".to_string()));
                    }
                }
                Ok(resp) => {
                    let bytes = resp
                        .bytes()
                        .map_err(|e| ProviderError::Operational(format!("failed to read response body: {e}")))?;
                    state.data = Some(bytes.to_vec());
                    break;
                }
                Err(e) => {
                    log::error!(target: &self.component_id, "the request at {} failed: {e}", self.url);
                    num_retries += 1;
                    if num_retries == 3 {
                        return Err(ProviderError::Operational(format!(
                            "cannot retrieve the resource at {} after {num_retries} attempts: {e}",
                            self.url
                        )));
                    }
                    if self.term.wait_timeout(Duration::from_secs(1)) {
                        return Err(ProviderError::Operational("terminated during retry wait".to_string()));
                    }
                }
            }
        }

        log::debug!(
            target: &self.component_id,
            "the url '{}' retrieved data in {:.3}s",
            self.url,
            start.elapsed().as_secs_f64()
        );
        Ok(true)
    }

    /// Exposes `providers.<id>.diff(id, value)` to expressions.
    fn scope_functions(self: Arc<Self>) -> Vec<(&'static str, ScopeValue)> {
        let provider = self.clone();
        vec![(
            "diff",
            ScopeValue::Function(Arc::new(move |args: &[Value]| {
                let id = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| EvalError::Type("diff() expects a string id as its first argument".to_string()))?;
                let value = args
                    .get(1)
                    .and_then(Value::as_f64)
                    .ok_or_else(|| EvalError::Type("diff() expects a numeric value as its second argument".to_string()))?;
                Ok(Value::from(provider.diff(id, value)))
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

    fn spawn_stub_server(responses: Vec<(u16, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let reason = if status == 200 { "OK" } else { "Error" };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn retries_on_500_and_succeeds_on_second_attempt() {
        let url = spawn_stub_server(vec![(500, ""), (200, "{\"value\":42}")]);
        let provider = HttpProvider::new("p1", url, Duration::from_secs(60), None, None, TerminationSignal::new());
        let refreshed = provider.refresh().unwrap();
        assert!(refreshed);
        assert_eq!(provider.cached_data().unwrap(), b"{\"value\":42}");
    }

    #[test]
    fn third_consecutive_failure_is_fatal() {
        let url = spawn_stub_server(vec![(500, ""), (500, ""), (500, "")]);
        let provider = HttpProvider::new("p1", url, Duration::from_secs(60), None, None, TerminationSignal::new());
        assert!(provider.refresh().is_err());
    }

    #[test]
    fn not_found_is_fatal_immediately() {
        let url = spawn_stub_server(vec![(404, "")]);
        let provider = HttpProvider::new("p1", url, Duration::from_secs(60), None, None, TerminationSignal::new());
        assert!(provider.refresh().is_err());
    }

    #[test]
    fn cache_is_reused_within_max_age() {
        let url = spawn_stub_server(vec![(200, "one")]);
        let provider = HttpProvider::new("p1", url, Duration::from_secs(60), None, None, TerminationSignal::new());
        assert!(provider.refresh().unwrap());
        assert!(!provider.refresh().unwrap());
        assert_eq!(provider.cached_data().unwrap(), b"one");
    }
}
