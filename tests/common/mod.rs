//! Shared helpers for integration tests
#![allow(dead_code)]

use ipatlas::transport::FetchError;
use ipatlas::{DataValue, FetchOutcome, LoaderEvent, MmdbBuilder, Transport, Validators};
use reqwest::Url;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Single-network database: `192.0.2.0/24 → {"country": <country>}`
pub fn country_db(country: &str) -> Vec<u8> {
    let mut builder = MmdbBuilder::new();
    builder
        .add_entry(
            "192.0.2.0/24",
            DataValue::map([("country", DataValue::string(country))]),
        )
        .unwrap();
    builder.build().unwrap()
}

/// Several IPv4 networks with nested and string-only records
pub fn multi_network_db() -> Vec<u8> {
    let mut builder = MmdbBuilder::new().with_build_epoch(1_700_000_000);
    for (cidr, country, name) in [
        ("10.0.0.0/8", "ZZ", "private"),
        ("10.1.0.0/16", "ZZ", "private-lab"),
        ("192.0.2.0/24", "US", "test-net-1"),
        ("198.51.100.0/24", "DE", "test-net-2"),
        ("203.0.113.0/24", "JP", "test-net-3"),
    ] {
        builder
            .add_entry(
                cidr,
                DataValue::map([
                    ("country", DataValue::string(country)),
                    ("name", DataValue::string(name)),
                ]),
            )
            .unwrap();
    }
    builder.build().unwrap()
}

/// Write `bytes` to `dir/name` and return the absolute path
pub fn write_db(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// Atomically replace `path` with `bytes`, giving it a distinct mtime
pub fn replace_db(path: &Path, bytes: &[u8], mtime_offset_secs: u64) {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes).unwrap();
    let file = std::fs::File::options().write(true).open(&tmp).unwrap();
    file.set_modified(std::time::SystemTime::now() + Duration::from_secs(mtime_offset_secs))
        .unwrap();
    drop(file);
    std::fs::rename(&tmp, path).unwrap();
}

/// Transport answering from a script, recording every request
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<FetchOutcome, FetchError>>>,
    requests: Mutex<Vec<(Url, Validators)>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a successful response with an ETag
    pub fn push_body(&self, body: Vec<u8>, etag: &str) {
        self.push(Ok(FetchOutcome::Fetched {
            body,
            validators: Validators {
                etag: Some(etag.to_string()),
                last_modified: None,
            },
        }));
    }

    pub fn push_not_modified(&self) {
        self.push(Ok(FetchOutcome::NotModified));
    }

    pub fn push_status(&self, status: u16) {
        self.push(Err(FetchError::Status { status }));
    }

    pub fn push(&self, response: Result<FetchOutcome, FetchError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn requests(&self) -> Vec<(Url, Validators)> {
        self.requests.lock().unwrap().clone()
    }
}

impl Transport for ScriptedTransport {
    /// Answers from the script; once it runs out, "not modified"
    fn fetch(&self, url: &Url, validators: &Validators) -> Result<FetchOutcome, FetchError> {
        self.requests
            .lock()
            .unwrap()
            .push((url.clone(), validators.clone()));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(FetchOutcome::NotModified))
    }
}

/// Collects loader events delivered to the subscriber callback
#[derive(Debug, Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<LoaderEvent>>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback to pass to `LoaderOptions::with_event_subscriber`
    pub fn subscriber(&self) -> impl Fn(&LoaderEvent) + Send + Sync + 'static {
        let events = Arc::clone(&self.events);
        move |event: &LoaderEvent| events.lock().unwrap().push(event.clone())
    }

    pub fn events(&self) -> Vec<LoaderEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Wait until an event matching `pred` was recorded
    pub fn wait_for(&self, pred: impl Fn(&LoaderEvent) -> bool) -> LoaderEvent {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(event) = self.events().into_iter().find(|e| pred(e)) {
                return event;
            }
            assert!(
                Instant::now() < deadline,
                "event never arrived; got {:#?}",
                self.events()
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Number of recorded events matching `pred`
    pub fn count(&self, pred: impl Fn(&LoaderEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

/// Poll `pred` until true or ten seconds pass
pub fn eventually(what: &str, pred: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}
