//! Database lifecycle manager
//!
//! Every database id gets one loader thread that owns the whole
//! fetch → extract → decode → publish cycle for its origin:
//!
//! ```text
//!            ┌───────────── start ─────────────┐
//!            ▼                                 │
//!   Unstarted ──► Fetching ──ok──► Ready(v1) ──refresh ok──► Ready(v2)
//!                    │                │  ▲
//!                  error         error│  │ok
//!                    ▼                ▼  │
//!            Failed(none)      Failed(last = v1)   (v1 keeps serving)
//! ```
//!
//! The published snapshot lives in an [`ArcSwapOption`] slot. Lookups load
//! it without locking and keep their `Arc` for as long as they need it, so
//! a swap never disturbs a lookup in flight and an old snapshot is freed
//! once the last reader drops it.
//!
//! The thread sleeps in a `crossbeam_channel::select!` over its command
//! channel, the refresh/backoff timer and (for filesystem origins) a
//! debounced `notify` change stream.

use crate::archive::extract_database;
use crate::cache::{Cache, CacheManifest};
use crate::config::LoaderOptions;
use crate::database::{Database, Source};
use crate::error::{Error, Result};
use crate::event::{LoaderEvent, Status};
use crate::origin::{redact, Origin};
use crate::transport::{FetchOutcome, HttpTransport, Transport, Validators};
use arc_swap::ArcSwapOption;
use crossbeam_channel::{after, never, select, unbounded, Receiver, Sender};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use reqwest::Url;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// Quiet period after the last filesystem change before reloading
const WATCH_DEBOUNCE: Duration = Duration::from_millis(200);

/// Message delivered to status watchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Notice {
    Status(Status),
    Stopped,
}

/// Sender half held on behalf of one waiter
pub(crate) type NoticeSender = Sender<(String, Notice)>;

enum Command {
    Refresh,
    Stop,
}

struct WatchState {
    status: Status,
    watchers: Vec<(u64, NoticeSender)>,
    next_token: u64,
    stopped: bool,
}

/// State shared between a loader thread and its readers
struct Shared {
    id: String,
    snapshot: ArcSwapOption<Database>,
    state: Mutex<WatchState>,
    options: LoaderOptions,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: LoaderEvent) {
        if let Some(subscriber) = &self.options.event_subscriber {
            subscriber(&event);
        }
    }

    /// Change the status, notifying the subscriber and then watchers
    fn set_status(&self, status: Status) {
        {
            let mut state = self.state();
            if state.status == status {
                return;
            }
            state.status = status.clone();
        }
        debug!(database = %self.id, ?status, "status changed");
        self.emit(LoaderEvent::StatusChanged {
            id: self.id.clone(),
            status: status.clone(),
        });

        let id = &self.id;
        self.state()
            .watchers
            .retain(|(_, tx)| tx.send((id.clone(), Notice::Status(status.clone()))).is_ok());
    }

    fn serving_version(&self) -> Option<SystemTime> {
        self.snapshot.load().as_ref().map(|db| db.version())
    }
}

/// Handle to one running loader
pub struct Loader {
    shared: Arc<Shared>,
    origin: Origin,
    commands: Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("id", &self.shared.id)
            .field("origin", &self.origin)
            .field("status", &self.status())
            .finish()
    }
}

impl Loader {
    /// Start loading `origin` on a new thread
    ///
    /// Fails synchronously on invalid options, an edition without a
    /// license key, or when the thread cannot be spawned.
    pub fn spawn(id: impl Into<String>, origin: Origin, options: LoaderOptions) -> Result<Self> {
        let id = id.into();
        options.validate()?;

        let license_key = options.effective_license_key();
        let download_url = origin.download_url(license_key.as_deref())?;
        let transport: Option<Arc<dyn Transport>> = match (&download_url, &options.transport) {
            (None, _) => None,
            (Some(_), Some(transport)) => Some(Arc::clone(transport)),
            (Some(_), None) => Some(Arc::new(
                HttpTransport::new(options.http_timeout)
                    .map_err(|e| Error::invalid_option(format!("HTTP client: {}", e)))?,
            )),
        };
        let cache = match (&download_url, options.no_cache) {
            (Some(_), false) => Some(Cache::new(&options.cache_dir, &id, &origin)),
            _ => None,
        };

        let shared = Arc::new(Shared {
            id: id.clone(),
            snapshot: ArcSwapOption::empty(),
            state: Mutex::new(WatchState {
                status: Status::Unstarted,
                watchers: Vec::new(),
                next_token: 0,
                stopped: false,
            }),
            options,
        });

        let (commands, command_rx) = unbounded();
        let worker = Worker {
            shared: Arc::clone(&shared),
            origin: origin.clone(),
            download_url,
            transport,
            cache,
            validators: Validators::default(),
            last_mtime: None,
            failures: 0,
        };
        let handle = thread::Builder::new()
            .name(format!("ipatlas-loader-{}", id))
            .spawn(move || worker.run(command_rx))?;

        info!(database = %id, origin = %origin, "loader started");
        Ok(Self {
            shared,
            origin,
            commands,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Database id
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Origin the loader fetches from
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Options the loader was started with
    pub fn options(&self) -> &LoaderOptions {
        &self.shared.options
    }

    /// Currently published snapshot
    pub fn snapshot(&self) -> Option<Arc<Database>> {
        self.shared.snapshot.load_full()
    }

    /// Current status
    pub fn status(&self) -> Status {
        self.shared.state().status.clone()
    }

    /// Attempt a load now instead of waiting for the timer
    pub fn refresh_now(&self) {
        let _ = self.commands.send(Command::Refresh);
    }

    /// Stop the thread and wait for it to exit
    ///
    /// The published snapshot is released; readers holding it keep it
    /// alive until they are done. Calling this twice is harmless.
    pub fn stop(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(handle) = handle else {
            return;
        };

        // Detach watchers first; an attempt still in flight must not reach them
        let watchers = {
            let mut state = self.shared.state();
            state.stopped = true;
            std::mem::take(&mut state.watchers)
        };
        for (_, tx) in watchers {
            let _ = tx.send((self.shared.id.clone(), Notice::Stopped));
        }

        let _ = self.commands.send(Command::Stop);
        if handle.join().is_err() {
            error!(database = %self.shared.id, "loader thread panicked");
        }
        self.shared.snapshot.store(None);
        info!(database = %self.shared.id, "loader stopped");
    }

    /// Register `tx` for status notices; returns the current status
    ///
    /// `None` when the loader has already stopped.
    pub(crate) fn subscribe(&self, tx: NoticeSender) -> Option<(u64, Status)> {
        let mut state = self.shared.state();
        if state.stopped {
            return None;
        }
        let token = state.next_token;
        state.next_token += 1;
        state.watchers.push((token, tx));
        Some((token, state.status.clone()))
    }

    pub(crate) fn unsubscribe(&self, token: u64) {
        self.shared.state().watchers.retain(|(t, _)| *t != token);
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Attempt {
    /// Origin unchanged since the last publication
    Unchanged,
    /// New snapshot published with this version
    Published(SystemTime),
}

/// Loader thread state; owned exclusively by the thread
struct Worker {
    shared: Arc<Shared>,
    origin: Origin,
    download_url: Option<Url>,
    transport: Option<Arc<dyn Transport>>,
    cache: Option<Cache>,
    validators: Validators,
    last_mtime: Option<SystemTime>,
    failures: u32,
}

impl Worker {
    fn run(mut self, commands: Receiver<Command>) {
        let (_watcher, changes) = self.watch();

        if self.cache.is_some() {
            self.load_cache();
        }

        let mut delay = self.attempt();
        loop {
            let timer = after(delay);
            select! {
                recv(commands) -> command => match command {
                    Ok(Command::Refresh) => debug!(database = %self.shared.id, "refresh requested"),
                    Ok(Command::Stop) | Err(_) => break,
                },
                recv(timer) -> _ => {}
                recv(changes) -> _ => {
                    if !self.debounce(&commands, &changes) {
                        break;
                    }
                }
            }
            delay = self.attempt();
        }

        self.shared.emit(LoaderEvent::Stopped {
            id: self.shared.id.clone(),
        });
    }

    /// Wait until changes go quiet; false if told to stop meanwhile
    fn debounce(&self, commands: &Receiver<Command>, changes: &Receiver<()>) -> bool {
        loop {
            select! {
                recv(commands) -> command => match command {
                    Ok(Command::Refresh) => {}
                    Ok(Command::Stop) | Err(_) => return false,
                },
                recv(changes) -> _ => {}
                default(WATCH_DEBOUNCE) => {
                    debug!(database = %self.shared.id, "origin file changed");
                    return true;
                }
            }
        }
    }

    /// File change stream for filesystem origins, `never()` otherwise
    ///
    /// The parent directory is watched so that files replaced by rename
    /// are still noticed.
    fn watch(&self) -> (Option<RecommendedWatcher>, Receiver<()>) {
        let path = match &self.origin {
            Origin::FilesystemPath(path) if self.shared.options.watch_filesystem => path.clone(),
            _ => return (None, never()),
        };
        let Some(dir) = path.parent().map(Path::to_path_buf) else {
            return (None, never());
        };

        let (tx, rx) = unbounded();
        let target = path.clone();
        let handler = move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                if event.paths.iter().any(|p| p == &target) {
                    let _ = tx.send(());
                }
            }
        };

        let watcher = RecommendedWatcher::new(handler, Config::default())
            .and_then(|mut w| w.watch(&dir, RecursiveMode::NonRecursive).map(|_| w));
        match watcher {
            Ok(watcher) => (Some(watcher), rx),
            Err(e) => {
                warn!(database = %self.shared.id, path = %path.display(), error = %e,
                    "file watcher unavailable, relying on periodic refresh");
                (None, never())
            }
        }
    }

    /// One load attempt; returns the delay until the next one
    fn attempt(&mut self) -> Duration {
        if self.shared.state().status == Status::Unstarted {
            self.shared.set_status(Status::Fetching);
        }

        let outcome = match self.origin.clone() {
            Origin::FilesystemPath(path) => self.load_file(&path),
            Origin::MaxMindEdition(_) | Origin::HttpUrl(_) => self.load_remote(),
        };

        let remote = self.origin.is_remote();
        match outcome {
            Ok(attempt) => {
                self.failures = 0;
                let version = match attempt {
                    Attempt::Published(version) => Some(version),
                    Attempt::Unchanged => self.shared.serving_version(),
                };
                if let Some(version) = version {
                    self.shared.set_status(Status::Ready { version });
                }
                self.shared.options.refresh_interval_for(remote)
            }
            Err(reason) => {
                self.failures = self.failures.saturating_add(1);
                let delay = self.shared.options.retry_delay(self.failures);
                warn!(database = %self.shared.id, failures = self.failures, retry_in = ?delay,
                    "load failed: {}", reason);
                self.shared.set_status(Status::Failed {
                    reason,
                    last_version: self.shared.serving_version(),
                });
                delay
            }
        }
    }

    fn publish(&self, database: Database) {
        info!(
            database = %self.shared.id,
            source = %database.source(),
            database_type = %database.metadata().database_type,
            "published new snapshot"
        );
        self.shared.snapshot.store(Some(Arc::new(database)));
    }

    /// Wrap a fetch in started / dismissed / finished events
    fn tracked(
        &mut self,
        source: Source,
        fetch: impl FnOnce(&mut Self, &Source) -> std::result::Result<Attempt, String>,
    ) -> std::result::Result<Attempt, String> {
        let id = self.shared.id.clone();
        self.shared.emit(LoaderEvent::LoadAttemptStarted {
            id: id.clone(),
            source: source.clone(),
        });
        let outcome = fetch(self, &source);
        match &outcome {
            Ok(Attempt::Unchanged) => {
                debug!(database = %id, source = %source, "origin unchanged");
                self.shared
                    .emit(LoaderEvent::LoadAttemptDismissed { id, source });
            }
            Ok(Attempt::Published(version)) => self.shared.emit(LoaderEvent::LoadAttemptFinished {
                id,
                source,
                outcome: Ok(*version),
            }),
            Err(reason) => self.shared.emit(LoaderEvent::LoadAttemptFinished {
                id,
                source,
                outcome: Err(reason.clone()),
            }),
        }
        outcome
    }

    fn load_file(&mut self, path: &Path) -> std::result::Result<Attempt, String> {
        self.tracked(Source::Filesystem(path.to_path_buf()), |worker, source| {
            let mtime = fs::metadata(path)
                .and_then(|m| m.modified())
                .map_err(|e| format!("{}: {}", path.display(), e))?;
            if worker.last_mtime == Some(mtime) && worker.shared.snapshot.load().is_some() {
                return Ok(Attempt::Unchanged);
            }

            let payload = fs::read(path).map_err(|e| format!("{}: {}", path.display(), e))?;
            let bytes = extract_database(payload).map_err(|e| e.to_string())?;
            let database =
                Database::from_bytes(bytes, source.clone(), mtime).map_err(|e| e.to_string())?;
            worker.publish(database);
            worker.last_mtime = Some(mtime);
            Ok(Attempt::Published(mtime))
        })
    }

    fn load_remote(&mut self) -> std::result::Result<Attempt, String> {
        let (Some(url), Some(transport)) = (self.download_url.clone(), self.transport.clone())
        else {
            return Err("no download URL".to_string());
        };

        self.tracked(Source::Remote(redact(&url)), |worker, source| {
            let (body, validators) = match transport
                .fetch(&url, &worker.validators)
                .map_err(|e| e.to_string())?
            {
                FetchOutcome::NotModified if worker.shared.snapshot.load().is_some() => {
                    return Ok(Attempt::Unchanged);
                }
                FetchOutcome::NotModified => {
                    return Err("server answered not modified but nothing is loaded".into());
                }
                FetchOutcome::Fetched { body, validators } => (body, validators),
            };

            let bytes = extract_database(body).map_err(|e| e.to_string())?;
            let fetched_at = SystemTime::now();
            let database = Database::from_bytes(bytes, source.clone(), fetched_at)
                .map_err(|e| e.to_string())?;

            if let Some(cache) = &worker.cache {
                let manifest = CacheManifest {
                    origin: worker.origin.to_string(),
                    etag: validators.etag.clone(),
                    last_modified: validators.last_modified.clone(),
                    fetched_at,
                };
                if let Err(e) = cache.store(database.bytes(), &manifest) {
                    warn!(database = %worker.shared.id, path = %cache.database_path().display(),
                        error = %e, "could not write cache");
                }
            }

            worker.validators = validators;
            worker.publish(database);
            Ok(Attempt::Published(fetched_at))
        })
    }

    /// Publish the cached copy, if any, before the first remote fetch
    fn load_cache(&mut self) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let path: PathBuf = cache.database_path().to_path_buf();
        let outcome = match cache.load() {
            Ok(None) => {
                debug!(database = %self.shared.id, path = %path.display(), "no cached copy");
                return;
            }
            Ok(Some((_, manifest))) if manifest.origin != self.origin.to_string() => {
                debug!(database = %self.shared.id, "cached copy is for another origin");
                return;
            }
            Ok(Some((bytes, manifest))) => {
                Database::from_bytes(bytes, Source::Cache(path.clone()), manifest.fetched_at)
                    .map(|database| {
                        self.validators = manifest.validators();
                        self.publish(database);
                        self.shared.set_status(Status::Ready {
                            version: manifest.fetched_at,
                        });
                        manifest.fetched_at
                    })
                    .map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };

        if let Err(reason) = &outcome {
            warn!(database = %self.shared.id, path = %path.display(), "cached copy unusable: {}", reason);
        }
        self.shared.emit(LoaderEvent::CacheAttemptFinished {
            id: self.shared.id.clone(),
            path,
            outcome,
        });
    }
}
