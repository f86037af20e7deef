//! Readiness coordination
//!
//! [`wait_for_loaders`] blocks until every requested database has a
//! snapshot, or until the first one fails without ever having loaded.
//! Each call subscribes to the status notices of exactly the requested
//! loaders, fans them into one channel, and races that channel against the
//! deadline with `recv_deadline`. Subscriptions are dropped on every exit
//! path, so abandoned waits leave nothing behind in the loaders.

use crate::database::Database;
use crate::error::{Error, Result};
use crate::event::Status;
use crate::loader::{Loader, Notice};
use crate::registry::Registry;
use crossbeam_channel::{unbounded, RecvTimeoutError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

/// Unsubscribes on drop
struct Subscription {
    loader: Arc<Loader>,
    token: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.loader.unsubscribe(self.token);
    }
}

enum Readiness {
    Ready(SystemTime),
    Pending,
    Failed(String),
}

fn readiness(status: &Status) -> Readiness {
    match status {
        Status::Ready { version } => Readiness::Ready(*version),
        Status::Failed {
            last_version: Some(version),
            ..
        } => Readiness::Ready(*version),
        Status::Failed {
            reason,
            last_version: None,
        } => Readiness::Failed(reason.clone()),
        Status::Unstarted | Status::Fetching => Readiness::Pending,
    }
}

// Far enough out for "no deadline" without overflowing `Instant`
const MAX_WAIT: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout.min(MAX_WAIT)
}

/// Wait until all `ids` are ready, returning each one's snapshot version
///
/// Fails fast: the first id that is unknown, stops, or fails before its
/// first publication ends the wait with that error. The remaining ids are
/// not reported.
pub fn wait_for_loaders<I, S>(
    registry: &Registry,
    ids: I,
    timeout: Duration,
) -> Result<HashMap<String, SystemTime>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let deadline = deadline_after(timeout);
    let (tx, rx) = unbounded();

    let mut ready = HashMap::new();
    let mut pending: HashMap<String, Subscription> = HashMap::new();

    for id in ids {
        let id = id.as_ref();
        if ready.contains_key(id) || pending.contains_key(id) {
            continue;
        }
        let loader = registry
            .loader(id)
            .ok_or_else(|| Error::DatabaseUnknown(id.to_string()))?;
        let (token, status) = loader
            .subscribe(tx.clone())
            .ok_or_else(|| Error::DatabaseUnknown(id.to_string()))?;
        let subscription = Subscription { loader, token };

        match readiness(&status) {
            Readiness::Ready(version) => {
                ready.insert(id.to_string(), version);
            }
            Readiness::Failed(reason) => return Err(Error::loading(id, reason)),
            Readiness::Pending => {
                pending.insert(id.to_string(), subscription);
            }
        }
    }

    while !pending.is_empty() {
        let (id, notice) = match rx.recv_deadline(deadline) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                debug!(pending = pending.len(), "wait for loaders timed out");
                return Err(Error::Timeout);
            }
        };
        if !pending.contains_key(&id) {
            continue;
        }
        match notice {
            Notice::Stopped => return Err(Error::DatabaseUnknown(id)),
            Notice::Status(status) => match readiness(&status) {
                Readiness::Ready(version) => {
                    pending.remove(&id);
                    ready.insert(id, version);
                }
                Readiness::Failed(reason) => return Err(Error::loading(id, reason)),
                Readiness::Pending => {}
            },
        }
    }

    Ok(ready)
}

/// Block until `loader` publishes its first snapshot, at most `timeout`
///
/// Failures before the first publication do not end the wait; the loader
/// keeps retrying and may still succeed in time. Gives
/// `DatabaseNotLoaded` when the deadline passes first.
pub(crate) fn wait_for_snapshot(loader: &Arc<Loader>, timeout: Duration) -> Result<Arc<Database>> {
    let not_loaded = || Error::DatabaseNotLoaded(loader.id().to_string());
    let deadline = deadline_after(timeout);

    let (tx, rx) = unbounded();
    let (token, _) = loader.subscribe(tx).ok_or_else(not_loaded)?;
    let _subscription = Subscription {
        loader: Arc::clone(loader),
        token,
    };

    loop {
        if let Some(database) = loader.snapshot() {
            return Ok(database);
        }
        match rx.recv_deadline(deadline) {
            Ok((_, Notice::Status(_))) => {}
            Ok((_, Notice::Stopped)) => return Err(Error::DatabaseUnknown(loader.id().to_string())),
            Err(_) => return Err(not_loaded()),
        }
    }
}
