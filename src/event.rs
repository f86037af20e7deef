//! Loader status and events
//!
//! Every state transition of a loader is delivered as a [`LoaderEvent`] to
//! the optional subscriber callback in the loader options. That is the hook
//! for logging or metrics backends; the library itself only logs through
//! `tracing`.

use crate::database::Source;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

/// Callback receiving loader events
///
/// Runs on the loader thread; it should return quickly.
pub type EventSubscriber = Arc<dyn Fn(&LoaderEvent) + Send + Sync>;

/// Lifecycle state of one loader
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Status {
    /// Created but no attempt made yet
    Unstarted,
    /// First attempt in progress
    Fetching,
    /// A snapshot is published
    Ready {
        /// Version of the published snapshot
        version: SystemTime,
    },
    /// The last attempt failed
    Failed {
        /// Why
        reason: String,
        /// Version of the snapshot still being served, if any
        last_version: Option<SystemTime>,
    },
}

impl Status {
    /// Version of the snapshot lookups currently see, if any
    pub fn serving_version(&self) -> Option<SystemTime> {
        match self {
            Status::Ready { version } => Some(*version),
            Status::Failed { last_version, .. } => *last_version,
            Status::Unstarted | Status::Fetching => None,
        }
    }
}

/// Something that happened in a loader
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoaderEvent {
    /// A fetch from the origin begins
    LoadAttemptStarted {
        /// Database id
        id: String,
        /// Where from
        source: Source,
    },
    /// The origin has not changed; nothing was republished
    LoadAttemptDismissed {
        /// Database id
        id: String,
        /// Where from
        source: Source,
    },
    /// A fetch from the origin ended
    LoadAttemptFinished {
        /// Database id
        id: String,
        /// Where from
        source: Source,
        /// Published version, or why it failed
        outcome: Result<SystemTime, String>,
    },
    /// Reading the local cache ended
    CacheAttemptFinished {
        /// Database id
        id: String,
        /// Cache file
        path: PathBuf,
        /// Published version, or why it failed
        outcome: Result<SystemTime, String>,
    },
    /// A discontinued download URL was replaced by an edition
    LegacyUrlRewritten {
        /// Database id
        id: String,
        /// The legacy URL
        url: String,
        /// Edition used instead
        edition: String,
    },
    /// The loader status changed
    StatusChanged {
        /// Database id
        id: String,
        /// New status
        status: Status,
    },
    /// The loader thread exited
    Stopped {
        /// Database id
        id: String,
    },
}

impl LoaderEvent {
    /// Database id the event is about
    pub fn id(&self) -> &str {
        match self {
            LoaderEvent::LoadAttemptStarted { id, .. }
            | LoaderEvent::LoadAttemptDismissed { id, .. }
            | LoaderEvent::LoadAttemptFinished { id, .. }
            | LoaderEvent::CacheAttemptFinished { id, .. }
            | LoaderEvent::LegacyUrlRewritten { id, .. }
            | LoaderEvent::StatusChanged { id, .. }
            | LoaderEvent::Stopped { id } => id,
        }
    }
}
