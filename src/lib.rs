//! ipatlas - Hot-Swapping MaxMind DB Loader
//!
//! ipatlas keeps MaxMind DB (MMDB) files loaded and current. Each database
//! is registered under an id together with its origin (a MaxMind edition,
//! an http(s) URL, or a local path); a background loader fetches, decodes
//! and publishes it, then refreshes it periodically. Lookups read the
//! currently published snapshot without taking any lock.
//!
//! # Quick Start
//!
//! ```rust
//! use ipatlas::{DataValue, LoaderOptions, MmdbBuilder};
//! use std::time::Duration;
//!
//! // Write a small database to disk
//! let mut builder = MmdbBuilder::new();
//! builder.add_entry(
//!     "192.0.2.0/24",
//!     DataValue::map([("country", DataValue::string("US"))]),
//! )?;
//! let path = std::env::temp_dir().join("ipatlas_doctest_quickstart.mmdb");
//! std::fs::write(&path, builder.build()?)?;
//!
//! // Load it under the id "geo" and wait for the first snapshot
//! ipatlas::start("geo", path.to_str().unwrap(), LoaderOptions::new())?;
//! ipatlas::wait_for_loaders(["geo"], Duration::from_secs(5))?;
//!
//! let entry = ipatlas::lookup("geo", "192.0.2.5")?;
//! assert_eq!(entry.data.get("country").and_then(|v| v.as_str()), Some("US"));
//! assert!(matches!(
//!     ipatlas::lookup("geo", "192.0.3.5"),
//!     Err(ipatlas::Error::NotFound)
//! ));
//!
//! ipatlas::stop("geo")?;
//! # let _ = std::fs::remove_file(&path);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Architecture
//!
//! ```text
//!  origin ──► Transport / file ──► archive ──► Database::from_bytes
//!  (edition,     (conditional      (gz, tar)    (metadata + tree +
//!   url, path)    GET, cache)                    data section)
//!                                                     │ publish (ArcSwap)
//!                                                     ▼
//!  lookup(id, ip) ──► Registry ──► snapshot slot ──► SearchTree walk
//!                                                     ──► DataDecoder
//! ```
//!
//! - [`Registry`]: id → loader map; [`start`], [`stop`], [`lookup`] and
//!   friends operate on [`Registry::global`].
//! - [`loader::Loader`]: one thread per id owning fetch, decode, publish,
//!   refresh and retry with exponential backoff.
//! - [`Database`]: one immutable, decoded snapshot.
//! - [`analysis::analyze`]: offline structural check of a snapshot.
//! - [`wait_for_loaders`]: block until databases are ready.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Structural analysis of MMDB snapshots
pub mod analysis;
/// Download payload extraction
pub mod archive;
/// On-disk download cache
pub mod cache;
/// Loader options
pub mod config;
/// MMDB data section encoding/decoding
pub mod data_section;
/// Immutable database snapshots
pub mod database;
/// Error types
pub mod error;
/// Loader status and events
pub mod event;
/// IP search tree builder for MMDB output
pub mod ip_tree_builder;
/// Database lifecycle manager
pub mod loader;
/// MMDB format internals
pub mod mmdb;
/// MMDB file builder
pub mod mmdb_builder;
/// Database origins
pub mod origin;
/// Id → loader registry
pub mod registry;
/// Remote fetching
pub mod transport;
/// Readiness coordination
pub mod waiter;

pub use crate::analysis::{Flaw, FlawKind};
pub use crate::config::{LoaderOptions, PreReadiness};
pub use crate::data_section::DataValue;
pub use crate::database::{Database, Entry, Source};
pub use crate::error::{Error, Result};
pub use crate::event::{EventSubscriber, LoaderEvent, Status};
pub use crate::mmdb::{IpVersion, Metadata, RecordSize};
pub use crate::mmdb_builder::MmdbBuilder;
pub use crate::origin::Origin;
pub use crate::registry::{Address, DatabaseInfo, InfoField, InfoValue, Registry};
pub use crate::transport::{FetchOutcome, HttpTransport, Transport, Validators};

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Library version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Start loading `origin` under `id`; see [`Registry::start`]
pub fn start(id: &str, origin: &str, options: LoaderOptions) -> Result<()> {
    Registry::global().start(id, origin, options)
}

/// Stop the loader of `id`
pub fn stop(id: &str) -> Result<()> {
    Registry::global().stop(id)
}

/// Look up `address` in database `id`
pub fn lookup(id: &str, address: impl Into<Address>) -> Result<Entry> {
    Registry::global().lookup(id, address)
}

/// Metadata, source and version of database `id`
pub fn get_info(id: &str) -> Result<DatabaseInfo> {
    Registry::global().get_info(id)
}

/// One field of [`get_info`]
pub fn get_info_field(id: &str, field: InfoField) -> Result<InfoValue> {
    Registry::global().get_info_field(id, field)
}

/// Analyze the current snapshot of `id`
pub fn analyze(id: &str) -> Result<()> {
    Registry::global().analyze(id)
}

/// Block until every id in `ids` is ready or the first one fails
pub fn wait_for_loaders<I, S>(ids: I, timeout: Duration) -> Result<HashMap<String, SystemTime>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Registry::global().wait_for_loaders(ids, timeout)
}

/// Force an immediate load attempt for `id`
pub fn refresh(id: &str) -> Result<()> {
    Registry::global().refresh(id)
}

/// Loader status of `id`
pub fn status(id: &str) -> Result<Status> {
    Registry::global().status(id)
}
