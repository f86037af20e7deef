//! Process-wide database registry
//!
//! Maps database ids to running loaders. The map itself is an immutable
//! `HashMap` behind an [`ArcSwap`]: lookups load it without locking, while
//! `start` and `stop` copy it, edit the copy and swap it in under a mutex
//! that only they take.

use crate::analysis;
use crate::config::{LoaderOptions, PreReadiness};
use crate::database::{Database, Entry, Source};
use crate::error::{Error, Result};
use crate::event::{LoaderEvent, Status};
use crate::loader::Loader;
use crate::mmdb::Metadata;
use crate::origin::{first_legacy_rewrite, legacy_edition, Origin};
use crate::waiter;
use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};
use tracing::warn;

/// Address accepted by lookups: a parsed IP or its text form
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Already parsed
    Ip(IpAddr),
    /// Parsed on lookup; failure is [`Error::InvalidAddress`]
    Text(String),
}

impl Address {
    /// The IP address, parsing text if needed
    pub fn resolve(&self) -> Result<IpAddr> {
        match self {
            Address::Ip(ip) => Ok(*ip),
            Address::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| Error::InvalidAddress(text.clone())),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Address::Ip(ip)
    }
}

impl From<Ipv4Addr> for Address {
    fn from(ip: Ipv4Addr) -> Self {
        Address::Ip(ip.into())
    }
}

impl From<Ipv6Addr> for Address {
    fn from(ip: Ipv6Addr) -> Self {
        Address::Ip(ip.into())
    }
}

impl From<&str> for Address {
    fn from(text: &str) -> Self {
        Address::Text(text.to_string())
    }
}

impl From<String> for Address {
    fn from(text: String) -> Self {
        Address::Text(text)
    }
}

/// What `get_info` reports about a published snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseInfo {
    /// Decoded metadata
    pub metadata: Metadata,
    /// Where the snapshot was loaded from
    pub source: Source,
    /// Snapshot version
    pub version: SystemTime,
}

/// One field of [`DatabaseInfo`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoField {
    /// `metadata`
    Metadata,
    /// `source`
    Source,
    /// `version`
    Version,
}

impl FromStr for InfoField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "metadata" => Ok(InfoField::Metadata),
            "source" => Ok(InfoField::Source),
            "version" => Ok(InfoField::Version),
            other => Err(Error::UnknownField(other.to_string())),
        }
    }
}

impl fmt::Display for InfoField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InfoField::Metadata => "metadata",
            InfoField::Source => "source",
            InfoField::Version => "version",
        })
    }
}

/// Value of one projected info field
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InfoValue {
    /// Decoded metadata
    Metadata(Metadata),
    /// Snapshot source
    Source(Source),
    /// Snapshot version
    Version(SystemTime),
}

type Entries = HashMap<String, Arc<Loader>>;

/// Set of running loaders keyed by database id
#[derive(Default)]
pub struct Registry {
    entries: ArcSwap<Entries>,
    writer: Mutex<()>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("ids", &self.ids()).finish()
    }
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry behind the crate-level functions
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    /// Start loading `origin` under `id`
    ///
    /// `origin` is an edition name, an http(s) URL, a `file://` URL or an
    /// absolute path. Discontinued GeoLite2 download URLs are rewritten to
    /// their edition with a one-time warning.
    pub fn start(&self, id: &str, origin: &str, options: LoaderOptions) -> Result<()> {
        options.validate()?;
        let parsed = Origin::parse(origin)?;

        if let Some(edition) = legacy_edition(origin) {
            if first_legacy_rewrite(origin) {
                warn!(database = %id, url = %origin, edition = %edition,
                    "download URL is discontinued, using the edition instead");
                if let Some(subscriber) = &options.event_subscriber {
                    subscriber(&LoaderEvent::LegacyUrlRewritten {
                        id: id.to_string(),
                        url: origin.to_string(),
                        edition: edition.to_string(),
                    });
                }
            }
        }

        let _writer = self.lock_writer();
        if self.entries.load().contains_key(id) {
            return Err(Error::AlreadyStarted(id.to_string()));
        }
        let loader = Arc::new(Loader::spawn(id, parsed, options)?);

        let mut entries = Entries::clone(&self.entries.load());
        entries.insert(id.to_string(), loader);
        self.entries.store(Arc::new(entries));
        Ok(())
    }

    /// Stop the loader for `id` and forget it
    ///
    /// The id is free again as soon as it leaves the map; joining the
    /// loader thread, which may sit in a fetch, happens outside the
    /// writer lock.
    pub fn stop(&self, id: &str) -> Result<()> {
        let loader = {
            let _writer = self.lock_writer();
            let mut entries = Entries::clone(&self.entries.load());
            let loader = entries
                .remove(id)
                .ok_or_else(|| Error::LoaderNotFound(id.to_string()))?;
            self.entries.store(Arc::new(entries));
            loader
        };
        loader.stop();
        Ok(())
    }

    /// Stop every loader
    pub fn stop_all(&self) {
        let entries = {
            let _writer = self.lock_writer();
            self.entries.swap(Arc::new(Entries::new()))
        };
        for loader in entries.values() {
            loader.stop();
        }
    }

    /// Look up `address` in the current snapshot of `id`
    pub fn lookup(&self, id: &str, address: impl Into<Address>) -> Result<Entry> {
        let ip = address.into().resolve()?;
        let database = self.database(id)?;
        database.lookup(ip)?.ok_or(Error::NotFound)
    }

    /// Current snapshot of `id`
    ///
    /// Before the first publication this follows the loader's
    /// pre-readiness policy: fail at once, or block up to its timeout.
    pub fn database(&self, id: &str) -> Result<Arc<Database>> {
        let loader = self.require(id)?;
        if let Some(database) = loader.snapshot() {
            return Ok(database);
        }
        match loader.options().pre_readiness {
            PreReadiness::Fail => Err(Error::DatabaseNotLoaded(id.to_string())),
            PreReadiness::Block { timeout } => waiter::wait_for_snapshot(&loader, timeout),
        }
    }

    /// Metadata, source and version of the current snapshot
    pub fn get_info(&self, id: &str) -> Result<DatabaseInfo> {
        let database = self.published(id)?;
        Ok(DatabaseInfo {
            metadata: database.metadata().clone(),
            source: database.source().clone(),
            version: database.version(),
        })
    }

    /// One field of [`Registry::get_info`]
    pub fn get_info_field(&self, id: &str, field: InfoField) -> Result<InfoValue> {
        let database = self.published(id)?;
        Ok(match field {
            InfoField::Metadata => InfoValue::Metadata(database.metadata().clone()),
            InfoField::Source => InfoValue::Source(database.source().clone()),
            InfoField::Version => InfoValue::Version(database.version()),
        })
    }

    /// Run the structural analyzer on the current snapshot
    pub fn analyze(&self, id: &str) -> Result<()> {
        let database = self.published(id)?;
        analysis::analyze(&database).map_err(Error::Flawed)
    }

    /// Block until all `ids` are ready; see [`waiter::wait_for_loaders`]
    pub fn wait_for_loaders<I, S>(
        &self,
        ids: I,
        timeout: Duration,
    ) -> Result<HashMap<String, SystemTime>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        waiter::wait_for_loaders(self, ids, timeout)
    }

    /// Loader status of `id`
    pub fn status(&self, id: &str) -> Result<Status> {
        Ok(self.require(id)?.status())
    }

    /// Ask the loader of `id` to attempt a load now
    pub fn refresh(&self, id: &str) -> Result<()> {
        self.require(id)?.refresh_now();
        Ok(())
    }

    /// Ids of all running loaders, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn loader(&self, id: &str) -> Option<Arc<Loader>> {
        self.entries.load().get(id).cloned()
    }

    fn require(&self, id: &str) -> Result<Arc<Loader>> {
        self.loader(id)
            .ok_or_else(|| Error::DatabaseUnknown(id.to_string()))
    }

    /// Current snapshot without pre-readiness blocking
    fn published(&self, id: &str) -> Result<Arc<Database>> {
        self.require(id)?
            .snapshot()
            .ok_or_else(|| Error::DatabaseNotLoaded(id.to_string()))
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, ()> {
        self.writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.stop_all();
    }
}
