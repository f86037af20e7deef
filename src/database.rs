//! Database snapshot
//!
//! A [`Database`] is one fully validated, immutable MMDB file plus where it
//! came from and which version it is. Loaders replace snapshots wholesale;
//! nothing inside one is ever mutated after construction.
//!
//! # Examples
//!
//! ```no_run
//! use ipatlas::Database;
//!
//! let db = Database::open("GeoLite2-Country.mmdb")?;
//! if let Some(entry) = db.lookup("1.1.1.1".parse()?)? {
//!     println!("/{} {:?}", entry.prefix_len, entry.data);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::data_section::{DataDecoder, DataValue};
use crate::mmdb::{Ipv4Start, Metadata, MmdbError, SearchTree};
use memmap2::Mmap;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// Where the bytes of a snapshot were read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "location", rename_all = "lowercase")]
pub enum Source {
    /// Downloaded from a URL
    Remote(String),
    /// Read back from the local cache
    Cache(PathBuf),
    /// Read from a user-supplied path
    Filesystem(PathBuf),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Remote(url) => write!(f, "remote:{}", url),
            Source::Cache(path) => write!(f, "cache:{}", path.display()),
            Source::Filesystem(path) => write!(f, "filesystem:{}", path.display()),
        }
    }
}

/// A lookup hit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    /// The record covering the address
    pub data: DataValue,
    /// Prefix length of the covering network
    pub prefix_len: u8,
}

/// Errors opening a database from disk
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Format error
    #[error("Format error: {0}")]
    Format(#[from] MmdbError),
}

/// Storage for database data - either owned or memory-mapped
enum DatabaseStorage {
    Owned(Vec<u8>),
    Mmap(Mmap),
}

impl DatabaseStorage {
    fn as_slice(&self) -> &[u8] {
        match self {
            DatabaseStorage::Owned(v) => v.as_slice(),
            DatabaseStorage::Mmap(m) => &m[..],
        }
    }
}

/// Immutable, lookup-ready database snapshot
pub struct Database {
    storage: DatabaseStorage,
    metadata: Metadata,
    ipv4_start: Ipv4Start,
    source: Source,
    version: SystemTime,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("database_type", &self.metadata.database_type)
            .field("node_count", &self.metadata.node_count)
            .field("source", &self.source)
            .field("version", &self.version)
            .finish()
    }
}

impl Database {
    /// Open a database file using memory mapping
    ///
    /// The version is the file's modification time. The file must not be
    /// modified in place while the snapshot is alive; loaders read origin
    /// files into memory instead.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let version = file.metadata()?.modified()?;

        // SAFETY: the map is read-only and lives as long as the Database
        let mmap = unsafe { Mmap::map(&file)? };

        Ok(Self::from_storage(
            DatabaseStorage::Mmap(mmap),
            Source::Filesystem(path.to_path_buf()),
            version,
        )?)
    }

    /// Create a snapshot from raw bytes
    pub fn from_bytes(data: Vec<u8>, source: Source, version: SystemTime) -> Result<Self, MmdbError> {
        Self::from_storage(DatabaseStorage::Owned(data), source, version)
    }

    fn from_storage(
        storage: DatabaseStorage,
        source: Source,
        version: SystemTime,
    ) -> Result<Self, MmdbError> {
        let bytes = storage.as_slice();
        let metadata = Metadata::from_file(bytes)?;
        let ipv4_start = SearchTree::new(&bytes[..metadata.search_tree_size], &metadata).ipv4_start()?;

        Ok(Self {
            storage,
            metadata,
            ipv4_start,
            source,
            version,
        })
    }

    /// Look up an IP address
    ///
    /// Returns `Ok(None)` when no network covers the address and
    /// [`MmdbError::Ipv4Database`] for IPv6 addresses in an IPv4 database.
    pub fn lookup(&self, addr: IpAddr) -> Result<Option<Entry>, MmdbError> {
        let found = match self.tree().lookup(addr, self.ipv4_start)? {
            Some(found) => found,
            None => return Ok(None),
        };

        let data = self.decoder().decode(found.data_offset as usize)?;
        Ok(Some(Entry {
            data,
            prefix_len: found.prefix_len,
        }))
    }

    /// Search tree view over this snapshot
    pub fn tree(&self) -> SearchTree<'_> {
        SearchTree::new(&self.bytes()[..self.metadata.search_tree_size], &self.metadata)
    }

    /// Decoder over the data section
    pub fn decoder(&self) -> DataDecoder<'_> {
        DataDecoder::new(self.data_section())
    }

    /// Data section bytes (pointers and tree offsets are relative to its start)
    pub fn data_section(&self) -> &[u8] {
        &self.bytes()[self.metadata.data_section_start..self.metadata.metadata_start]
    }

    /// The whole file
    pub fn bytes(&self) -> &[u8] {
        self.storage.as_slice()
    }

    /// Decoded metadata
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Where this snapshot was read from
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Version marker of this snapshot
    pub fn version(&self) -> SystemTime {
        self.version
    }

    /// Same bytes, different provenance
    pub(crate) fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }
}
