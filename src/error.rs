//! Error types for the ipatlas library

use crate::analysis::Flaw;
use crate::database::DatabaseError;
use crate::mmdb::MmdbError;
use thiserror::Error;

/// Result type alias for ipatlas operations
pub type Result<T> = std::result::Result<T, Error>;

/// Public error type
///
/// Input errors (`InvalidUrl`, `InvalidAddress`, `InvalidOption`) are
/// rejected synchronously and never retried. `DatabaseNotLoaded` and
/// `Loading` are transient: the loader keeps retrying in the background.
#[derive(Error, Debug)]
pub enum Error {
    /// Origin is neither an edition name, an http(s) URL nor an absolute path
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Loader options failed validation
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// A loader with this id is already running
    #[error("Loader already started: {0}")]
    AlreadyStarted(String),

    /// Stop of an id that has no loader
    #[error("Loader not found: {0}")]
    LoaderNotFound(String),

    /// Address text that does not parse
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// No loader exists for this id
    #[error("Database unknown: {0}")]
    DatabaseUnknown(String),

    /// The loader exists but has never published a snapshot
    #[error("Database not loaded: {0}")]
    DatabaseNotLoaded(String),

    /// No network covers the address
    #[error("Address not found")]
    NotFound,

    /// IPv6 address looked up in an IPv4-only database
    #[error("IPv6 address looked up in an IPv4-only database")]
    Ipv4Database,

    /// `get_info_field` with a field name that does not exist
    #[error("Unknown info field: {0}")]
    UnknownField(String),

    /// Analysis found problems
    #[error("Database is flawed ({} flaws)", .0.len())]
    Flawed(Vec<Flaw>),

    /// A loader failed before ever becoming ready
    #[error("Failed to load {id}: {reason}")]
    Loading {
        /// Database id
        id: String,
        /// Last failure
        reason: String,
    },

    /// Waiting for loaders took too long
    #[error("Timed out waiting for loaders")]
    Timeout,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Format/decoding errors
    #[error("Format error: {0}")]
    Format(MmdbError),
}

impl Error {
    /// Create an invalid URL error
    pub fn invalid_url(msg: impl Into<String>) -> Self {
        Self::InvalidUrl(msg.into())
    }

    /// Create an invalid option error
    pub fn invalid_option(msg: impl Into<String>) -> Self {
        Self::InvalidOption(msg.into())
    }

    /// Create a loading error
    pub fn loading(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Loading {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

impl From<MmdbError> for Error {
    fn from(err: MmdbError) -> Self {
        match err {
            MmdbError::Ipv4Database => Self::Ipv4Database,
            other => Self::Format(other),
        }
    }
}

impl From<DatabaseError> for Error {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Io(e) => Self::Io(e),
            DatabaseError::Format(e) => e.into(),
        }
    }
}
