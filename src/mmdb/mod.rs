//! MaxMind DB (MMDB) Reader
//!
//! The MMDB format uses a binary search tree for IP address lookups,
//! followed by a 16-byte separator, a data section in the MMDB data
//! format (see `crate::data_section`), and finally a metadata map
//! introduced by a marker near the end of the file.
//!
//! ## Architecture
//!
//! - **types**: MMDB-specific types, constants and errors
//! - **format**: metadata marker search and metadata decoding
//! - **tree**: search tree traversal for IP lookups

pub mod format;
pub mod tree;
pub mod types;

pub use format::{find_metadata_marker, Metadata};
pub use tree::{Ipv4Start, LookupResult, Record, SearchTree};
pub use types::{IpVersion, MmdbError, RecordSize, DATA_SECTION_SEPARATOR_SIZE, METADATA_MARKER};
