//! MMDB Database Builder
//!
//! Writes complete MMDB files: search tree, separator, data section,
//! metadata marker and metadata map. Used for fixtures and by the
//! `build` command of the CLI.

use crate::data_section::{DataEncoder, DataValue};
use crate::ip_tree_builder::IpTreeBuilder;
use crate::mmdb::{IpVersion, MmdbError, RecordSize, DATA_SECTION_SEPARATOR_SIZE, METADATA_MARKER};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Single network and its record
#[derive(Debug, Clone)]
struct DataEntry {
    addr: IpAddr,
    prefix_len: u8,
    data: DataValue,
}

/// Database builder
#[derive(Debug, Clone)]
pub struct MmdbBuilder {
    entries: Vec<DataEntry>,
    record_size: RecordSize,
    ip_version: Option<IpVersion>,
    database_type: String,
    description: BTreeMap<String, String>,
    languages: Vec<String>,
    build_epoch: Option<u64>,
    ipv4_mapped_alias: bool,
}

impl MmdbBuilder {
    /// Create a new builder with 24-bit records
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            record_size: RecordSize::Bits24,
            ip_version: None,
            database_type: "ipatlas".to_string(),
            description: BTreeMap::new(),
            languages: Vec::new(),
            build_epoch: None,
            ipv4_mapped_alias: false,
        }
    }

    /// Set the record size
    pub fn with_record_size(mut self, record_size: RecordSize) -> Self {
        self.record_size = record_size;
        self
    }

    /// Force the tree version
    ///
    /// Without this the tree is IPv6 if any IPv6 network was added, else IPv4.
    pub fn with_ip_version(mut self, ip_version: IpVersion) -> Self {
        self.ip_version = Some(ip_version);
        self
    }

    /// Set the database type name
    pub fn with_database_type(mut self, db_type: impl Into<String>) -> Self {
        self.database_type = db_type.into();
        self
    }

    /// Add a description in a specific language
    pub fn with_description(mut self, language: impl Into<String>, text: impl Into<String>) -> Self {
        self.description.insert(language.into(), text.into());
        self
    }

    /// Add a language to the `languages` metadata array
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.languages.push(language.into());
        self
    }

    /// Pin the build epoch (defaults to now)
    pub fn with_build_epoch(mut self, epoch: u64) -> Self {
        self.build_epoch = Some(epoch);
        self
    }

    /// Alias `::ffff:0:0/96` to the IPv4 subtree of an IPv6 tree
    pub fn with_ipv4_mapped_alias(mut self) -> Self {
        self.ipv4_mapped_alias = true;
        self
    }

    /// Add a network in CIDR notation (a bare address is a host route)
    pub fn add_entry(&mut self, cidr: &str, data: DataValue) -> Result<(), MmdbError> {
        let (addr, prefix_len) = parse_cidr(cidr)?;
        self.insert(addr, prefix_len, data);
        Ok(())
    }

    /// Add a network
    pub fn insert(&mut self, addr: IpAddr, prefix_len: u8, data: DataValue) {
        self.entries.push(DataEntry {
            addr,
            prefix_len,
            data,
        });
    }

    /// Number of networks added so far
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no networks were added
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the database file
    pub fn build(&self) -> Result<Vec<u8>, MmdbError> {
        let ip_version = self.ip_version.unwrap_or_else(|| {
            if self.entries.iter().any(|e| e.addr.is_ipv6()) {
                IpVersion::V6
            } else {
                IpVersion::V4
            }
        });

        let mut data_encoder = DataEncoder::new();
        let mut tree_builder = IpTreeBuilder::new(ip_version, self.record_size);
        if self.ipv4_mapped_alias {
            tree_builder = tree_builder.with_ipv4_mapped_alias();
        }

        for entry in &self.entries {
            let offset = data_encoder.encode(&entry.data);
            tree_builder.insert(entry.addr, entry.prefix_len, offset)?;
        }

        let (tree, node_count) = tree_builder.build()?;
        let data_section = data_encoder.into_bytes();

        let build_epoch = match self.build_epoch {
            Some(epoch) => epoch,
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };

        let metadata = DataValue::map([
            ("binary_format_major_version", DataValue::Uint16(2)),
            ("binary_format_minor_version", DataValue::Uint16(0)),
            ("build_epoch", DataValue::Uint64(build_epoch)),
            ("database_type", DataValue::string(self.database_type.clone())),
            (
                "description",
                DataValue::Map(
                    self.description
                        .iter()
                        .map(|(k, v)| (k.clone(), DataValue::string(v.clone())))
                        .collect(),
                ),
            ),
            (
                "ip_version",
                DataValue::Uint16(u8::from(ip_version) as u16),
            ),
            (
                "languages",
                DataValue::Array(self.languages.iter().cloned().map(DataValue::String).collect()),
            ),
            ("node_count", DataValue::Uint32(node_count)),
            ("record_size", DataValue::Uint16(u16::from(self.record_size))),
        ]);
        let mut meta_encoder = DataEncoder::new();
        meta_encoder.encode(&metadata);

        let mut database = Vec::with_capacity(tree.len() + data_section.len() + 512);
        database.extend_from_slice(&tree);
        database.extend_from_slice(&[0u8; DATA_SECTION_SEPARATOR_SIZE]);
        database.extend_from_slice(&data_section);
        database.extend_from_slice(METADATA_MARKER);
        database.extend_from_slice(&meta_encoder.into_bytes());
        Ok(database)
    }
}

impl Default for MmdbBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `addr/len` or a bare address (full-length prefix)
pub fn parse_cidr(cidr: &str) -> Result<(IpAddr, u8), MmdbError> {
    let invalid = || MmdbError::InvalidFormat(format!("Invalid network '{}'", cidr));

    let (addr, prefix_len) = match cidr.split_once('/') {
        Some((addr, len)) => {
            let addr: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
            let len: u8 = len.trim().parse().map_err(|_| invalid())?;
            (addr, len)
        }
        None => {
            let addr: IpAddr = cidr.trim().parse().map_err(|_| invalid())?;
            (addr, if addr.is_ipv4() { 32 } else { 128 })
        }
    };

    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix_len > max {
        return Err(invalid());
    }
    Ok((addr, prefix_len))
}
