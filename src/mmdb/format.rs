//! MMDB Binary Format Parsing
//!
//! Locates the metadata section, decodes it, and derives the byte layout
//! of the search tree and data section from it. Everything a lookup needs
//! is validated here, once, before any traversal happens.

use super::types::{
    IpVersion, MmdbError, RecordSize, DATA_SECTION_SEPARATOR_SIZE, METADATA_MARKER,
};
use crate::data_section::{DataDecoder, DataValue};
use serde::Serialize;
use std::collections::BTreeMap;

/// Only the last 128KB of a file are searched for the metadata marker
const METADATA_SEARCH_WINDOW: usize = 128 * 1024;

/// Decoded database metadata plus the section layout derived from it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metadata {
    /// Major format version (always 2)
    pub binary_format_major_version: u16,
    /// Minor format version
    pub binary_format_minor_version: u16,
    /// Build time, seconds since the Unix epoch
    pub build_epoch: u64,
    /// Free-form database type, e.g. "GeoLite2-City"
    pub database_type: String,
    /// Description keyed by language code
    pub description: BTreeMap<String, String>,
    /// IP version of the search tree
    pub ip_version: IpVersion,
    /// Locales the data section may contain names for
    pub languages: Vec<String>,
    /// Number of nodes in the search tree
    pub node_count: u32,
    /// Record size in bits
    pub record_size: RecordSize,
    /// Search tree length in bytes
    pub search_tree_size: usize,
    /// Absolute offset of the data section
    pub data_section_start: usize,
    /// Absolute offset of the metadata marker (end of the data section)
    #[serde(skip)]
    pub metadata_start: usize,
}

impl Metadata {
    /// Parse and validate the metadata of a complete database file
    ///
    /// Rejects record sizes other than 24/28/32 bits, unknown IP versions,
    /// unsupported major versions, and node counts whose search tree would
    /// not fit in front of the metadata.
    pub fn from_file(data: &[u8]) -> Result<Self, MmdbError> {
        let marker_offset = find_metadata_marker(data)?;
        let metadata_bytes = &data[marker_offset + METADATA_MARKER.len()..];

        // Pointers inside the metadata are relative to its own start
        let value = DataDecoder::new(metadata_bytes)
            .decode(0)
            .map_err(|e| MmdbError::InvalidMetadata(format!("Failed to decode metadata: {}", e)))?;
        if !matches!(value, DataValue::Map(_)) {
            return Err(MmdbError::InvalidMetadata(
                "Metadata is not a map".to_string(),
            ));
        }

        let major = required_uint(&value, "binary_format_major_version")?;
        if major != 2 {
            return Err(MmdbError::InvalidMetadata(format!(
                "Unsupported binary format major version {}",
                major
            )));
        }
        let minor = optional_uint(&value, "binary_format_minor_version")?.unwrap_or(0);

        let record_size = RecordSize::from_bits(required_uint(&value, "record_size")?)?;
        let ip_version = IpVersion::from_number(required_uint(&value, "ip_version")?)?;

        let node_count = required_uint(&value, "node_count")?;
        if node_count > record_size.max_value() as u64 {
            return Err(MmdbError::InvalidMetadata(format!(
                "node_count {} does not fit in {}-bit records",
                node_count,
                u16::from(record_size)
            )));
        }
        let node_count = node_count as u32;

        let search_tree_size = node_count as usize * record_size.node_bytes();
        if search_tree_size > marker_offset {
            return Err(MmdbError::InvalidFormat(format!(
                "search tree of {} nodes ({} bytes) overruns the {} bytes before the metadata",
                node_count, search_tree_size, marker_offset
            )));
        }
        let data_section_start =
            (search_tree_size + DATA_SECTION_SEPARATOR_SIZE).min(marker_offset);

        let description = match value.get("description") {
            None => BTreeMap::new(),
            Some(DataValue::Map(pairs)) => pairs
                .iter()
                .map(|(lang, text)| match text {
                    DataValue::String(s) => Ok((lang.clone(), s.clone())),
                    _ => Err(MmdbError::InvalidMetadata(format!(
                        "description for '{}' is not a string",
                        lang
                    ))),
                })
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(MmdbError::InvalidMetadata(
                    "Field 'description' is not a map".to_string(),
                ))
            }
        };

        let languages = match value.get("languages") {
            None => Vec::new(),
            Some(DataValue::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            Some(_) => {
                return Err(MmdbError::InvalidMetadata(
                    "Field 'languages' is not an array".to_string(),
                ))
            }
        };

        Ok(Metadata {
            binary_format_major_version: major as u16,
            binary_format_minor_version: minor as u16,
            build_epoch: optional_uint(&value, "build_epoch")?.unwrap_or(0),
            database_type: value
                .get("database_type")
                .and_then(DataValue::as_str)
                .unwrap_or_default()
                .to_string(),
            description,
            ip_version,
            languages,
            node_count,
            record_size,
            search_tree_size,
            data_section_start,
            metadata_start: marker_offset,
        })
    }
}

/// Find the metadata marker in an MMDB file
///
/// The marker "\xAB\xCD\xEFMaxMind.com" appears somewhere in the last 128KB
/// of the file and the metadata follows it. If the data section happens to
/// contain the marker bytes too, the last occurrence wins.
pub fn find_metadata_marker(data: &[u8]) -> Result<usize, MmdbError> {
    let search_start = data.len().saturating_sub(METADATA_SEARCH_WINDOW);
    memchr::memmem::rfind(&data[search_start..], METADATA_MARKER)
        .map(|pos| search_start + pos)
        .ok_or(MmdbError::MetadataNotFound)
}

fn optional_uint(map: &DataValue, key: &str) -> Result<Option<u64>, MmdbError> {
    match map.get(key) {
        None => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            MmdbError::InvalidMetadata(format!("Field '{}' is not an unsigned integer", key))
        }),
    }
}

fn required_uint(map: &DataValue, key: &str) -> Result<u64, MmdbError> {
    optional_uint(map, key)?.ok_or_else(|| {
        MmdbError::InvalidMetadata(format!("Required field '{}' not found", key))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_section::DataEncoder;

    fn metadata_map(node_count: u32, record_size: u16, ip_version: u16) -> DataValue {
        DataValue::map([
            ("binary_format_major_version", DataValue::Uint16(2)),
            ("binary_format_minor_version", DataValue::Uint16(0)),
            ("build_epoch", DataValue::Uint64(1_700_000_000)),
            ("database_type", DataValue::string("Test-DB")),
            (
                "description",
                DataValue::map([("en", DataValue::string("test database"))]),
            ),
            ("ip_version", DataValue::Uint16(ip_version)),
            (
                "languages",
                DataValue::Array(vec![DataValue::string("en")]),
            ),
            ("node_count", DataValue::Uint32(node_count)),
            ("record_size", DataValue::Uint16(record_size)),
        ])
    }

    /// Tree of `node_count` empty nodes, separator, no data, then metadata
    fn file_with(tree_bytes: usize, metadata: &DataValue) -> Vec<u8> {
        let mut data = vec![0u8; tree_bytes + DATA_SECTION_SEPARATOR_SIZE];
        data.extend_from_slice(METADATA_MARKER);
        let mut encoder = DataEncoder::new();
        encoder.encode(metadata);
        data.extend_from_slice(&encoder.into_bytes());
        data
    }

    #[test]
    fn test_parse_metadata() {
        let data = file_with(4 * 6, &metadata_map(4, 24, 6));
        let metadata = Metadata::from_file(&data).unwrap();

        assert_eq!(metadata.node_count, 4);
        assert_eq!(metadata.record_size, RecordSize::Bits24);
        assert_eq!(metadata.ip_version, IpVersion::V6);
        assert_eq!(metadata.search_tree_size, 24);
        assert_eq!(metadata.data_section_start, 40);
        assert_eq!(metadata.metadata_start, 40);
        assert_eq!(metadata.database_type, "Test-DB");
        assert_eq!(metadata.description["en"], "test database");
        assert_eq!(metadata.languages, vec!["en".to_string()]);
        assert_eq!(metadata.build_epoch, 1_700_000_000);

        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["ip_version"], 6);
        assert_eq!(json["record_size"], 24);
    }

    #[test]
    fn test_rejects_bad_record_size() {
        let data = file_with(4 * 6, &metadata_map(4, 20, 6));
        assert!(matches!(
            Metadata::from_file(&data),
            Err(MmdbError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_rejects_node_count_beyond_file() {
        // Claims 1000 nodes but only 4 nodes of bytes precede the metadata
        let data = file_with(4 * 6, &metadata_map(1000, 24, 4));
        assert!(matches!(
            Metadata::from_file(&data),
            Err(MmdbError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_last_marker_wins() {
        let mut data = METADATA_MARKER.to_vec();
        data.extend_from_slice(&file_with(7, &metadata_map(1, 28, 4)));
        let offset = find_metadata_marker(&data).unwrap();
        assert!(offset > 0);
        assert_eq!(Metadata::from_file(&data).unwrap().record_size, RecordSize::Bits28);
    }

    #[test]
    fn test_metadata_not_found() {
        let data = b"not a valid mmdb file";
        let result = find_metadata_marker(data);
        assert!(matches!(result, Err(MmdbError::MetadataNotFound)));

        // Marker outside the search window is not found
        let mut data = METADATA_MARKER.to_vec();
        data.extend(std::iter::repeat(0u8).take(METADATA_SEARCH_WINDOW));
        assert!(find_metadata_marker(&data).is_err());
    }

    #[test]
    fn test_metadata_must_be_map() {
        let mut data = vec![0u8; 16];
        data.extend_from_slice(METADATA_MARKER);
        data.extend_from_slice(&[0x42, b'n', b'o']);
        assert!(matches!(
            Metadata::from_file(&data),
            Err(MmdbError::InvalidMetadata(_))
        ));
    }
}
