//! MMDB-specific Type Definitions
//!
//! Shared by the decoder, the search tree and the metadata parser.

use serde::Serialize;
use thiserror::Error;

/// MMDB metadata marker: "\xAB\xCD\xEFMaxMind.com"
pub const METADATA_MARKER: &[u8] = b"\xAB\xCD\xEFMaxMind.com";

/// Size of the all-zero separator between the search tree and the data section
pub const DATA_SECTION_SEPARATOR_SIZE: usize = 16;

/// MMDB-specific error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MmdbError {
    /// Invalid file format
    #[error("Invalid MMDB format: {0}")]
    InvalidFormat(String),
    /// Metadata not found
    #[error("MMDB metadata marker not found")]
    MetadataNotFound,
    /// Invalid metadata structure
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),
    /// Data section bytes that cannot be decoded
    #[error("Corrupt data at offset {offset}: {reason}")]
    CorruptData {
        /// Offset (relative to the decoded buffer) where decoding failed
        offset: usize,
        /// What was wrong
        reason: String,
    },
    /// IPv6 address looked up in an IPv4-only database
    #[error("IPv6 address looked up in an IPv4-only database")]
    Ipv4Database,
}

impl MmdbError {
    pub(crate) fn corrupt(offset: usize, reason: impl Into<String>) -> Self {
        MmdbError::CorruptData {
            offset,
            reason: reason.into(),
        }
    }
}

/// IP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "u8")]
pub enum IpVersion {
    /// IPv4 only
    V4,
    /// IPv6 (may include IPv4 addresses under ::/96)
    V6,
}

impl IpVersion {
    /// Number of address bits walked for this version
    pub fn bit_width(self) -> u8 {
        match self {
            IpVersion::V4 => 32,
            IpVersion::V6 => 128,
        }
    }

    /// Create from the metadata `ip_version` value
    pub fn from_number(n: u64) -> Result<Self, MmdbError> {
        match n {
            4 => Ok(IpVersion::V4),
            6 => Ok(IpVersion::V6),
            _ => Err(MmdbError::InvalidMetadata(format!("Invalid IP version: {}", n))),
        }
    }
}

impl From<IpVersion> for u8 {
    fn from(version: IpVersion) -> u8 {
        match version {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }
}

/// Record size in bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "u16")]
pub enum RecordSize {
    /// 24-bit records (3 bytes per record, 6 bytes per node)
    Bits24 = 24,
    /// 28-bit records (3.5 bytes per record, 7 bytes per node)
    Bits28 = 28,
    /// 32-bit records (4 bytes per record, 8 bytes per node)
    Bits32 = 32,
}

impl RecordSize {
    /// Get the size of a node (2 records) in bytes
    pub fn node_bytes(self) -> usize {
        match self {
            RecordSize::Bits24 => 6,
            RecordSize::Bits28 => 7,
            RecordSize::Bits32 => 8,
        }
    }

    /// Largest record value representable at this size
    pub fn max_value(self) -> u32 {
        match self {
            RecordSize::Bits24 => 0x00FF_FFFF,
            RecordSize::Bits28 => 0x0FFF_FFFF,
            RecordSize::Bits32 => u32::MAX,
        }
    }

    /// Create from bit size
    pub fn from_bits(bits: u64) -> Result<Self, MmdbError> {
        match bits {
            24 => Ok(RecordSize::Bits24),
            28 => Ok(RecordSize::Bits28),
            32 => Ok(RecordSize::Bits32),
            _ => Err(MmdbError::InvalidMetadata(format!(
                "Invalid record size: {} bits",
                bits
            ))),
        }
    }
}

impl From<RecordSize> for u16 {
    fn from(size: RecordSize) -> u16 {
        size as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_size_layout() {
        assert_eq!(RecordSize::from_bits(24).unwrap().node_bytes(), 6);
        assert_eq!(RecordSize::from_bits(28).unwrap().node_bytes(), 7);
        assert_eq!(RecordSize::from_bits(32).unwrap().node_bytes(), 8);
        assert!(RecordSize::from_bits(16).is_err());
        assert!(RecordSize::from_bits(0).is_err());
    }

    #[test]
    fn test_ip_version_from_number() {
        assert_eq!(IpVersion::from_number(4).unwrap(), IpVersion::V4);
        assert_eq!(IpVersion::from_number(6).unwrap().bit_width(), 128);
        assert!(matches!(
            IpVersion::from_number(5),
            Err(MmdbError::InvalidMetadata(_))
        ));
    }
}
