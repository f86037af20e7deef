//! MMDB Search Tree Traversal
//!
//! Implements binary search tree traversal for IP address lookups.
//! The tree uses a compact binary representation where each node contains
//! two records (left and right) that point to either:
//! - Another node (continue traversal)
//! - A data section offset (found)
//! - The "no data" marker (`record == node_count`)

use super::format::Metadata;
use super::types::{IpVersion, MmdbError, RecordSize, DATA_SECTION_SEPARATOR_SIZE};
use std::net::IpAddr;

/// Number of zero bits in front of the IPv4 space of an IPv6 tree (`::/96`)
pub const IPV4_SUBTREE_DEPTH: u8 = 96;

/// Result of an IP lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupResult {
    /// Offset into the data section (relative to data section start)
    pub data_offset: u32,
    /// Number of address bits consumed before the terminal record
    pub prefix_len: u8,
}

/// What a single record refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    /// Child node index
    Node(u32),
    /// No data for this subtree
    Empty,
    /// Offset into the data section
    Data(u32),
    /// Terminal value landing inside the 16-byte separator
    Separator(u32),
}

/// Where IPv4 lookups begin
///
/// In an IPv6 tree this is whatever 96 zero bits lead to, which may
/// already be a terminal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Start {
    /// Node index, or a terminal record value if `>= node_count`
    pub value: u32,
    /// Bits consumed to get there
    pub depth: u8,
}

/// Search tree over the raw tree bytes of one database
#[derive(Debug, Clone, Copy)]
pub struct SearchTree<'a> {
    tree: &'a [u8],
    node_count: u32,
    record_size: RecordSize,
    ip_version: IpVersion,
}

impl<'a> SearchTree<'a> {
    /// Create a search tree over `tree`, the first `search_tree_size` bytes of the file
    pub fn new(tree: &'a [u8], metadata: &Metadata) -> Self {
        Self {
            tree,
            node_count: metadata.node_count,
            record_size: metadata.record_size,
            ip_version: metadata.ip_version,
        }
    }

    /// Number of nodes in the tree
    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    /// Walk 96 zero bits to locate the IPv4 subtree
    pub fn ipv4_start(&self) -> Result<Ipv4Start, MmdbError> {
        if self.ip_version == IpVersion::V4 {
            return Ok(Ipv4Start { value: 0, depth: 0 });
        }

        let mut value = 0u32;
        let mut depth = 0u8;
        while depth < IPV4_SUBTREE_DEPTH && value < self.node_count {
            value = self.read_record(value, 0)?;
            depth += 1;
        }
        Ok(Ipv4Start { value, depth })
    }

    /// Look up an IP address
    ///
    /// `ipv4_start` is the cached result of [`SearchTree::ipv4_start`].
    /// IPv4-mapped IPv6 addresses are treated as IPv4 in an IPv4 tree;
    /// any other IPv6 address there is [`MmdbError::Ipv4Database`].
    pub fn lookup(
        &self,
        ip: IpAddr,
        ipv4_start: Ipv4Start,
    ) -> Result<Option<LookupResult>, MmdbError> {
        match (ip, self.ip_version) {
            (IpAddr::V4(addr), IpVersion::V6) => {
                let bits = u32::from(addr) as u128;
                let found = self.walk(ipv4_start.value, ipv4_start.depth, bits, 32)?;
                Ok(found.map(|mut result| {
                    result.prefix_len = result.prefix_len.saturating_sub(IPV4_SUBTREE_DEPTH);
                    result
                }))
            }
            (IpAddr::V4(addr), IpVersion::V4) => self.walk(0, 0, u32::from(addr) as u128, 32),
            (IpAddr::V6(addr), IpVersion::V6) => self.walk(0, 0, u128::from(addr), 128),
            (IpAddr::V6(addr), IpVersion::V4) => match addr.to_ipv4_mapped() {
                Some(v4) => self.walk(0, 0, u32::from(v4) as u128, 32),
                None => Err(MmdbError::Ipv4Database),
            },
        }
    }

    /// Walk `width` bits of `bits` (most significant first) starting from `value`
    fn walk(
        &self,
        mut value: u32,
        mut depth: u8,
        bits: u128,
        width: u8,
    ) -> Result<Option<LookupResult>, MmdbError> {
        let mut consumed = 0u8;
        while value < self.node_count {
            if consumed == width {
                return Err(MmdbError::InvalidFormat(format!(
                    "search tree is deeper than {} bits at node {}",
                    width, value
                )));
            }
            let bit = ((bits >> (width - 1 - consumed)) & 1) as u8;
            value = self.read_record(value, bit)?;
            consumed += 1;
            depth += 1;
        }

        match self.classify(value) {
            Record::Empty => Ok(None),
            Record::Data(data_offset) => Ok(Some(LookupResult {
                data_offset,
                prefix_len: depth,
            })),
            Record::Separator(record) | Record::Node(record) => Err(MmdbError::InvalidFormat(
                format!("record {} points into the data section separator", record),
            )),
        }
    }

    /// Interpret a record value
    pub fn classify(&self, record: u32) -> Record {
        if record < self.node_count {
            return Record::Node(record);
        }
        if record == self.node_count {
            return Record::Empty;
        }
        match (record - self.node_count).checked_sub(DATA_SECTION_SEPARATOR_SIZE as u32) {
            Some(offset) => Record::Data(offset),
            None => Record::Separator(record),
        }
    }

    /// Read a record from a node
    ///
    /// Each node contains two records. `side` determines which:
    /// - 0 = left record (for IP bit 0)
    /// - 1 = right record (for IP bit 1)
    pub fn read_record(&self, node: u32, side: u8) -> Result<u32, MmdbError> {
        if node >= self.node_count {
            return Err(MmdbError::InvalidFormat(format!(
                "Node index {} exceeds node count {}",
                node, self.node_count
            )));
        }

        let node_bytes = self.record_size.node_bytes();
        let start = node as usize * node_bytes;
        let bytes = self.tree.get(start..start + node_bytes).ok_or_else(|| {
            MmdbError::InvalidFormat(format!(
                "Node {} lies outside the {} byte search tree",
                node,
                self.tree.len()
            ))
        })?;

        Ok(match (self.record_size, side) {
            (RecordSize::Bits24, 0) => be24(bytes[0], bytes[1], bytes[2]),
            (RecordSize::Bits24, _) => be24(bytes[3], bytes[4], bytes[5]),
            // Middle byte: high nibble belongs to the left record, low nibble to the right
            (RecordSize::Bits28, 0) => {
                ((bytes[3] as u32 & 0xF0) << 20) | be24(bytes[0], bytes[1], bytes[2])
            }
            (RecordSize::Bits28, _) => {
                ((bytes[3] as u32 & 0x0F) << 24) | be24(bytes[4], bytes[5], bytes[6])
            }
            (RecordSize::Bits32, 0) => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            (RecordSize::Bits32, _) => u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}

fn be24(b0: u8, b1: u8, b2: u8) -> u32 {
    (b0 as u32) << 16 | (b1 as u32) << 8 | b2 as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::Ipv6Addr;

    fn metadata(node_count: u32, record_size: RecordSize, ip_version: IpVersion) -> Metadata {
        Metadata {
            binary_format_major_version: 2,
            binary_format_minor_version: 0,
            build_epoch: 0,
            database_type: "test".to_string(),
            description: BTreeMap::new(),
            ip_version,
            languages: Vec::new(),
            node_count,
            record_size,
            search_tree_size: node_count as usize * record_size.node_bytes(),
            data_section_start: node_count as usize * record_size.node_bytes() + 16,
            metadata_start: node_count as usize * record_size.node_bytes() + 16,
        }
    }

    #[test]
    fn test_read_24bit_record() {
        // Node 0: left=1, right=2
        let data = [0x00, 0x00, 0x01, 0x00, 0x00, 0x02, 0, 0, 0, 0, 0, 0];
        let meta = metadata(2, RecordSize::Bits24, IpVersion::V6);
        let tree = SearchTree::new(&data, &meta);

        assert_eq!(tree.read_record(0, 0).unwrap(), 1);
        assert_eq!(tree.read_record(0, 1).unwrap(), 2);
        assert!(tree.read_record(2, 0).is_err());
    }

    #[test]
    fn test_read_28bit_record() {
        // Left: 0x1000001, Right: 0x2000002
        let data = [0x00, 0x00, 0x01, 0x12, 0x00, 0x00, 0x02];
        let meta = metadata(1, RecordSize::Bits28, IpVersion::V6);
        let tree = SearchTree::new(&data, &meta);

        assert_eq!(tree.read_record(0, 0).unwrap(), 0x1000001);
        assert_eq!(tree.read_record(0, 1).unwrap(), 0x2000002);
    }

    #[test]
    fn test_read_32bit_record() {
        let data = [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00, 0x00, 0x11];
        let meta = metadata(1, RecordSize::Bits32, IpVersion::V4);
        let tree = SearchTree::new(&data, &meta);

        assert_eq!(tree.read_record(0, 0).unwrap(), 0xDEADBEEF);
        assert_eq!(tree.read_record(0, 1).unwrap(), 0x11);
    }

    #[test]
    fn test_classify_records() {
        let meta = metadata(100, RecordSize::Bits24, IpVersion::V6);
        let tree = SearchTree::new(&[], &meta);

        assert_eq!(tree.classify(5), Record::Node(5));
        assert_eq!(tree.classify(100), Record::Empty);
        assert_eq!(tree.classify(110), Record::Separator(110));
        // 116 - 100 - 16 = 0
        assert_eq!(tree.classify(116), Record::Data(0));
        assert_eq!(tree.classify(200), Record::Data(84));
    }

    #[test]
    fn test_single_node_ipv4_tree() {
        // One node: 0.0.0.0/1 -> data offset 0, 128.0.0.0/1 -> empty
        // node_count = 1, data record = 1 + 16 + 0 = 17, empty = 1
        let data = [0x00, 0x00, 17, 0x00, 0x00, 0x01];
        let meta = metadata(1, RecordSize::Bits24, IpVersion::V4);
        let tree = SearchTree::new(&data, &meta);
        let start = tree.ipv4_start().unwrap();

        let hit = tree.lookup("10.1.2.3".parse().unwrap(), start).unwrap();
        assert_eq!(
            hit,
            Some(LookupResult {
                data_offset: 0,
                prefix_len: 1
            })
        );
        assert_eq!(tree.lookup("200.1.2.3".parse().unwrap(), start).unwrap(), None);

        // IPv4-mapped IPv6 is looked up as IPv4
        let mapped = IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0x0a01, 0x0203));
        assert!(tree.lookup(mapped, start).unwrap().is_some());

        // Anything else from IPv6 is rejected
        assert_eq!(
            tree.lookup("2001:db8::1".parse().unwrap(), start),
            Err(MmdbError::Ipv4Database)
        );
    }

    #[test]
    fn test_ipv4_start_hits_terminal_early() {
        // One node IPv6 tree: ::/1 -> data, 8000::/1 -> empty
        let data = [0x00, 0x00, 17, 0x00, 0x00, 0x01];
        let meta = metadata(1, RecordSize::Bits24, IpVersion::V6);
        let tree = SearchTree::new(&data, &meta);

        let start = tree.ipv4_start().unwrap();
        assert_eq!(start, Ipv4Start { value: 17, depth: 1 });

        // Every IPv4 address is covered by ::/1; its IPv4 prefix length is 0
        let hit = tree.lookup("192.0.2.1".parse().unwrap(), start).unwrap().unwrap();
        assert_eq!(hit.data_offset, 0);
        assert_eq!(hit.prefix_len, 0);
    }

    #[test]
    fn test_exhausted_bits_is_an_error() {
        // Node 0 points to itself on both sides: never terminates
        let data = [0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let meta = metadata(1, RecordSize::Bits24, IpVersion::V4);
        let tree = SearchTree::new(&data, &meta);

        let err = tree
            .lookup("1.2.3.4".parse().unwrap(), Ipv4Start { value: 0, depth: 0 })
            .unwrap_err();
        assert!(matches!(err, MmdbError::InvalidFormat(_)));
    }

    #[test]
    fn test_empty_tree() {
        let meta = metadata(0, RecordSize::Bits24, IpVersion::V6);
        let tree = SearchTree::new(&[], &meta);
        let start = tree.ipv4_start().unwrap();
        assert_eq!(tree.lookup("1.2.3.4".parse().unwrap(), start).unwrap(), None);
        assert_eq!(tree.lookup("::1".parse().unwrap(), start).unwrap(), None);
    }
}
