//! IP Tree Builder for MMDB Format
//!
//! Builds the binary search tree of an MMDB file from CIDR prefixes and
//! data section offsets. Supports IPv4 trees and IPv6 trees (which hold
//! IPv4 prefixes under `::/96`), with longest-prefix-wins semantics
//! regardless of insertion order.

use crate::mmdb::{IpVersion, MmdbError, RecordSize, DATA_SECTION_SEPARATOR_SIZE};
use std::net::IpAddr;

/// IP tree builder using arena allocation
pub struct IpTreeBuilder {
    record_size: RecordSize,
    nodes: Vec<Node>,
    ip_version: IpVersion,
    alias_ipv4_mapped: bool,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    /// Children indexed by address bit
    children: [NodePointer; 2],
}

/// Node pointer - can point to another node, data, or be empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodePointer {
    Node(u32),
    /// Data offset and the prefix length that put it here.
    /// The prefix length only steers building; it is not written out.
    Data(u32, u8),
    Empty,
}

impl IpTreeBuilder {
    /// Create a builder for the given tree version and record size
    pub fn new(ip_version: IpVersion, record_size: RecordSize) -> Self {
        Self {
            record_size,
            nodes: vec![Node::empty()],
            ip_version,
            alias_ipv4_mapped: false,
        }
    }

    /// Make `::ffff:0:0/96` lead to the IPv4 subtree of an IPv6 tree
    ///
    /// The aliased subtree is shared, so those nodes have two parents.
    pub fn with_ipv4_mapped_alias(mut self) -> Self {
        self.alias_ipv4_mapped = true;
        self
    }

    /// Insert an IP address or CIDR range with associated data offset
    ///
    /// More specific prefixes always win over less specific ones; inserting
    /// the same prefix twice keeps the later offset.
    pub fn insert(&mut self, addr: IpAddr, prefix_len: u8, data_offset: u32) -> Result<(), MmdbError> {
        let (bits, depth) = match (addr, self.ip_version) {
            (IpAddr::V4(v4), version) => {
                if prefix_len > 32 {
                    return Err(MmdbError::InvalidFormat(format!(
                        "IPv4 prefix length {} exceeds 32",
                        prefix_len
                    )));
                }
                let bits = u32::from(v4) as u128;
                match version {
                    // IPv4 lives at ::a.b.c.d inside an IPv6 tree
                    IpVersion::V6 => (bits, 96 + prefix_len),
                    IpVersion::V4 => (bits << 96, prefix_len),
                }
            }
            (IpAddr::V6(_), IpVersion::V4) => {
                return Err(MmdbError::InvalidFormat(
                    "Cannot insert IPv6 address into IPv4-only tree".to_string(),
                ))
            }
            (IpAddr::V6(v6), IpVersion::V6) => {
                if prefix_len > 128 {
                    return Err(MmdbError::InvalidFormat(format!(
                        "IPv6 prefix length {} exceeds 128",
                        prefix_len
                    )));
                }
                (u128::from(v6), prefix_len)
            }
        };

        if depth == 0 {
            return Err(MmdbError::InvalidFormat(
                "A zero-length prefix cannot be stored in the search tree".to_string(),
            ));
        }
        self.insert_bits(bits, depth, data_offset);
        Ok(())
    }

    /// Insert the first `prefix_len` bits of a left-aligned 128-bit key
    fn insert_bits(&mut self, bits: u128, prefix_len: u8, data_offset: u32) {
        let mut node_id = 0u32;

        for depth in 0..prefix_len {
            let bit = ((bits >> (127 - depth)) & 1) as usize;
            let child = self.nodes[node_id as usize].children[bit];

            if depth + 1 == prefix_len {
                match child {
                    NodePointer::Empty => {
                        self.nodes[node_id as usize].children[bit] =
                            NodePointer::Data(data_offset, prefix_len);
                    }
                    NodePointer::Data(_, existing_len) => {
                        if prefix_len >= existing_len {
                            self.nodes[node_id as usize].children[bit] =
                                NodePointer::Data(data_offset, prefix_len);
                        }
                    }
                    // More specific prefixes already live below: fill the gaps around them
                    NodePointer::Node(child_id) => {
                        self.backfill_less_specific(child_id, data_offset, prefix_len)
                    }
                }
                return;
            }

            node_id = match child {
                NodePointer::Node(child_id) => child_id,
                NodePointer::Empty => {
                    let new_id = self.allocate_node(Node::empty());
                    self.nodes[node_id as usize].children[bit] = NodePointer::Node(new_id);
                    new_id
                }
                // A less specific prefix covers this path: split it so both halves keep it
                NodePointer::Data(..) => {
                    let new_id = self.allocate_node(Node {
                        children: [child, child],
                    });
                    self.nodes[node_id as usize].children[bit] = NodePointer::Node(new_id);
                    new_id
                }
            };
        }
    }

    fn allocate_node(&mut self, node: Node) -> u32 {
        let id = self.nodes.len() as u32;
        self.nodes.push(node);
        id
    }

    /// Point every empty or less specific record below `node_id` at `data_offset`
    fn backfill_less_specific(&mut self, node_id: u32, data_offset: u32, prefix_len: u8) {
        let mut stack = vec![node_id];
        while let Some(id) = stack.pop() {
            for side in 0..2 {
                match self.nodes[id as usize].children[side] {
                    NodePointer::Empty => {
                        self.nodes[id as usize].children[side] =
                            NodePointer::Data(data_offset, prefix_len);
                    }
                    NodePointer::Data(_, existing_len) if prefix_len > existing_len => {
                        self.nodes[id as usize].children[side] =
                            NodePointer::Data(data_offset, prefix_len);
                    }
                    NodePointer::Data(..) => {}
                    NodePointer::Node(child_id) => stack.push(child_id),
                }
            }
        }
    }

    /// Walk (creating nodes as needed) along `depth` bits of `bits`, returning the
    /// node the final edge leaves from and the bit of that edge
    fn ensure_path(nodes: &mut Vec<Node>, bits: u128, depth: u8) -> (u32, usize) {
        let mut node_id = 0u32;
        for d in 0..depth - 1 {
            let bit = ((bits >> (127 - d)) & 1) as usize;
            node_id = match nodes[node_id as usize].children[bit] {
                NodePointer::Node(child_id) => child_id,
                other => {
                    let new_id = nodes.len() as u32;
                    let fill = if matches!(other, NodePointer::Data(..)) { other } else { NodePointer::Empty };
                    nodes.push(Node {
                        children: [fill, fill],
                    });
                    nodes[node_id as usize].children[bit] = NodePointer::Node(new_id);
                    new_id
                }
            };
        }
        (node_id, ((bits >> (128 - depth as u32)) & 1) as usize)
    }

    /// Build the tree and return serialized bytes
    ///
    /// Returns: (tree_bytes, node_count)
    pub fn build(&self) -> Result<(Vec<u8>, u32), MmdbError> {
        let mut nodes = self.nodes.clone();

        if self.alias_ipv4_mapped && self.ip_version == IpVersion::V6 {
            // Point ::ffff:0:0/96 at whatever ::/96 leads to
            let (v4_parent, v4_bit) = Self::ensure_path(&mut nodes, 0, 96);
            let target = nodes[v4_parent as usize].children[v4_bit];
            let mapped = 0xffffu128 << 32;
            let (alias_parent, alias_bit) = Self::ensure_path(&mut nodes, mapped, 96);
            nodes[alias_parent as usize].children[alias_bit] = target;
        }

        let node_count = nodes.len() as u32;
        let node_size = self.record_size.node_bytes();
        let mut tree = vec![0u8; node_count as usize * node_size];

        for (node_id, node) in nodes.iter().enumerate() {
            let left = self.pointer_to_value(node.children[0], node_count)?;
            let right = self.pointer_to_value(node.children[1], node_count)?;
            let out = &mut tree[node_id * node_size..(node_id + 1) * node_size];

            match self.record_size {
                RecordSize::Bits24 => {
                    out[0..3].copy_from_slice(&left.to_be_bytes()[1..]);
                    out[3..6].copy_from_slice(&right.to_be_bytes()[1..]);
                }
                RecordSize::Bits28 => {
                    out[0..3].copy_from_slice(&left.to_be_bytes()[1..]);
                    out[3] = (((left >> 24) & 0x0F) << 4) as u8 | ((right >> 24) & 0x0F) as u8;
                    out[4..7].copy_from_slice(&right.to_be_bytes()[1..]);
                }
                RecordSize::Bits32 => {
                    out[0..4].copy_from_slice(&left.to_be_bytes());
                    out[4..8].copy_from_slice(&right.to_be_bytes());
                }
            }
        }

        Ok((tree, node_count))
    }

    /// Convert node pointer to numeric record value
    fn pointer_to_value(&self, pointer: NodePointer, node_count: u32) -> Result<u32, MmdbError> {
        let value = match pointer {
            NodePointer::Empty => node_count as u64,
            NodePointer::Node(id) => id as u64,
            NodePointer::Data(offset, _) => {
                node_count as u64 + DATA_SECTION_SEPARATOR_SIZE as u64 + offset as u64
            }
        };
        if value > self.record_size.max_value() as u64 {
            return Err(MmdbError::InvalidFormat(format!(
                "Record value {} does not fit in {}-bit records",
                value,
                u16::from(self.record_size)
            )));
        }
        Ok(value as u32)
    }
}

impl Node {
    fn empty() -> Self {
        Self {
            children: [NodePointer::Empty; 2],
        }
    }
}
