//! Structural analysis of database snapshots
//!
//! Walks the whole search tree once and decodes every data record it
//! reaches, collecting every problem found instead of stopping at the
//! first. Lookups never run this; it is an offline diagnostic.
//!
//! # Usage
//!
//! ```rust,no_run
//! use ipatlas::{analysis, Database};
//!
//! let db = Database::open("GeoLite2-City.mmdb")?;
//! match analysis::analyze(&db) {
//!     Ok(()) => println!("no flaws"),
//!     Err(flaws) => {
//!         for flaw in &flaws {
//!             println!("  - {}", flaw);
//!         }
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::database::Database;
use crate::mmdb::{Record, DATA_SECTION_SEPARATOR_SIZE};
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Which record of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Followed for a 0 bit
    Left,
    /// Followed for a 1 bit
    Right,
}

impl Side {
    fn from_bit(bit: u8) -> Self {
        if bit == 0 {
            Side::Left
        } else {
            Side::Right
        }
    }
}

/// Where a flaw was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    /// A record of a search tree node
    Node {
        /// Node index
        index: u32,
        /// Which record
        side: Side,
    },
    /// An offset into the data section
    DataOffset(u32),
    /// The search tree as a whole
    Tree,
}

/// What is wrong
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlawKind {
    /// node_count × node size plus the separator does not fit before the metadata
    TreeSizeMismatch {
        /// Bytes the metadata implies
        expected: usize,
        /// Bytes actually available
        available: usize,
    },
    /// The 16 bytes after the tree are not all zero
    SeparatorNotZeroed,
    /// A node record points at its own node
    SelfReferencingNode,
    /// A node record continues past the last address bit
    TreeTooDeep,
    /// A terminal record lands inside the separator
    InvalidDataPointer {
        /// Raw record value
        record: u32,
    },
    /// A terminal record lands past the end of the data section
    DanglingDataPointer {
        /// Data section length
        data_section_len: usize,
    },
    /// A reachable data record fails to decode
    DataDecodingFailed {
        /// Decoder error
        reason: String,
    },
    /// Nodes no path from the root leads to
    UnreachableNodes {
        /// How many
        count: u32,
    },
}

/// A single problem found by [`analyze`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Flaw {
    /// What is wrong
    #[serde(flatten)]
    pub kind: FlawKind,
    /// Where
    pub location: Location,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Node { index, side } => write!(f, "node {} ({:?} record)", index, side),
            Location::DataOffset(offset) => write!(f, "data offset {}", offset),
            Location::Tree => write!(f, "search tree"),
        }
    }
}

impl fmt::Display for Flaw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FlawKind::TreeSizeMismatch {
                expected,
                available,
            } => write!(
                f,
                "{}: needs {} bytes but only {} precede the metadata",
                self.location, expected, available
            ),
            FlawKind::SeparatorNotZeroed => {
                write!(f, "{}: data section separator is not zeroed", self.location)
            }
            FlawKind::SelfReferencingNode => write!(f, "{}: points to itself", self.location),
            FlawKind::TreeTooDeep => write!(
                f,
                "{}: continues past the last address bit",
                self.location
            ),
            FlawKind::InvalidDataPointer { record } => write!(
                f,
                "{}: record {} points into the separator",
                self.location, record
            ),
            FlawKind::DanglingDataPointer { data_section_len } => write!(
                f,
                "{}: beyond the {} byte data section",
                self.location, data_section_len
            ),
            FlawKind::DataDecodingFailed { reason } => {
                write!(f, "{}: failed to decode: {}", self.location, reason)
            }
            FlawKind::UnreachableNodes { count } => {
                write!(f, "{}: {} unreachable nodes", self.location, count)
            }
        }
    }
}

/// Analyze a snapshot, returning every flaw found
pub fn analyze(db: &Database) -> Result<(), Vec<Flaw>> {
    let metadata = db.metadata();
    let mut flaws = Vec::new();

    check_layout(db, &mut flaws);
    let data_offsets = walk_tree(db, &mut flaws);

    let mut data_offsets: Vec<u32> = data_offsets.into_iter().collect();
    data_offsets.sort_unstable();
    debug!(
        nodes = metadata.node_count,
        records = data_offsets.len(),
        "decoding reachable data records"
    );

    let decoder = db.decoder();
    let decode_flaws: Vec<Flaw> = data_offsets
        .par_iter()
        .filter_map(|&offset| {
            decoder.decode(offset as usize).err().map(|e| Flaw {
                kind: FlawKind::DataDecodingFailed {
                    reason: e.to_string(),
                },
                location: Location::DataOffset(offset),
            })
        })
        .collect();
    flaws.extend(decode_flaws);

    if flaws.is_empty() {
        Ok(())
    } else {
        Err(flaws)
    }
}

fn check_layout(db: &Database, flaws: &mut Vec<Flaw>) {
    let metadata = db.metadata();
    let expected = metadata.search_tree_size + DATA_SECTION_SEPARATOR_SIZE;

    if expected > metadata.metadata_start {
        flaws.push(Flaw {
            kind: FlawKind::TreeSizeMismatch {
                expected,
                available: metadata.metadata_start,
            },
            location: Location::Tree,
        });
        return;
    }

    let separator = &db.bytes()[metadata.search_tree_size..expected];
    if separator.iter().any(|&b| b != 0) {
        flaws.push(Flaw {
            kind: FlawKind::SeparatorNotZeroed,
            location: Location::Tree,
        });
    }
}

/// Walk every reachable node; returns the data offsets of valid terminals
///
/// A node is revisited when it is reached deeper than before, so the
/// depth limit is checked along every path. Record flaws are reported on
/// the first visit only.
fn walk_tree(db: &Database, flaws: &mut Vec<Flaw>) -> FxHashSet<u32> {
    let tree = db.tree();
    let node_count = tree.node_count();
    let width = db.metadata().ip_version.bit_width();
    let data_len = db.data_section().len();

    let mut data_offsets = FxHashSet::default();
    if node_count == 0 {
        return data_offsets;
    }

    // Deepest depth each node was reached at; UNSEEN until first reached
    const UNSEEN: u8 = u8::MAX;
    let mut deepest = vec![UNSEEN; node_count as usize];
    let mut checked = vec![false; node_count as usize];
    let mut visited_count = 1u32;
    deepest[0] = 0;
    let mut stack = vec![(0u32, 0u8)];

    while let Some((node, depth)) = stack.pop() {
        // Stale entry, the node was pushed again deeper
        if depth != deepest[node as usize] {
            continue;
        }
        let first_visit = !std::mem::replace(&mut checked[node as usize], true);
        for bit in 0..2u8 {
            let location = Location::Node {
                index: node,
                side: Side::from_bit(bit),
            };
            let record = match tree.read_record(node, bit) {
                Ok(record) => record,
                Err(e) => {
                    if first_visit {
                        flaws.push(Flaw {
                            kind: FlawKind::DataDecodingFailed {
                                reason: e.to_string(),
                            },
                            location,
                        });
                    }
                    continue;
                }
            };

            match tree.classify(record) {
                Record::Node(child) if child == node => {
                    if first_visit {
                        flaws.push(Flaw {
                            kind: FlawKind::SelfReferencingNode,
                            location,
                        });
                    }
                }
                Record::Node(_) if depth + 1 >= width => flaws.push(Flaw {
                    kind: FlawKind::TreeTooDeep,
                    location,
                }),
                Record::Node(child) => {
                    let seen = deepest[child as usize];
                    if seen == UNSEEN {
                        deepest[child as usize] = depth + 1;
                        visited_count += 1;
                        stack.push((child, depth + 1));
                    } else if depth + 1 > seen {
                        deepest[child as usize] = depth + 1;
                        stack.push((child, depth + 1));
                    }
                }
                Record::Empty => {}
                Record::Separator(record) => {
                    if first_visit {
                        flaws.push(Flaw {
                            kind: FlawKind::InvalidDataPointer { record },
                            location,
                        });
                    }
                }
                Record::Data(offset) if offset as usize >= data_len => {
                    if first_visit {
                        flaws.push(Flaw {
                            kind: FlawKind::DanglingDataPointer {
                                data_section_len: data_len,
                            },
                            location,
                        });
                    }
                }
                Record::Data(offset) => {
                    data_offsets.insert(offset);
                }
            }
        }
    }

    if visited_count < node_count {
        flaws.push(Flaw {
            kind: FlawKind::UnreachableNodes {
                count: node_count - visited_count,
            },
            location: Location::Tree,
        });
    }

    data_offsets
}
