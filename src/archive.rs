//! Payload extraction
//!
//! Downloads come as raw `.mmdb`, gzip-compressed `.mmdb`, or `.tar.gz`
//! archives holding the database next to license files. This module
//! turns any of those into the bare database bytes.

use flate2::read::GzDecoder;
use std::io::{Cursor, Read};
use thiserror::Error;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8] = b"ustar";

/// Largest database accepted from an archive or gzip stream
pub const MAX_DATABASE_SIZE: u64 = 4 << 30;

/// Archive extraction errors
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Decompression or tar read failure
    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Tar archive without any `.mmdb` member
    #[error("Archive contains no .mmdb file")]
    NoDatabase,
    /// Decompressed or declared size above the limit
    #[error("Database exceeds {limit} bytes")]
    TooLarge {
        /// Limit in bytes
        limit: u64,
    },
    /// Tar entry declares more bytes than the archive holds
    #[error("Tar entry declares {declared} bytes but only {available} are present")]
    Truncated {
        /// Size from the entry header
        declared: u64,
        /// Bytes in the whole archive
        available: u64,
    },
}

/// Extract database bytes from a downloaded or on-disk payload
pub fn extract_database(payload: Vec<u8>) -> Result<Vec<u8>, ArchiveError> {
    extract_with_limit(payload, MAX_DATABASE_SIZE)
}

fn extract_with_limit(payload: Vec<u8>, limit: u64) -> Result<Vec<u8>, ArchiveError> {
    let payload = if payload.starts_with(&GZIP_MAGIC) {
        let mut decompressed = Vec::new();
        // One byte past the limit tells "exactly at" from "over"
        GzDecoder::new(payload.as_slice())
            .take(limit.saturating_add(1))
            .read_to_end(&mut decompressed)?;
        if decompressed.len() as u64 > limit {
            return Err(ArchiveError::TooLarge { limit });
        }
        decompressed
    } else {
        payload
    };

    if is_tar(&payload) {
        return extract_from_tar(&payload, limit);
    }
    Ok(payload)
}

fn is_tar(bytes: &[u8]) -> bool {
    bytes
        .get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len())
        .is_some_and(|magic| magic == TAR_MAGIC)
}

/// First regular file whose name ends in `.mmdb`
fn extract_from_tar(bytes: &[u8], limit: u64) -> Result<Vec<u8>, ArchiveError> {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let is_mmdb = entry
            .path()?
            .extension()
            .is_some_and(|ext| ext == "mmdb");
        if is_mmdb {
            let declared = entry.size();
            if declared > limit {
                return Err(ArchiveError::TooLarge { limit });
            }
            let available = bytes.len() as u64;
            if declared > available {
                return Err(ArchiveError::Truncated {
                    declared,
                    available,
                });
            }
            let mut database = Vec::with_capacity(declared as usize);
            entry.take(declared).read_to_end(&mut database)?;
            if (database.len() as u64) < declared {
                return Err(ArchiveError::Truncated {
                    declared,
                    available: database.len() as u64,
                });
            }
            return Ok(database);
        }
    }
    Err(ArchiveError::NoDatabase)
}
