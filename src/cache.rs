//! On-disk cache of the last fetched database per (id, origin)
//!
//! Each cached database is a pair of files in the cache directory:
//!
//! ```text
//! {id}-{xxh64(origin)}.mmdb   extracted database bytes
//! {id}-{xxh64(origin)}.json   manifest: origin, validators, fetch time
//! ```
//!
//! Both are written to a temporary file first and then renamed, so a
//! crash mid-write never leaves a truncated file behind under the real
//! name. The manifest is written after the database, so a manifest always
//! describes complete bytes.

use crate::origin::Origin;
use crate::transport::Validators;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use xxhash_rust::xxh64::xxh64;

/// Cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// File system failure
    #[error("Cache I/O error: {0}")]
    Io(#[from] io::Error),
    /// Manifest that is not valid JSON
    #[error("Cache manifest is corrupt: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// What is known about a cached database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheManifest {
    /// Origin the bytes were fetched from
    pub origin: String,
    /// `ETag` of the response
    pub etag: Option<String>,
    /// `Last-Modified` of the response
    pub last_modified: Option<String>,
    /// When the bytes were fetched; used as the snapshot version
    pub fetched_at: SystemTime,
}

impl CacheManifest {
    /// Validators for a conditional request
    pub fn validators(&self) -> Validators {
        Validators {
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
        }
    }
}

/// Cache slot for one (id, origin) pair
#[derive(Debug, Clone)]
pub struct Cache {
    database_path: PathBuf,
    manifest_path: PathBuf,
}

impl Cache {
    /// Cache slot for `id` loading from `origin` inside `dir`
    pub fn new(dir: &Path, id: &str, origin: &Origin) -> Self {
        let stem = format!(
            "{}-{:016x}",
            sanitize(id),
            xxh64(origin.to_string().as_bytes(), 0)
        );
        Self {
            database_path: dir.join(format!("{}.mmdb", stem)),
            manifest_path: dir.join(format!("{}.json", stem)),
        }
    }

    /// Path of the cached database file
    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    /// Read the cached database and its manifest, if both exist
    pub fn load(&self) -> Result<Option<(Vec<u8>, CacheManifest)>, CacheError> {
        let manifest = match fs::read(&self.manifest_path) {
            Ok(bytes) => serde_json::from_slice::<CacheManifest>(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match fs::read(&self.database_path) {
            Ok(bytes) => Ok(Some((bytes, manifest))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store database bytes and their manifest
    pub fn store(&self, database: &[u8], manifest: &CacheManifest) -> Result<(), CacheError> {
        if let Some(dir) = self.database_path.parent() {
            fs::create_dir_all(dir)?;
        }
        write_atomic(&self.database_path, database)?;
        write_atomic(&self.manifest_path, &serde_json::to_vec_pretty(manifest)?)?;
        Ok(())
    }
}

/// Write to `{path}.tmp`, sync, then rename over `path`
fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest() -> CacheManifest {
        CacheManifest {
            origin: "edition:GeoLite2-City".into(),
            etag: Some("\"v1\"".into()),
            last_modified: Some("Tue, 01 Oct 2024 00:00:00 GMT".into()),
            fetched_at: SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000),
        }
    }

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let origin = Origin::MaxMindEdition("GeoLite2-City".into());
        let cache = Cache::new(&dir.path().join("nested"), "city", &origin);

        assert!(cache.load().unwrap().is_none());
        cache.store(b"database bytes", &manifest()).unwrap();

        let (bytes, loaded) = cache.load().unwrap().unwrap();
        assert_eq!(bytes, b"database bytes");
        assert_eq!(loaded, manifest());
        assert_eq!(loaded.validators().etag.as_deref(), Some("\"v1\""));

        // No temporary files left behind
        let names: Vec<_> = fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "{:?}", names);
    }

    #[test]
    fn test_key_depends_on_id_and_origin() {
        let dir = Path::new("/cache");
        let a = Origin::MaxMindEdition("GeoLite2-City".into());
        let b = Origin::MaxMindEdition("GeoLite2-ASN".into());

        assert_ne!(
            Cache::new(dir, "geo", &a).database_path(),
            Cache::new(dir, "geo", &b).database_path()
        );
        assert_ne!(
            Cache::new(dir, "one", &a).database_path(),
            Cache::new(dir, "two", &a).database_path()
        );
        let path = Cache::new(dir, "we/ird id", &a);
        let name = path.database_path().file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("we_ird_id-"));
        assert!(name.ends_with(".mmdb"));
    }

    #[test]
    fn test_corrupt_manifest() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(dir.path(), "x", &Origin::MaxMindEdition("E".into()));
        cache.store(b"bytes", &manifest()).unwrap();
        fs::write(&cache.manifest_path, b"{not json").unwrap();
        assert!(matches!(cache.load(), Err(CacheError::Manifest(_))));
    }
}
