//! Database origins
//!
//! An origin says where a loader gets its bytes: a named MaxMind edition,
//! an http(s) URL, or an absolute filesystem path.

use crate::error::{Error, Result};
use reqwest::Url;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

/// Base of the MaxMind download service used for editions
pub const EDITION_DOWNLOAD_URL: &str = "https://download.maxmind.com/app/geoip_download";

const LEGACY_HOST: &str = "geolite.maxmind.com";
const LEGACY_PATH_PREFIX: &str = "/download/geoip/database/";

/// Editions that used to be published at the discontinued legacy URLs
const LEGACY_EDITIONS: [&str; 3] = ["GeoLite2-Country", "GeoLite2-City", "GeoLite2-ASN"];

/// Where database bytes come from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Named edition on the MaxMind download service
    MaxMindEdition(String),
    /// Arbitrary http(s) URL
    HttpUrl(Url),
    /// Absolute path on the local filesystem
    FilesystemPath(PathBuf),
}

impl Origin {
    /// Parse an origin
    ///
    /// - `http://` and `https://` URLs (legacy GeoLite2 URLs become editions)
    /// - `file://` URLs and absolute paths
    /// - edition names such as `GeoLite2-City`
    ///
    /// Anything else, including relative paths, is [`Error::InvalidUrl`].
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::invalid_url("empty origin"));
        }

        if let Some(edition) = legacy_edition(input) {
            return Ok(Origin::MaxMindEdition(edition.to_string()));
        }

        if input.contains("://") {
            let url = Url::parse(input).map_err(|e| Error::invalid_url(format!("{}: {}", input, e)))?;
            return match url.scheme() {
                "http" | "https" if url.host_str().is_some() => Ok(Origin::HttpUrl(url)),
                "file" => url
                    .to_file_path()
                    .map(Origin::FilesystemPath)
                    .map_err(|_| Error::invalid_url(format!("{}: not a local file URL", input))),
                _ => Err(Error::invalid_url(format!(
                    "{}: unsupported scheme '{}'",
                    input,
                    url.scheme()
                ))),
            };
        }

        let path = Path::new(input);
        if path.is_absolute() {
            return Ok(Origin::FilesystemPath(path.to_path_buf()));
        }

        if is_edition_name(input) {
            return Ok(Origin::MaxMindEdition(input.to_string()));
        }

        Err(Error::invalid_url(format!(
            "{}: expected an edition name, an http(s) URL or an absolute path",
            input
        )))
    }

    /// True for origins fetched over the network
    pub fn is_remote(&self) -> bool {
        !matches!(self, Origin::FilesystemPath(_))
    }

    /// URL to fetch, or `None` for filesystem origins
    ///
    /// Editions need a license key; without one this is [`Error::InvalidOption`].
    pub fn download_url(&self, license_key: Option<&str>) -> Result<Option<Url>> {
        match self {
            Origin::FilesystemPath(_) => Ok(None),
            Origin::HttpUrl(url) => Ok(Some(url.clone())),
            Origin::MaxMindEdition(edition) => {
                let key = license_key.ok_or_else(|| {
                    Error::invalid_option(format!(
                        "edition {} requires a license key (option or MAXMIND_LICENSE_KEY)",
                        edition
                    ))
                })?;
                let url = Url::parse_with_params(
                    EDITION_DOWNLOAD_URL,
                    &[
                        ("edition_id", edition.as_str()),
                        ("license_key", key),
                        ("suffix", "tar.gz"),
                    ],
                )
                .map_err(|e| Error::invalid_url(e.to_string()))?;
                Ok(Some(url))
            }
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::MaxMindEdition(edition) => write!(f, "edition:{}", edition),
            Origin::HttpUrl(url) => write!(f, "{}", url),
            Origin::FilesystemPath(path) => write!(f, "{}", path.display()),
        }
    }
}

fn is_edition_name(input: &str) -> bool {
    input
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Edition a discontinued GeoLite2 download URL maps to
pub fn legacy_edition(input: &str) -> Option<&'static str> {
    let url = Url::parse(input.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str() != Some(LEGACY_HOST) {
        return None;
    }
    let file = url.path().strip_prefix(LEGACY_PATH_PREFIX)?;
    LEGACY_EDITIONS
        .iter()
        .find(|edition| file == format!("{}.tar.gz", edition))
        .copied()
}

/// Record that a legacy URL was rewritten; true only the first time per process
pub(crate) fn first_legacy_rewrite(url: &str) -> bool {
    static SEEN: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    let seen = SEEN.get_or_init(|| Mutex::new(HashSet::new()));
    let mut seen = seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    seen.insert(url.to_string())
}

/// URL text safe for logs: the license key query value is masked
pub fn redact(url: &Url) -> String {
    if !url.query_pairs().any(|(k, _)| k == "license_key") {
        return url.to_string();
    }
    let mut redacted = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "license_key" { "REDACTED".into() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}
