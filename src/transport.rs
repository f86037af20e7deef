//! Remote fetching
//!
//! Loaders fetch through the [`Transport`] trait so that tests, proxies or
//! custom clients can stand in for the default blocking HTTP client.

use reqwest::header::{HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Transport errors
#[derive(Debug, Error)]
pub enum FetchError {
    /// Request could not be sent or the body could not be read
    #[error("HTTP request failed: {0}")]
    Http(String),
    /// Server answered with a non-success status
    #[error("Unexpected HTTP status {status}")]
    Status {
        /// Status code
        status: u16,
    },
    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cache validators from a previous response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
    /// `ETag` header
    pub etag: Option<String>,
    /// `Last-Modified` header
    pub last_modified: Option<String>,
}

impl Validators {
    /// True when there is nothing to make a request conditional on
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Result of a conditional fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The resource did not change since the validators were issued
    NotModified,
    /// New content
    Fetched {
        /// Response body, possibly compressed or archived
        body: Vec<u8>,
        /// Validators of this response
        validators: Validators,
    },
}

/// Conditional GET capability
pub trait Transport: Send + Sync + fmt::Debug {
    /// Fetch `url`, sending `If-None-Match` / `If-Modified-Since` from `validators`
    fn fetch(&self, url: &Url, validators: &Validators) -> Result<FetchOutcome, FetchError>;
}

/// Blocking HTTP transport built on reqwest
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Create a transport with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ipatlas/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, url: &Url, validators: &Validators) -> Result<FetchOutcome, FetchError> {
        let mut request = self.client.get(url.clone());
        if let Some(etag) = &validators.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &validators.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = request
            .send()
            .map_err(|e| FetchError::Http(e.without_url().to_string()))?;
        let status = response.status();
        debug!(status = status.as_u16(), "fetch response");

        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let validators = Validators {
            etag: header(ETAG),
            last_modified: header(LAST_MODIFIED),
        };

        let body = response
            .bytes()
            .map_err(|e| FetchError::Http(e.without_url().to_string()))?;
        Ok(FetchOutcome::Fetched {
            body: body.to_vec(),
            validators,
        })
    }
}
