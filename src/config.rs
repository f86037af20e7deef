//! Loader configuration
//!
//! Durations are (de)serialized as whole milliseconds so options can live
//! in JSON config files next to the rest of an application's settings.

use crate::error::{Error, Result};
use crate::event::{EventSubscriber, LoaderEvent};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable consulted when no license key is configured
pub const LICENSE_KEY_ENV: &str = "MAXMIND_LICENSE_KEY";

const DEFAULT_REMOTE_REFRESH: Duration = Duration::from_secs(6 * 60 * 60);
const DEFAULT_FILESYSTEM_REFRESH: Duration = Duration::from_secs(30);
const DEFAULT_PRE_READINESS_RETRY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RETRY_BACKOFF: Duration = Duration::from_secs(15 * 60);
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// What lookups do while a database has never been published
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PreReadiness {
    /// Fail immediately with `DatabaseNotLoaded`
    #[default]
    Fail,
    /// Wait for the first publication, at most `timeout`
    Block {
        /// Longest a lookup waits
        #[serde(with = "duration_ms")]
        timeout: Duration,
    },
}

/// Options for one loader
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderOptions {
    /// Directory for cached downloads
    pub cache_dir: PathBuf,
    /// Never read or write the cache
    pub no_cache: bool,
    /// Refresh period once ready; `None` picks a default per origin kind
    #[serde(with = "duration_ms::option")]
    pub refresh_interval: Option<Duration>,
    /// First retry delay after a failure, doubled per consecutive failure
    #[serde(with = "duration_ms")]
    pub pre_readiness_retry: Duration,
    /// Ceiling for the retry delay
    #[serde(with = "duration_ms")]
    pub max_retry_backoff: Duration,
    /// Lookup behavior before the first publication
    pub pre_readiness: PreReadiness,
    /// MaxMind license key for edition downloads
    pub license_key: Option<String>,
    /// Refresh filesystem origins as soon as the file changes
    pub watch_filesystem: bool,
    /// Per-request timeout of the default HTTP transport
    #[serde(with = "duration_ms")]
    pub http_timeout: Duration,
    /// Receives every loader event
    #[serde(skip)]
    pub event_subscriber: Option<EventSubscriber>,
    /// Replaces the default HTTP transport
    #[serde(skip)]
    pub transport: Option<Arc<dyn Transport>>,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            no_cache: false,
            refresh_interval: None,
            pre_readiness_retry: DEFAULT_PRE_READINESS_RETRY,
            max_retry_backoff: DEFAULT_MAX_RETRY_BACKOFF,
            pre_readiness: PreReadiness::Fail,
            license_key: None,
            watch_filesystem: true,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            event_subscriber: None,
            transport: None,
        }
    }
}

impl fmt::Debug for LoaderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderOptions")
            .field("cache_dir", &self.cache_dir)
            .field("no_cache", &self.no_cache)
            .field("refresh_interval", &self.refresh_interval)
            .field("pre_readiness_retry", &self.pre_readiness_retry)
            .field("max_retry_backoff", &self.max_retry_backoff)
            .field("pre_readiness", &self.pre_readiness)
            .field("license_key", &self.license_key.as_ref().map(|_| "<redacted>"))
            .field("watch_filesystem", &self.watch_filesystem)
            .field("http_timeout", &self.http_timeout)
            .field("event_subscriber", &self.event_subscriber.is_some())
            .field("transport", &self.transport)
            .finish()
    }
}

impl LoaderOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `dir` for cached downloads
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Disable the download cache
    pub fn without_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    /// Refresh every `interval` once ready
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    /// First retry delay after a failure
    pub fn with_pre_readiness_retry(mut self, delay: Duration) -> Self {
        self.pre_readiness_retry = delay;
        self
    }

    /// Ceiling for the retry delay
    pub fn with_max_retry_backoff(mut self, ceiling: Duration) -> Self {
        self.max_retry_backoff = ceiling;
        self
    }

    /// Lookup behavior before the first publication
    pub fn with_pre_readiness(mut self, policy: PreReadiness) -> Self {
        self.pre_readiness = policy;
        self
    }

    /// License key for edition downloads
    pub fn with_license_key(mut self, key: impl Into<String>) -> Self {
        self.license_key = Some(key.into());
        self
    }

    /// Enable or disable the filesystem watcher
    pub fn with_watch_filesystem(mut self, watch: bool) -> Self {
        self.watch_filesystem = watch;
        self
    }

    /// Request timeout of the default HTTP transport
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Deliver loader events to `subscriber`
    pub fn with_event_subscriber<F>(mut self, subscriber: F) -> Self
    where
        F: Fn(&LoaderEvent) + Send + Sync + 'static,
    {
        self.event_subscriber = Some(Arc::new(subscriber));
        self
    }

    /// Fetch remote origins through `transport`
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Check the options for values a loader cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval == Some(Duration::ZERO) {
            return Err(Error::invalid_option("refresh_interval must be positive"));
        }
        if self.pre_readiness_retry.is_zero() {
            return Err(Error::invalid_option("pre_readiness_retry must be positive"));
        }
        if self.pre_readiness_retry > self.max_retry_backoff {
            return Err(Error::invalid_option(format!(
                "pre_readiness_retry ({:?}) exceeds max_retry_backoff ({:?})",
                self.pre_readiness_retry, self.max_retry_backoff
            )));
        }
        if let PreReadiness::Block { timeout } = self.pre_readiness {
            if timeout.is_zero() {
                return Err(Error::invalid_option(
                    "blocking pre-readiness needs a positive timeout",
                ));
            }
        }
        if self.license_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            return Err(Error::invalid_option("license_key is empty"));
        }
        if self.cache_dir.as_os_str().is_empty() && !self.no_cache {
            return Err(Error::invalid_option("cache_dir is empty"));
        }
        Ok(())
    }

    /// Refresh period for a remote or filesystem origin
    pub fn refresh_interval_for(&self, remote: bool) -> Duration {
        self.refresh_interval.unwrap_or(if remote {
            DEFAULT_REMOTE_REFRESH
        } else {
            DEFAULT_FILESYSTEM_REFRESH
        })
    }

    /// Configured license key, else the environment's
    pub fn effective_license_key(&self) -> Option<String> {
        self.license_key.clone().or_else(|| {
            std::env::var(LICENSE_KEY_ENV)
                .ok()
                .filter(|k| !k.trim().is_empty())
        })
    }

    /// Delay before the next attempt after `failures` consecutive failures
    ///
    /// `pre_readiness_retry * 2^(failures - 1)`, capped at `max_retry_backoff`.
    pub fn retry_delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.pre_readiness_retry
            .checked_mul(factor)
            .unwrap_or(self.max_retry_backoff)
            .min(self.max_retry_backoff)
    }
}

/// `$XDG_CACHE_HOME/ipatlas`, `$HOME/.cache/ipatlas`, or `<tmp>/ipatlas`
pub fn default_cache_dir() -> PathBuf {
    let from_env = |name: &str| {
        std::env::var_os(name)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    };
    if let Some(xdg) = from_env("XDG_CACHE_HOME") {
        return xdg.join("ipatlas");
    }
    if let Some(home) = from_env("HOME") {
        return home.join(".cache").join("ipatlas");
    }
    std::env::temp_dir().join("ipatlas")
}

/// Serde helper: `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as milliseconds
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64)
    }

    /// Deserialize from milliseconds
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }

    /// Same for `Option<Duration>`
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        /// Serialize as milliseconds or null
        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => super::serialize(d, s),
                None => s.serialize_none(),
            }
        }

        /// Deserialize from milliseconds or null
        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
        }
    }
}
