//! Configuration structures for the caching client

use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// User-Agent sent when none is configured
pub const DEFAULT_USER_AGENT: &str = concat!("metabolism/", env!("CARGO_PKG_VERSION"));

/// Default bound on concurrently in-flight outbound requests
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 16;

/// Encoding used to turn cached bodies into text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    /// UTF-8; invalid sequences are an error
    #[default]
    Utf8,
    /// ISO-8859-1; every byte maps to the code point of the same value
    Latin1,
}

impl TextEncoding {
    /// Decode raw body bytes into a string
    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            Self::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|e| Error::Decode(e.to_string())),
            Self::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }
}

impl FromStr for TextEncoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "latin1" | "latin-1" | "iso-8859-1" => Ok(Self::Latin1),
            other => Err(Error::InvalidConfig(format!("unknown text encoding '{other}'"))),
        }
    }
}

/// Configuration for [`CachedHttpClient`](crate::CachedHttpClient)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Root directory every cache key is resolved under
    pub cache_dir: PathBuf,

    /// Value of the User-Agent header on every request
    pub user_agent: String,

    /// Return any cached body without contacting the origin
    pub assume_up_to_date: bool,

    /// Encoding used for text and JSON accessors
    pub encoding: TextEncoding,

    /// Maximum number of outbound requests in flight at once
    pub max_concurrent_requests: usize,

    /// Retry policy for transient failures
    pub retry_policy: RetryPolicy,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Request timeout
    pub request_timeout: Duration,

    /// Drop per-key locks from the registry once nobody holds or waits on them
    pub evict_idle_locks: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            assume_up_to_date: false,
            encoding: TextEncoding::Utf8,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            retry_policy: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            evict_idle_locks: true,
        }
    }
}

impl ClientConfig {
    /// Create a configuration rooted at `cache_dir` with default settings
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Unset or unparsable variables fall back to their defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let encoding = match std::env::var("METABOLISM_ENCODING") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.encoding,
        };

        let config = Self {
            cache_dir: std::env::var_os("METABOLISM_CACHE_DIR")
                .map_or(defaults.cache_dir, PathBuf::from),
            user_agent: std::env::var("METABOLISM_USER_AGENT").unwrap_or(defaults.user_agent),
            assume_up_to_date: env_var("METABOLISM_ASSUME_UP_TO_DATE")
                .unwrap_or(defaults.assume_up_to_date),
            encoding,
            max_concurrent_requests: env_var("METABOLISM_MAX_CONCURRENT_REQUESTS")
                .unwrap_or(defaults.max_concurrent_requests),
            retry_policy: RetryPolicy::from_env(),
            connect_timeout: env_var("METABOLISM_CONNECT_TIMEOUT")
                .map_or(defaults.connect_timeout, Duration::from_secs),
            request_timeout: env_var("METABOLISM_REQUEST_TIMEOUT")
                .map_or(defaults.request_timeout, Duration::from_secs),
            evict_idle_locks: env_var("METABOLISM_EVICT_IDLE_LOCKS")
                .unwrap_or(defaults.evict_idle_locks),
        };

        config.validate()?;
        Ok(config)
    }

    /// Set the cache root directory
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    /// Set the User-Agent header value
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Always trust cached bodies
    pub fn with_assume_up_to_date(mut self, assume_up_to_date: bool) -> Self {
        self.assume_up_to_date = assume_up_to_date;
        self
    }

    /// Set the text encoding
    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the outbound concurrency limit
    pub fn with_max_concurrent_requests(mut self, max_concurrent_requests: usize) -> Self {
        self.max_concurrent_requests = max_concurrent_requests;
        self
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Set the connection timeout
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Keep or evict idle per-key locks
    pub fn with_evict_idle_locks(mut self, evict_idle_locks: bool) -> Self {
        self.evict_idle_locks = evict_idle_locks;
        self
    }

    /// Cache root directory
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Check the configuration for values the client cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("cache directory is empty".to_string()));
        }

        if self.max_concurrent_requests == 0 {
            return Err(Error::InvalidConfig(
                "max_concurrent_requests must be at least 1".to_string(),
            ));
        }

        if HeaderValue::from_str(&self.user_agent).is_err() {
            return Err(Error::InvalidConfig(format!(
                "user agent '{}' is not a valid header value",
                self.user_agent
            )));
        }

        if self.request_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "request timeout must be non-zero".to_string(),
            ));
        }

        self.retry_policy.validate()
    }
}

/// Default cache root: `<platform cache dir>/metabolism`, or `run/cache`
/// when the platform has no cache directory.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir().map_or_else(|| PathBuf::from("run/cache"), |dir| dir.join("metabolism"))
}

pub(crate) fn env_var<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}
