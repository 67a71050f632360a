//! Error types for the caching HTTP client

use reqwest::StatusCode;
use thiserror::Error;

/// Result type for metabolism-http operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for cache and fetch operations
#[derive(Debug, Error)]
pub enum Error {
    /// The cache key contains a NUL byte or resolves outside the cache root
    #[error("Invalid cache key '{key}': {reason}")]
    InvalidKey {
        /// The rejected key
        key: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// Local filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed at the transport level
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport failure reported by a non-reqwest transport
    #[error("Network error: {0}")]
    Network(#[source] std::io::Error),

    /// The origin answered with a 5xx status
    #[error("Server error {status} for '{url}'")]
    ServerError {
        /// Requested URL
        url: String,
        /// Response status
        status: StatusCode,
    },

    /// The origin answered with a status that cannot be used (4xx, 204, ...)
    #[error("Got {status} while trying to fetch '{url}'")]
    UnexpectedStatus {
        /// Requested URL
        url: String,
        /// Response status
        status: StatusCode,
    },

    /// All retry attempts were used up
    #[error("Giving up on '{what}' after {attempts} attempts: {source}")]
    FetchFailed {
        /// What was being fetched
        what: String,
        /// Number of attempts made
        attempts: u32,
        /// Last underlying failure
        #[source]
        source: Box<Self>,
    },

    /// A response header could not be parsed
    #[error("Invalid {name} header: '{value}'")]
    InvalidHeader {
        /// Header name
        name: &'static str,
        /// Raw header value
        value: String,
    },

    /// The origin did not provide metadata the caller requires
    #[error("Missing required metadata: {field}")]
    MissingMetadata {
        /// Name of the missing field
        field: &'static str,
    },

    /// The named entry does not exist in a remote archive
    #[error("Entry '{entry}' not found in '{url}'")]
    ZipEntryNotFound {
        /// Archive URL
        url: String,
        /// Requested entry name
        entry: String,
    },

    /// The remote archive is malformed or uses unsupported features
    #[error("Invalid archive: {0}")]
    InvalidArchive(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A body could not be decoded with the configured text encoding
    #[error("Text decoding error: {0}")]
    Decode(String),

    /// An expected digest could not be parsed
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// Client configuration is inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create an invalid key error
    pub fn invalid_key(key: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason,
        }
    }

    /// Create an unexpected status error
    pub fn unexpected_status(url: impl Into<String>, status: StatusCode) -> Self {
        Self::UnexpectedStatus {
            url: url.into(),
            status,
        }
    }

    /// Create a missing metadata error
    pub fn missing_metadata(field: &'static str) -> Self {
        Self::MissingMetadata { field }
    }

    /// Create an invalid archive error
    pub fn invalid_archive(reason: impl Into<String>) -> Self {
        Self::InvalidArchive(reason.into())
    }

    /// Check if error is retryable
    ///
    /// Only transport failures and 5xx responses are worth another attempt;
    /// a client-side outcome cannot change by asking again.
    pub fn should_retry(&self) -> bool {
        match self {
            Self::Network(_) | Self::ServerError { .. } => true,
            Self::Http(e) => e.is_connect() || e.is_timeout() || e.is_request() || e.is_body(),
            _ => false,
        }
    }

    /// HTTP status carried by this error, if any
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::ServerError { status, .. } | Self::UnexpectedStatus { status, .. } => {
                Some(*status)
            }
            Self::Http(e) => e.status(),
            Self::FetchFailed { source, .. } => source.status(),
            _ => None,
        }
    }
}
