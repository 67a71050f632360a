//! Values returned by the caching client

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::config::TextEncoding;
use crate::error::{Error, Result};

/// Freshness validators of a cached resource
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Metadata {
    /// `Last-Modified` reported by the origin
    pub last_modified: Option<DateTime<Utc>>,
    /// `ETag` reported by the origin
    pub etag: Option<String>,
}

impl Metadata {
    /// `Last-Modified`, or [`Error::MissingMetadata`] if the origin omitted it
    pub fn require_last_modified(&self) -> Result<DateTime<Utc>> {
        self.last_modified
            .ok_or_else(|| Error::missing_metadata("lastModified"))
    }

    /// `ETag`, or [`Error::MissingMetadata`] if the origin omitted it
    pub fn require_etag(&self) -> Result<&str> {
        self.etag
            .as_deref()
            .ok_or_else(|| Error::missing_metadata("eTag"))
    }
}

/// Where a [`Response`] body came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Served from disk without a request, or after a `304`
    Cache,
    /// Downloaded and written to disk during this call
    Network,
}

/// A cached or freshly fetched body together with its validators
#[derive(Debug, Clone)]
pub struct Response {
    metadata: Metadata,
    body: Bytes,
    encoding: TextEncoding,
    source: ResponseSource,
}

impl Response {
    pub(crate) fn new(
        metadata: Metadata,
        body: Bytes,
        encoding: TextEncoding,
        source: ResponseSource,
    ) -> Self {
        Self {
            metadata,
            body,
            encoding,
            source,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.metadata.last_modified
    }

    pub fn etag(&self) -> Option<&str> {
        self.metadata.etag.as_deref()
    }

    /// Raw body bytes
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Consume the response, keeping only the body
    pub fn into_bytes(self) -> Bytes {
        self.body
    }

    /// Body decoded with the client's configured text encoding
    pub fn text(&self) -> Result<String> {
        self.encoding.decode(&self.body)
    }

    /// Body parsed as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        match self.encoding {
            TextEncoding::Utf8 => Ok(serde_json::from_slice(&self.body)?),
            TextEncoding::Latin1 => Ok(serde_json::from_str(&self.text()?)?),
        }
    }

    pub fn source(&self) -> ResponseSource {
        self.source
    }

    /// Whether the body was served without downloading it again
    pub fn is_from_cache(&self) -> bool {
        self.source == ResponseSource::Cache
    }
}
