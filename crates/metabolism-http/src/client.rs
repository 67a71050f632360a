//! Disk-backed caching HTTP client
//!
//! Every operation on a cache key runs under that key's lock, so concurrent
//! callers asking for the same resource are served one after another: the
//! first one downloads, the rest find a fresh entry on disk.
//!
//! # Example
//!
//! ```no_run
//! use metabolism_http::{CachedHttpClient, ClientConfig, StalenessStrategy};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = CachedHttpClient::new(ClientConfig::new("run/cache/mojang"))?;
//!
//! let manifest: serde_json::Value = client
//!     .fetch_json(
//!         "version_manifest_v2.json",
//!         "https://piston-meta.mojang.com/mc/game/version_manifest_v2.json",
//!         &StalenessStrategy::ConditionalRequest,
//!     )
//!     .await?;
//! println!("latest release: {}", manifest["latest"]["release"]);
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

use crate::config::ClientConfig;
use crate::digest::DigestAlgorithm;
use crate::error::{Error, Result};
use crate::executor::{RequestExecutor, is_ok_with_body};
use crate::lock::KeyLockRegistry;
use crate::response::{Metadata, Response, ResponseSource};
use crate::stats::{ClientStats, ClientStatsSnapshot};
use crate::store::{CacheEntry, EntryStore};
use crate::strategy::StalenessStrategy;
use crate::transport::{HttpRequest, HttpResponse, Transport};
use crate::zip::RemoteZip;

/// Format used for `If-Modified-Since`
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Caching HTTP client rooted at one cache directory
#[derive(Debug)]
pub struct CachedHttpClient {
    config: ClientConfig,
    store: EntryStore,
    locks: KeyLockRegistry,
    executor: RequestExecutor,
    stats: ClientStats,
}

impl CachedHttpClient {
    /// Create a client that talks HTTP through reqwest
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let executor = RequestExecutor::from_config(&config)?;
        Self::with_executor(config, executor)
    }

    /// Create a client from `METABOLISM_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Create a client that sends requests through `transport`
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let executor = RequestExecutor::new(
            transport,
            config.max_concurrent_requests,
            config.retry_policy.clone(),
        )?;
        Self::with_executor(config, executor)
    }

    /// Create a client sharing `executor` with other clients.
    ///
    /// All clients built from clones of one executor share its request limit
    /// and retry policy; `config.max_concurrent_requests` and
    /// `config.retry_policy` are ignored.
    pub fn with_executor(config: ClientConfig, executor: RequestExecutor) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            store: EntryStore::new(config.cache_dir.clone()),
            locks: KeyLockRegistry::new(config.evict_idle_locks),
            executor,
            stats: ClientStats::new(),
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &EntryStore {
        &self.store
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    pub fn lock_registry(&self) -> &KeyLockRegistry {
        &self.locks
    }

    /// Snapshot of this client's counters
    pub fn stats(&self) -> ClientStatsSnapshot {
        self.stats.snapshot()
    }

    /// Fetch `url` into the cache entry `key` and return its body.
    ///
    /// `strategy` decides whether an existing body can be returned without a
    /// request, or how to revalidate it. A `304` keeps the cached entry
    /// untouched; any other successful answer replaces it.
    pub async fn fetch(
        &self,
        key: &str,
        url: &str,
        strategy: &StalenessStrategy,
    ) -> Result<Response> {
        let path = self.store.resolve(key)?;
        let _guard = self.locks.acquire(&path).await;

        let cached = self
            .store
            .read(key)
            .await?
            .and_then(|entry| entry.body.clone().map(|body| (entry, body)));

        let mut request = HttpRequest::get(url);

        if let Some((entry, body)) = &cached {
            if self.is_fresh(entry, body, strategy) {
                debug!("Cache hit for '{key}'");
                self.stats.record_hit(body.len() as u64);
                return Ok(self.response(entry, body.clone(), ResponseSource::Cache));
            }

            if matches!(strategy, StalenessStrategy::ConditionalRequest) {
                if let Some(etag) = &entry.meta.etag {
                    request = request.header(IF_NONE_MATCH, etag)?;
                } else if let Some(last_modified) = entry.meta.last_modified {
                    request = request.header(
                        IF_MODIFIED_SINCE,
                        &last_modified.format(HTTP_DATE_FORMAT).to_string(),
                    )?;
                }
            }
        }

        debug!("Fetching '{url}' for cache key '{key}'");
        let response = self.executor.execute(request).await?;

        // Only a conditional request can be answered with "not modified"
        if response.status == StatusCode::NOT_MODIFIED {
            let Some((entry, body)) =
                cached.filter(|_| matches!(strategy, StalenessStrategy::ConditionalRequest))
            else {
                return Err(Error::unexpected_status(url, response.status));
            };
            debug!("'{url}' not modified, using cached '{key}'");
            self.stats.record_revalidated(body.len() as u64);
            return Ok(self.response(&entry, body, ResponseSource::Cache));
        }

        if !is_ok_with_body(response.status) {
            return Err(Error::unexpected_status(url, response.status));
        }

        let metadata = response_metadata(&response)?;
        let body = response.body;
        let size = body.len() as u64;

        let entry = self.store.write(key, metadata, Some(body.clone())).await?;
        self.stats.record_miss(size);
        self.stats.record_write();
        debug!("Cached {size} bytes from '{url}' as '{key}'");

        Ok(self.response(&entry, body, ResponseSource::Network))
    }

    /// [`fetch`](Self::fetch) and parse the body as JSON
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        key: &str,
        url: &str,
        strategy: &StalenessStrategy,
    ) -> Result<T> {
        self.fetch(key, url, strategy).await?.json()
    }

    /// [`fetch`](Self::fetch) and decode the body as text
    pub async fn fetch_text(
        &self,
        key: &str,
        url: &str,
        strategy: &StalenessStrategy,
    ) -> Result<String> {
        self.fetch(key, url, strategy).await?.text()
    }

    /// Validators of `url`, cached under `key` without a body.
    ///
    /// Once an entry exists for `key` (with or without a body) its metadata is
    /// returned without contacting the origin again.
    pub async fn head(&self, key: &str, url: &str) -> Result<Metadata> {
        let path = self.store.resolve(key)?;
        let _guard = self.locks.acquire(&path).await;

        if let Some(entry) = self.store.read(key).await? {
            debug!("Cache hit for headers of '{key}'");
            self.stats.record_hit(0);
            return Ok(entry.meta.metadata());
        }

        debug!("Fetching headers of '{url}' for cache key '{key}'");
        let response = self.executor.execute(HttpRequest::head(url)).await?;

        if !is_ok_with_body(response.status) {
            return Err(Error::unexpected_status(url, response.status));
        }

        let metadata = response_metadata(&response)?;
        let entry = self.store.write(key, metadata, None).await?;
        self.stats.record_miss(0);
        self.stats.record_write();

        Ok(entry.meta.metadata())
    }

    /// Text of `entry_name` inside the zip archive at `url`, cached under `key`.
    ///
    /// Only the parts of the archive needed to find and read the entry are
    /// downloaded. Once cached, the entry is never fetched again.
    pub async fn fetch_zip_entry(&self, key: &str, url: &str, entry_name: &str) -> Result<String> {
        let path = self.store.resolve(key)?;
        let _guard = self.locks.acquire(&path).await;

        if let Some(body) = self.store.read(key).await?.and_then(|entry| entry.body) {
            debug!("Cache hit for '{entry_name}' from '{url}'");
            self.stats.record_hit(body.len() as u64);
            return self.config.encoding.decode(&body);
        }

        debug!("Extracting '{entry_name}' from '{url}' for cache key '{key}'");
        let contents = self
            .executor
            .retry(url, || RemoteZip::extract(self.executor.clone(), url, entry_name))
            .await?;

        let text = self.config.encoding.decode(&contents)?;
        let size = contents.len() as u64;

        self.store.write(key, Metadata::default(), Some(contents)).await?;
        self.stats.record_miss(size);
        self.stats.record_write();

        Ok(text)
    }

    fn is_fresh(&self, entry: &CacheEntry, body: &Bytes, strategy: &StalenessStrategy) -> bool {
        if self.config.assume_up_to_date {
            return true;
        }

        match strategy {
            StalenessStrategy::Eternal => true,
            StalenessStrategy::ConditionalRequest => false,
            StalenessStrategy::CompareLocalDigest {
                algorithm,
                expected,
            } => {
                let actual = match (algorithm, entry.meta.sha1) {
                    (DigestAlgorithm::Sha1, Some(sha1)) => sha1.to_vec(),
                    _ => algorithm.digest(body),
                };
                actual == *expected
            }
        }
    }

    fn response(&self, entry: &CacheEntry, body: Bytes, source: ResponseSource) -> Response {
        Response::new(entry.meta.metadata(), body, self.config.encoding, source)
    }
}

/// `Last-Modified` and `ETag` of a response
fn response_metadata(response: &HttpResponse) -> Result<Metadata> {
    let last_modified = match response.headers.get(LAST_MODIFIED) {
        None => None,
        Some(value) => {
            let text = value.to_str().map_err(|_| Error::InvalidHeader {
                name: "Last-Modified",
                value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            })?;
            Some(parse_http_date(text)?)
        }
    };

    Ok(Metadata {
        last_modified,
        etag: response.header_str(&ETAG).map(str::to_owned),
    })
}

/// Parse an HTTP date (IMF-fixdate, RFC 850 or asctime)
fn parse_http_date(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Ok(date.with_timezone(&Utc));
    }

    ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|date| date.and_utc())
        .ok_or_else(|| Error::InvalidHeader {
            name: "Last-Modified",
            value: value.to_string(),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_http_date() {
        let expected = Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap();

        assert_eq!(parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT").unwrap(), expected);
        assert_eq!(parse_http_date("Wednesday, 21-Oct-15 07:28:00 GMT").unwrap(), expected);
        assert_eq!(parse_http_date("Wed Oct 21 07:28:00 2015").unwrap(), expected);

        assert!(matches!(
            parse_http_date("yesterday"),
            Err(Error::InvalidHeader {
                name: "Last-Modified",
                ..
            })
        ));
    }

    #[test]
    fn test_http_date_format() {
        let date = Utc.with_ymd_and_hms(2024, 3, 5, 9, 7, 1).unwrap();
        assert_eq!(
            date.format(HTTP_DATE_FORMAT).to_string(),
            "Tue, 05 Mar 2024 09:07:01 GMT"
        );
        assert_eq!(parse_http_date(&date.format(HTTP_DATE_FORMAT).to_string()).unwrap(), date);
    }
}
