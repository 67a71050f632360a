//! Disk-backed caching HTTP client for metadata generation
//!
//! Upstream metadata (version manifests, library indexes, installer archives)
//! is fetched once and kept on disk, then revalidated or reused on later runs.
//!
//! # Features
//!
//! - **Per-key locking**: concurrent requests for one cache key are serialized
//!   in arrival order, so a resource is downloaded at most once
//! - **Staleness strategies**: cache forever, revalidate with
//!   `If-None-Match`/`If-Modified-Since`, or compare against a known digest
//! - **Corruption detection**: every body is stored with its sha-1 and
//!   discarded on mismatch
//! - **Crash-safe writes**: bodies and metadata are written to temporary files
//!   and renamed into place
//! - **Bounded concurrency**: a semaphore limits in-flight requests
//! - **Retries**: transport failures and 5xx answers are retried with
//!   exponential backoff
//! - **Remote zip entries**: single files are read out of remote archives with
//!   range requests
//!
//! # Cache layout
//!
//! ```text
//! {cache_dir}/
//! ├── version_manifest_v2.json              # body
//! ├── version_manifest_v2.json.entry.json   # {"sha1", "lastModified", "eTag"}
//! └── forge/
//!     ├── 1.20.1-47.2.0/version.json
//!     └── 1.20.1-47.2.0/version.json.entry.json
//! ```
//!
//! # Example
//!
//! ```no_run
//! use metabolism_http::{CachedHttpClient, ClientConfig, StalenessStrategy};
//!
//! # #[tokio::main]
//! # async fn main() -> metabolism_http::Result<()> {
//! let client = CachedHttpClient::new(ClientConfig::new("run/cache/forge"))?;
//!
//! // Headers only: enough to learn when an artifact was published
//! let meta = client
//!     .head(
//!         "maven/forge-1.20.1-47.2.0-installer.jar",
//!         "https://maven.minecraftforge.net/net/minecraftforge/forge/1.20.1-47.2.0/forge-1.20.1-47.2.0-installer.jar",
//!     )
//!     .await?;
//! println!("published {}", meta.require_last_modified()?);
//!
//! // One file out of the installer, without downloading the whole jar
//! let profile = client
//!     .fetch_zip_entry(
//!         "installer/1.20.1-47.2.0/install_profile.json",
//!         "https://maven.minecraftforge.net/net/minecraftforge/forge/1.20.1-47.2.0/forge-1.20.1-47.2.0-installer.jar",
//!         "install_profile.json",
//!     )
//!     .await?;
//! println!("{} bytes of install profile", profile.len());
//!
//! // A library whose sha-1 is already known from another document
//! let strategy = StalenessStrategy::sha1_hex("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d")?;
//! client.fetch("libraries/example.json", "https://example.com/example.json", &strategy).await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

pub mod client;
pub mod config;
pub mod digest;
pub mod error;
pub mod executor;
pub mod lock;
pub mod response;
pub mod retry;
pub mod stats;
pub mod store;
pub mod strategy;
pub mod transport;
pub mod zip;

pub use client::CachedHttpClient;
pub use config::{ClientConfig, DEFAULT_USER_AGENT, TextEncoding};
pub use digest::DigestAlgorithm;
pub use error::{Error, Result};
pub use executor::RequestExecutor;
pub use lock::{KeyLockGuard, KeyLockRegistry};
pub use response::{Metadata, Response, ResponseSource};
pub use retry::RetryPolicy;
pub use stats::{ClientStats, ClientStatsSnapshot};
pub use store::{CacheEntry, CacheEntryMeta, EntryStore};
pub use strategy::StalenessStrategy;
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
pub use zip::{RemoteZip, ZipEntry};

/// Ensure a directory exists, creating it if necessary
pub(crate) async fn ensure_dir(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if tokio::fs::metadata(path).await.is_err() {
        tokio::fs::create_dir_all(path).await?;
    }
    Ok(())
}
