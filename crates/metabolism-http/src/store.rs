//! On-disk entry store
//!
//! Every cache key maps to two files under the cache root:
//!
//! - `{root}/{key}` holds the raw body (absent for headers-only entries)
//! - `{root}/{key}.entry.json` holds the sidecar metadata:
//!   `{ "sha1"?: base64, "lastModified"?: RFC 3339, "eTag"?: string }`
//!
//! A sidecar that carries a `sha1` is only trusted if the body file exists
//! and hashes to it. Anything else is treated as a cache miss.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt as _;
use tracing::{trace, warn};

use crate::digest::{self, SHA1_LEN};
use crate::ensure_dir;
use crate::error::{Error, Result};
use crate::response::Metadata;

/// Suffix of the sidecar metadata file
pub const META_SUFFIX: &str = ".entry.json";

/// Suffix of in-progress writes, renamed into place once complete
const TEMP_SUFFIX: &str = ".partial";

/// Metadata persisted next to a cached body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheEntryMeta {
    /// sha-1 of the body; present if and only if a body is stored
    pub sha1: Option<[u8; SHA1_LEN]>,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

impl CacheEntryMeta {
    /// Validators without the digest
    pub fn metadata(&self) -> Metadata {
        Metadata {
            last_modified: self.last_modified,
            etag: self.etag.clone(),
        }
    }
}

/// A cache entry as read from or written to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub meta: CacheEntryMeta,
    pub body: Option<Bytes>,
}

impl CacheEntry {
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }
}

/// Sidecar JSON layout
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sha1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_modified: Option<DateTime<Utc>>,
    #[serde(default, rename = "eTag", skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
}

/// Reads and writes cache entries under a root directory
#[derive(Debug, Clone)]
pub struct EntryStore {
    root: PathBuf,
}

impl EntryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Get the root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the body file for `key`.
    ///
    /// Resolution is lexical: the key may not be absolute, may not contain
    /// NUL bytes, and `..` components may not climb above the root. No
    /// component may end in a suffix reserved for sidecar or temp files.
    pub fn resolve(&self, key: &str) -> Result<PathBuf> {
        if key.contains('\0') {
            return Err(Error::invalid_key(key, "contains a NUL byte"));
        }

        let mut path = self.root.clone();
        let mut depth = 0usize;

        for component in Path::new(key).components() {
            match component {
                Component::Normal(part) => {
                    let name = part.to_string_lossy();
                    if name.ends_with(META_SUFFIX) || name.ends_with(TEMP_SUFFIX) {
                        return Err(Error::invalid_key(key, "uses a reserved suffix"));
                    }
                    path.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(Error::invalid_key(key, "escapes the cache directory"));
                    }
                    path.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(Error::invalid_key(key, "is an absolute path"));
                }
            }
        }

        if depth == 0 {
            return Err(Error::invalid_key(key, "does not name a file"));
        }

        Ok(path)
    }

    /// Read the entry for `key`.
    ///
    /// Returns `Ok(None)` when there is no entry or the entry is corrupt;
    /// corruption is logged. Only unexpected filesystem errors are propagated.
    pub async fn read(&self, key: &str) -> Result<Option<CacheEntry>> {
        let path = self.resolve(key)?;

        let Some(raw) = read_if_exists(&with_suffix(&path, META_SUFFIX)).await? else {
            return Ok(None);
        };

        let sidecar: Sidecar = match serde_json::from_slice(&raw) {
            Ok(sidecar) => sidecar,
            Err(e) => {
                warn!("Corrupt cache entry '{key}' ({e})");
                return Ok(None);
            }
        };

        let sha1 = match sidecar.sha1.as_deref().map(decode_sha1) {
            None => None,
            Some(Some(sha1)) => Some(sha1),
            Some(None) => {
                warn!("Corrupt cache entry '{key}' (unreadable sha1)");
                return Ok(None);
            }
        };

        let meta = CacheEntryMeta {
            sha1,
            last_modified: sidecar.last_modified,
            etag: sidecar.etag,
        };

        let Some(expected) = sha1 else {
            return Ok(Some(CacheEntry { meta, body: None }));
        };

        let Some(body) = read_if_exists(&path).await? else {
            warn!("Corrupt cache entry '{key}' (body is missing)");
            return Ok(None);
        };

        let actual = digest::sha1(&body);
        if actual != expected {
            warn!(
                "Modified cache entry '{key}' (expected sha1 {}, found {})",
                hex::encode(expected),
                hex::encode(actual)
            );
            return Ok(None);
        }

        trace!("Read {} bytes for cache key '{key}'", body.len());

        Ok(Some(CacheEntry {
            meta,
            body: Some(Bytes::from(body)),
        }))
    }

    /// Replace the entry for `key`.
    ///
    /// The old sidecar is deleted first and the new one is written last, so an
    /// interrupted write leaves either no entry or a complete one. Without a
    /// body any existing body file is removed.
    pub async fn write(
        &self,
        key: &str,
        metadata: Metadata,
        body: Option<Bytes>,
    ) -> Result<CacheEntry> {
        let path = self.resolve(key)?;
        let meta_path = with_suffix(&path, META_SUFFIX);

        let meta = CacheEntryMeta {
            sha1: body.as_deref().map(digest::sha1),
            last_modified: metadata.last_modified,
            etag: metadata.etag,
        };

        if let Some(parent) = path.parent() {
            ensure_dir(parent).await?;
        }

        remove_if_exists(&meta_path).await?;

        match &body {
            Some(body) => write_atomic(&path, body).await?,
            None => {
                remove_if_exists(&path).await?;
            }
        }

        let sidecar = Sidecar {
            sha1: meta.sha1.map(|sha1| BASE64.encode(sha1)),
            last_modified: meta.last_modified,
            etag: meta.etag.clone(),
        };
        write_atomic(&meta_path, &serde_json::to_vec(&sidecar)?).await?;

        trace!(
            "Wrote cache key '{key}' ({} body bytes)",
            body.as_ref().map_or(0, Bytes::len)
        );

        Ok(CacheEntry { meta, body })
    }
}

/// Accept base64 (current) and 40-character hex (older sidecars) digests.
fn decode_sha1(value: &str) -> Option<[u8; SHA1_LEN]> {
    let bytes = if value.len() == SHA1_LEN * 2 {
        hex::decode(value).ok()?
    } else {
        BASE64.decode(value).ok()?
    };

    bytes.try_into().ok()
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

async fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Returns whether a file was removed.
async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = with_suffix(path, TEMP_SUFFIX);

    {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
    }

    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e.into());
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store() -> (TempDir, EntryStore) {
        let dir = TempDir::new().unwrap();
        let store = EntryStore::new(dir.path());
        (dir, store)
    }

    fn metadata() -> Metadata {
        Metadata {
            last_modified: Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
            etag: Some("\"abc123\"".to_string()),
        }
    }

    #[test]
    fn test_resolve() {
        let store = EntryStore::new("/cache/root");

        assert_eq!(
            store.resolve("versions/1.20.json").unwrap(),
            PathBuf::from("/cache/root/versions/1.20.json")
        );
        assert_eq!(
            store.resolve("./a/../b.json").unwrap(),
            PathBuf::from("/cache/root/b.json")
        );

        for bad in ["../escape", "a/../../escape", "/etc/passwd", "nul\0byte", "", ".", "a/.."] {
            assert!(
                matches!(store.resolve(bad), Err(Error::InvalidKey { .. })),
                "{bad:?} should be rejected"
            );
        }

        for reserved in ["a.json.entry.json", "a.entry.json/b", "a.partial/b", "x/a.partial"] {
            assert!(
                matches!(store.resolve(reserved), Err(Error::InvalidKey { .. })),
                "{reserved:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let (_dir, store) = store();
        let body = Bytes::from_static(b"{\"latest\":\"1.21\"}");

        let written = store
            .write("manifest.json", metadata(), Some(body.clone()))
            .await
            .unwrap();
        assert_eq!(written.meta.sha1, Some(digest::sha1(&body)));

        let read = store.read("manifest.json").await.unwrap().expect("entry");
        assert_eq!(read, written);
        assert_eq!(read.body.unwrap(), body);
    }

    #[tokio::test]
    async fn test_missing_entry() {
        let (_dir, store) = store();
        assert!(store.read("nothing/here").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_headers_only_entry_removes_body() {
        let (dir, store) = store();

        store
            .write("lib.jar", Metadata::default(), Some(Bytes::from_static(b"old")))
            .await
            .unwrap();
        let entry = store.write("lib.jar", metadata(), None).await.unwrap();

        assert!(entry.meta.sha1.is_none());
        assert!(!dir.path().join("lib.jar").exists());

        let read = store.read("lib.jar").await.unwrap().expect("entry");
        assert!(!read.has_body());
        assert_eq!(read.meta.metadata(), metadata());
    }

    #[tokio::test]
    async fn test_sidecar_format() {
        let (dir, store) = store();
        store
            .write("a.json", metadata(), Some(Bytes::from_static(b"hello")))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("a.json.entry.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(json["sha1"], "qvTGHdzF6KLavt4PO0gs2a6pQ00=");
        assert_eq!(json["eTag"], "\"abc123\"");
        assert_eq!(json["lastModified"], "2024-01-02T03:04:05Z");
    }

    #[tokio::test]
    async fn test_corrupt_sidecar_is_a_miss() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("a.json"), b"hello").unwrap();
        std::fs::write(dir.path().join("a.json.entry.json"), b"{not json").unwrap();
        assert!(store.read("a.json").await.unwrap().is_none());

        std::fs::write(dir.path().join("a.json.entry.json"), br#"{"sha1":"???"}"#).unwrap();
        assert!(store.read("a.json").await.unwrap().is_none());

        std::fs::write(dir.path().join("a.json.entry.json"), br#"{"lastModified":42}"#).unwrap();
        assert!(store.read("a.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_digest_mismatch_is_a_miss() {
        let (dir, store) = store();
        store
            .write("a.json", metadata(), Some(Bytes::from_static(b"hello")))
            .await
            .unwrap();

        std::fs::write(dir.path().join("a.json"), b"tampered").unwrap();
        assert!(store.read("a.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_body_is_a_miss() {
        let (dir, store) = store();
        store
            .write("a.json", metadata(), Some(Bytes::from_static(b"hello")))
            .await
            .unwrap();

        std::fs::remove_file(dir.path().join("a.json")).unwrap();
        assert!(store.read("a.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hex_sha1_sidecar_is_accepted() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("old.json"), b"hello").unwrap();
        std::fs::write(
            dir.path().join("old.json.entry.json"),
            br#"{"sha1":"aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d","lastModified":"2023-06-01T00:00:00.000Z"}"#,
        )
        .unwrap();

        let entry = store.read("old.json").await.unwrap().expect("entry");
        assert_eq!(entry.body.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(
            entry.meta.last_modified,
            Some(Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_write_leaves_no_partial_files() {
        let (dir, store) = store();
        store
            .write("nested/dir/a.txt", Metadata::default(), Some(Bytes::from_static(b"x")))
            .await
            .unwrap();

        let mut names: Vec<_> = std::fs::read_dir(dir.path().join("nested/dir"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt".to_string(), "a.txt.entry.json".to_string()]);
    }
}
