//! Reading single entries out of remote zip archives with HTTP range requests
//!
//! Only the end-of-central-directory record, the central directory, and the
//! requested entry are downloaded:
//!
//! 1. `Range: bytes=-65557` fetches the tail, which always contains the
//!    end-of-central-directory record (22 bytes plus at most 65535 bytes of
//!    comment).
//! 2. The central directory is sliced from the tail or fetched separately.
//! 3. The entry's local header and data are fetched, inflated if needed, and
//!    checked against the recorded CRC-32.
//!
//! Servers that ignore `Range` and answer `200` with the whole archive are
//! handled too; every later read is then served from that body.

use binrw::io::Cursor;
use binrw::{BinRead, BinResult};
use bytes::Bytes;
use flate2::Crc;
use flate2::read::DeflateDecoder;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_RANGE, RANGE};
use std::io::Read as _;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::executor::RequestExecutor;
use crate::transport::HttpRequest;

/// Fixed size of the end-of-central-directory record
const EOCD_LEN: usize = 22;

/// Largest possible archive comment
const MAX_COMMENT_LEN: usize = u16::MAX as usize;

/// Bytes requested from the end of the archive
pub const TAIL_LEN: usize = EOCD_LEN + MAX_COMMENT_LEN;

const EOCD_MAGIC: &[u8; 4] = b"PK\x05\x06";

/// Fixed size of a local file header
const LOCAL_HEADER_LEN: usize = 30;

const FLAG_ENCRYPTED: u16 = 0x0001;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

#[derive(Debug, Clone, BinRead)]
#[br(little, magic = b"PK\x05\x06")]
struct EndOfCentralDirectory {
    disk_number: u16,
    central_directory_disk: u16,
    _entries_on_disk: u16,
    total_entries: u16,
    central_directory_size: u32,
    central_directory_offset: u32,
    _comment_len: u16,
}

#[derive(Debug, Clone, BinRead)]
#[br(little, magic = b"PK\x01\x02")]
struct CentralDirectoryHeader {
    _version_made_by: u16,
    _version_needed: u16,
    flags: u16,
    method: u16,
    _modified_time: u16,
    _modified_date: u16,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    name_len: u16,
    extra_len: u16,
    comment_len: u16,
    _disk_number_start: u16,
    _internal_attributes: u16,
    _external_attributes: u32,
    local_header_offset: u32,
    #[br(count = name_len)]
    name: Vec<u8>,
    #[br(count = extra_len)]
    _extra: Vec<u8>,
    #[br(count = comment_len)]
    _comment: Vec<u8>,
}

#[derive(Debug, Clone, BinRead)]
#[br(little, magic = b"PK\x03\x04")]
struct LocalFileHeader {
    _version_needed: u16,
    _flags: u16,
    _method: u16,
    _modified_time: u16,
    _modified_date: u16,
    _crc32: u32,
    _compressed_size: u32,
    _uncompressed_size: u32,
    name_len: u16,
    extra_len: u16,
}

/// An entry listed in the central directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipEntry {
    /// Entry path inside the archive, `/`-separated
    pub name: String,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub crc32: u32,
    method: u16,
    flags: u16,
    local_header_offset: u32,
}

impl ZipEntry {
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    fn from_header(header: CentralDirectoryHeader) -> Self {
        Self {
            name: String::from_utf8_lossy(&header.name).into_owned(),
            compressed_size: header.compressed_size,
            uncompressed_size: header.uncompressed_size,
            crc32: header.crc32,
            method: header.method,
            flags: header.flags,
            local_header_offset: header.local_header_offset,
        }
    }
}

/// Bytes of the archive already downloaded
#[derive(Debug)]
struct Window {
    offset: u64,
    data: Bytes,
}

impl Window {
    fn slice(&self, start: u64, len: usize) -> Option<Bytes> {
        let begin = usize::try_from(start.checked_sub(self.offset)?).ok()?;
        let end = begin.checked_add(len)?;
        (end <= self.data.len()).then(|| self.data.slice(begin..end))
    }
}

/// A zip archive behind a URL
///
/// Each method makes single-attempt requests through the executor; wrap calls
/// in [`RequestExecutor::retry`] to retry the whole read.
#[derive(Debug)]
pub struct RemoteZip {
    executor: RequestExecutor,
    url: String,
    size: u64,
    window: Window,
    entries: Vec<ZipEntry>,
}

impl RemoteZip {
    /// Fetch the tail and central directory of the archive at `url`
    pub async fn open(executor: RequestExecutor, url: impl Into<String>) -> Result<Self> {
        let url = url.into();

        let (window, size) = fetch_tail(&executor, &url).await?;

        let eocd_pos = find_eocd(&window.data)
            .ok_or_else(|| Error::invalid_archive(format!("no end of central directory in '{url}'")))?;
        let eocd = parse::<EndOfCentralDirectory>(&window.data[eocd_pos..])?;

        if eocd.disk_number != 0 || eocd.central_directory_disk != 0 {
            return Err(Error::invalid_archive("multi-disk archives are not supported"));
        }
        if eocd.total_entries == u16::MAX || eocd.central_directory_offset == u32::MAX {
            return Err(Error::invalid_archive("ZIP64 archives are not supported"));
        }

        let cd_offset = u64::from(eocd.central_directory_offset);
        let cd_len = eocd.central_directory_size as usize;
        if cd_offset + cd_len as u64 > size {
            return Err(Error::invalid_archive(
                "central directory extends past the end of the archive",
            ));
        }

        let mut zip = Self {
            executor,
            url,
            size,
            window,
            entries: Vec::new(),
        };

        let directory = zip.read_range(cd_offset, cd_len).await?;
        zip.entries = parse_central_directory(&directory, eocd.total_entries)?;

        debug!(
            "Opened '{}' ({} bytes, {} entries)",
            zip.url,
            zip.size,
            zip.entries.len()
        );

        Ok(zip)
    }

    /// Open the archive at `url` and read one entry from it
    pub async fn extract(executor: RequestExecutor, url: &str, name: &str) -> Result<Bytes> {
        Self::open(executor, url).await?.read_entry(name).await
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Total archive size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn entries(&self) -> &[ZipEntry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&ZipEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Download, inflate and verify the entry called `name`
    pub async fn read_entry(&self, name: &str) -> Result<Bytes> {
        let entry = self.entry(name).ok_or_else(|| Error::ZipEntryNotFound {
            url: self.url.clone(),
            entry: name.to_string(),
        })?;

        if entry.is_encrypted() {
            return Err(Error::invalid_archive(format!(
                "entry '{name}' is encrypted"
            )));
        }
        if entry.compressed_size == u32::MAX || entry.uncompressed_size == u32::MAX {
            return Err(Error::invalid_archive("ZIP64 entries are not supported"));
        }

        let header_offset = u64::from(entry.local_header_offset);
        let header = self.read_range(header_offset, LOCAL_HEADER_LEN).await?;
        let header = parse::<LocalFileHeader>(&header)?;

        let data_offset = header_offset
            + LOCAL_HEADER_LEN as u64
            + u64::from(header.name_len)
            + u64::from(header.extra_len);
        let data = self
            .read_range(data_offset, entry.compressed_size as usize)
            .await?;

        let contents = match entry.method {
            METHOD_STORED => data,
            METHOD_DEFLATE => inflate(&data, entry.uncompressed_size as usize)?,
            method => {
                return Err(Error::invalid_archive(format!(
                    "entry '{name}' uses unsupported compression method {method}"
                )));
            }
        };

        if contents.len() != entry.uncompressed_size as usize {
            return Err(Error::invalid_archive(format!(
                "entry '{name}' is {} bytes, expected {}",
                contents.len(),
                entry.uncompressed_size
            )));
        }

        let mut crc = Crc::new();
        crc.update(&contents);
        if crc.sum() != entry.crc32 {
            return Err(Error::invalid_archive(format!(
                "CRC-32 mismatch for entry '{name}'"
            )));
        }

        trace!("Read {} bytes from '{}' in '{}'", contents.len(), name, self.url);

        Ok(contents)
    }

    /// `len` bytes at `start`, from the downloaded window when possible
    async fn read_range(&self, start: u64, len: usize) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        if let Some(data) = self.window.slice(start, len) {
            return Ok(data);
        }
        if start + len as u64 > self.size {
            return Err(Error::invalid_archive(format!(
                "range {start}+{len} is outside the archive"
            )));
        }

        let end = start + len as u64 - 1;
        let request = HttpRequest::get(self.url.clone())
            .header(RANGE, &format!("bytes={start}-{end}"))?
            .header(ACCEPT_ENCODING, "identity")?;
        let response = self.executor.send(request).await?;

        let window = match response.status {
            StatusCode::PARTIAL_CONTENT => {
                let (offset, _) = parse_content_range(response.header_str(&CONTENT_RANGE))?;
                Window {
                    offset,
                    data: response.body,
                }
            }
            StatusCode::OK => Window {
                offset: 0,
                data: response.body,
            },
            status => return Err(Error::unexpected_status(&self.url, status)),
        };

        window.slice(start, len).ok_or_else(|| {
            Error::invalid_archive(format!(
                "server returned a short range for bytes {start}-{end}"
            ))
        })
    }
}

/// Fetch the archive tail; returns it along with the total archive size
async fn fetch_tail(executor: &RequestExecutor, url: &str) -> Result<(Window, u64)> {
    let request = HttpRequest::get(url)
        .header(RANGE, &format!("bytes=-{TAIL_LEN}"))?
        .header(ACCEPT_ENCODING, "identity")?;
    let response = executor.send(request).await?;

    match response.status {
        StatusCode::PARTIAL_CONTENT => {
            let (offset, size) = parse_content_range(response.header_str(&CONTENT_RANGE))?;
            Ok((
                Window {
                    offset,
                    data: response.body,
                },
                size,
            ))
        }
        StatusCode::OK => {
            let size = response.body.len() as u64;
            Ok((
                Window {
                    offset: 0,
                    data: response.body,
                },
                size,
            ))
        }
        status => Err(Error::unexpected_status(url, status)),
    }
}

/// Parse `bytes <start>-<end>/<total>` into `(start, total)`
fn parse_content_range(value: Option<&str>) -> Result<(u64, u64)> {
    let invalid = || Error::InvalidHeader {
        name: "Content-Range",
        value: value.unwrap_or_default().to_string(),
    };

    let value = value.ok_or_else(invalid)?;
    let range = value.trim().strip_prefix("bytes ").ok_or_else(invalid)?;
    let (span, total) = range.split_once('/').ok_or_else(invalid)?;
    let (start, end) = span.split_once('-').ok_or_else(invalid)?;

    let start: u64 = start.trim().parse().map_err(|_| invalid())?;
    let end: u64 = end.trim().parse().map_err(|_| invalid())?;
    let total: u64 = total.trim().parse().map_err(|_| invalid())?;

    if start > end || end >= total {
        return Err(invalid());
    }

    Ok((start, total))
}

/// Offset of the last end-of-central-directory record whose comment fits
fn find_eocd(data: &[u8]) -> Option<usize> {
    if data.len() < EOCD_LEN {
        return None;
    }

    (0..=data.len() - EOCD_LEN).rev().find(|&pos| {
        if &data[pos..pos + 4] != EOCD_MAGIC {
            return false;
        }
        let comment_len = usize::from(u16::from_le_bytes([data[pos + 20], data[pos + 21]]));
        pos + EOCD_LEN + comment_len <= data.len()
    })
}

fn parse_central_directory(data: &[u8], count: u16) -> Result<Vec<ZipEntry>> {
    let mut cursor = Cursor::new(data);
    let mut entries = Vec::with_capacity(usize::from(count));

    for _ in 0..count {
        let header = CentralDirectoryHeader::read(&mut cursor).map_err(archive_error)?;
        entries.push(ZipEntry::from_header(header));
    }

    Ok(entries)
}

fn parse<T>(data: &[u8]) -> Result<T>
where
    T: BinRead + binrw::meta::ReadEndian,
    for<'a> T::Args<'a>: Default,
{
    let result: BinResult<T> = T::read(&mut Cursor::new(data));
    result.map_err(archive_error)
}

fn archive_error(e: binrw::Error) -> Error {
    Error::invalid_archive(e.to_string())
}

/// Inflate at most `expected_len` bytes; a longer stream is rejected
/// without decompressing the rest of it.
fn inflate(data: &[u8], expected_len: usize) -> Result<Bytes> {
    let mut out = Vec::with_capacity(expected_len.min(data.len().saturating_mul(8)));
    DeflateDecoder::new(data)
        .take((expected_len as u64).saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| Error::invalid_archive(format!("deflate stream is corrupt: {e}")))?;

    if out.len() > expected_len {
        return Err(Error::invalid_archive(format!(
            "deflate stream inflates past the declared {expected_len} bytes"
        )));
    }
    Ok(Bytes::from(out))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::cast_possible_truncation)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::transport::{HttpResponse, Transport};
    use async_trait::async_trait;
    use flate2::Compression;
    use flate2::write::DeflateEncoder;
    use parking_lot::Mutex;
    use reqwest::header::{HeaderMap, HeaderValue};
    use std::io::Write as _;
    use std::sync::Arc;

    fn build_zip(files: &[(&str, &[u8], bool)]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut central = Vec::new();

        for (name, data, deflate) in files {
            let mut crc = Crc::new();
            crc.update(data);
            let crc = crc.sum();

            let (method, compressed) = if *deflate {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data).unwrap();
                (METHOD_DEFLATE, encoder.finish().unwrap())
            } else {
                (METHOD_STORED, data.to_vec())
            };

            let offset = out.len() as u32;
            out.extend_from_slice(b"PK\x03\x04");
            out.extend(20u16.to_le_bytes());
            out.extend(0u16.to_le_bytes());
            out.extend(method.to_le_bytes());
            out.extend([0u8; 4]);
            out.extend(crc.to_le_bytes());
            out.extend((compressed.len() as u32).to_le_bytes());
            out.extend((data.len() as u32).to_le_bytes());
            out.extend((name.len() as u16).to_le_bytes());
            out.extend(0u16.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&compressed);

            central.extend_from_slice(b"PK\x01\x02");
            central.extend(20u16.to_le_bytes());
            central.extend(20u16.to_le_bytes());
            central.extend(0u16.to_le_bytes());
            central.extend(method.to_le_bytes());
            central.extend([0u8; 4]);
            central.extend(crc.to_le_bytes());
            central.extend((compressed.len() as u32).to_le_bytes());
            central.extend((data.len() as u32).to_le_bytes());
            central.extend((name.len() as u16).to_le_bytes());
            central.extend([0u8; 8]);
            central.extend(0u32.to_le_bytes());
            central.extend(offset.to_le_bytes());
            central.extend_from_slice(name.as_bytes());
        }

        let cd_offset = out.len() as u32;
        out.extend_from_slice(&central);
        out.extend_from_slice(EOCD_MAGIC);
        out.extend([0u8; 4]);
        out.extend((files.len() as u16).to_le_bytes());
        out.extend((files.len() as u16).to_le_bytes());
        out.extend((central.len() as u32).to_le_bytes());
        out.extend(cd_offset.to_le_bytes());
        out.extend(0u16.to_le_bytes());
        out
    }

    /// Serves byte ranges of an in-memory archive
    struct RangeServer {
        archive: Vec<u8>,
        honor_ranges: bool,
        requests: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for RangeServer {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            let range = request
                .headers
                .get(RANGE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            self.requests.lock().push(range.clone());

            let len = self.archive.len();
            let spec = range.strip_prefix("bytes=").unwrap_or_default();
            if !self.honor_ranges || spec.is_empty() {
                return Ok(HttpResponse {
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                    body: Bytes::from(self.archive.clone()),
                });
            }

            let (start, end) = match spec.split_once('-').unwrap() {
                ("", suffix) => (len.saturating_sub(suffix.parse().unwrap()), len - 1),
                (start, end) => (start.parse().unwrap(), end.parse::<usize>().unwrap().min(len - 1)),
            };

            let mut headers = HeaderMap::new();
            headers.insert(
                CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {start}-{end}/{len}")).unwrap(),
            );
            Ok(HttpResponse {
                status: StatusCode::PARTIAL_CONTENT,
                headers,
                body: Bytes::copy_from_slice(&self.archive[start..=end]),
            })
        }
    }

    fn executor(archive: Vec<u8>, honor_ranges: bool) -> (Arc<RangeServer>, RequestExecutor) {
        let server = Arc::new(RangeServer {
            archive,
            honor_ranges,
            requests: Mutex::new(Vec::new()),
        });
        let executor = RequestExecutor::new(server.clone(), 4, RetryPolicy::none()).unwrap();
        (server, executor)
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range(Some("bytes 100-199/1000")).unwrap(),
            (100, 1000)
        );
        assert!(parse_content_range(Some("bytes 0-9/*")).is_err());
        assert!(parse_content_range(Some("bytes 10-5/100")).is_err());
        assert!(parse_content_range(None).is_err());
    }

    #[test]
    fn test_find_eocd_skips_false_signature_in_comment() {
        let mut archive = build_zip(&[("a.txt", b"a".as_slice(), false)]);
        let real = archive.len() - EOCD_LEN;

        // Add a comment that itself contains the signature
        let comment = [b"PK\x05\x06".as_slice(), &[0xFF; 30]].concat();
        archive.truncate(archive.len() - 2);
        archive.extend((comment.len() as u16).to_le_bytes());
        archive.extend_from_slice(&comment);

        assert_eq!(find_eocd(&archive), Some(real));
        assert_eq!(find_eocd(b"short"), None);
    }

    #[tokio::test]
    async fn test_read_stored_and_deflated_entries() {
        let library = b"{\"id\":\"net.minecraftforge:forge\"}".repeat(20);
        let archive = build_zip(&[
            ("version.json", br#"{"id":"1.20.1-forge"}"#.as_slice(), false),
            ("install_profile.json", library.as_slice(), true),
        ]);
        let (server, executor) = executor(archive, true);

        let zip = RemoteZip::open(executor, "https://example.com/installer.jar")
            .await
            .unwrap();
        assert_eq!(zip.entries().len(), 2);

        assert_eq!(
            zip.read_entry("version.json").await.unwrap(),
            Bytes::from_static(b"{\"id\":\"1.20.1-forge\"}")
        );
        assert_eq!(zip.read_entry("install_profile.json").await.unwrap(), library);

        let requests = server.requests.lock();
        assert_eq!(requests[0], format!("bytes=-{TAIL_LEN}"));
        // Small archive: everything was in the tail
        assert_eq!(requests.len(), 1);
    }

    #[tokio::test]
    async fn test_large_archive_uses_ranges() {
        let padding = vec![7u8; TAIL_LEN * 2];
        let archive = build_zip(&[
            ("big.bin", padding.as_slice(), false),
            ("first.txt", b"hello".as_slice(), false),
        ]);
        let (server, executor) = executor(archive, true);

        let zip = RemoteZip::open(executor, "https://example.com/big.zip")
            .await
            .unwrap();
        assert_eq!(zip.read_entry("big.bin").await.unwrap().len(), padding.len());
        assert!(server.requests.lock().len() > 1);
    }

    #[tokio::test]
    async fn test_server_without_range_support() {
        let archive = build_zip(&[("a.txt", b"alpha".as_slice(), true)]);
        let (server, executor) = executor(archive, false);

        let zip = RemoteZip::open(executor, "https://example.com/a.zip")
            .await
            .unwrap();
        assert_eq!(zip.read_entry("a.txt").await.unwrap(), Bytes::from_static(b"alpha"));
        assert_eq!(server.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_entry() {
        let archive = build_zip(&[("a.txt", b"alpha".as_slice(), false)]);
        let (_server, executor) = executor(archive, true);

        let zip = RemoteZip::open(executor, "https://example.com/a.zip")
            .await
            .unwrap();
        let err = zip.read_entry("b.txt").await.expect_err("missing");
        assert!(matches!(err, Error::ZipEntryNotFound { ref entry, .. } if entry == "b.txt"));
        assert!(!err.should_retry());
    }

    #[tokio::test]
    async fn test_crc_mismatch_detected() {
        let mut archive = build_zip(&[("a.txt", b"alpha".as_slice(), false)]);
        // Corrupt the stored data: local header (30) + name (5)
        archive[35] ^= 0xFF;
        let (_server, executor) = executor(archive, true);

        let zip = RemoteZip::open(executor, "https://example.com/a.zip")
            .await
            .unwrap();
        assert!(matches!(
            zip.read_entry("a.txt").await,
            Err(Error::InvalidArchive(_))
        ));
    }

    #[test]
    fn test_inflate_stops_at_declared_size() {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&vec![0u8; 1 << 20]).unwrap();
        let stream = encoder.finish().unwrap();

        assert_eq!(inflate(&stream, 1 << 20).unwrap().len(), 1 << 20);
        assert!(matches!(inflate(&stream, 1), Err(Error::InvalidArchive(_))));
        assert!(matches!(inflate(&stream, (1 << 20) - 1), Err(Error::InvalidArchive(_))));
    }

    #[tokio::test]
    async fn test_entry_larger_than_declared_is_rejected() {
        let zeros = vec![0u8; 4 << 20];
        let mut archive = build_zip(&[("bomb.bin", zeros.as_slice(), true)]);

        // Declare a 1-byte entry in the central directory
        let eocd = archive.len() - EOCD_LEN;
        let cd_offset =
            u32::from_le_bytes(archive[eocd + 16..eocd + 20].try_into().unwrap()) as usize;
        archive[cd_offset + 24..cd_offset + 28].copy_from_slice(&1u32.to_le_bytes());
        let (_server, executor) = executor(archive, true);

        let zip = RemoteZip::open(executor, "https://example.com/bomb.zip")
            .await
            .unwrap();
        assert_eq!(zip.entry("bomb.bin").unwrap().uncompressed_size, 1);
        assert!(matches!(
            zip.read_entry("bomb.bin").await,
            Err(Error::InvalidArchive(_))
        ));
    }

    #[tokio::test]
    async fn test_not_a_zip() {
        let (_server, executor) = executor(b"definitely not a zip file".to_vec(), true);
        assert!(matches!(
            RemoteZip::open(executor, "https://example.com/a.zip").await,
            Err(Error::InvalidArchive(_))
        ));
    }
}
