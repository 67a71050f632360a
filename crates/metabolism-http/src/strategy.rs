//! Staleness strategies deciding when a cached body may be reused

use crate::digest::DigestAlgorithm;
use crate::error::{Error, Result};

/// How [`CachedHttpClient::fetch`](crate::CachedHttpClient::fetch) validates a cached body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StalenessStrategy {
    /// Cache forever: a cached body is always returned without a request.
    Eternal,

    /// Revalidate with the origin using `If-None-Match` (preferred) or
    /// `If-Modified-Since`; a `304` keeps the cached body.
    #[default]
    ConditionalRequest,

    /// Hash the cached body and only contact the origin if it differs from
    /// `expected`. Prefer this when the digest is already known from another
    /// document, as it avoids the request entirely.
    CompareLocalDigest {
        algorithm: DigestAlgorithm,
        expected: Vec<u8>,
    },
}

impl StalenessStrategy {
    /// Digest comparison against a hex-encoded expected value
    pub fn compare_digest_hex(algorithm: DigestAlgorithm, expected: &str) -> Result<Self> {
        let expected = hex::decode(expected.trim())
            .map_err(|e| Error::InvalidDigest(format!("'{expected}': {e}")))?;

        if expected.len() != algorithm.output_len() {
            return Err(Error::InvalidDigest(format!(
                "expected {} bytes for {algorithm}, got {}",
                algorithm.output_len(),
                expected.len()
            )));
        }

        Ok(Self::CompareLocalDigest {
            algorithm,
            expected,
        })
    }

    /// Shorthand for a sha-1 comparison, the most common form in upstream manifests
    pub fn sha1_hex(expected: &str) -> Result<Self> {
        Self::compare_digest_hex(DigestAlgorithm::Sha1, expected)
    }
}
