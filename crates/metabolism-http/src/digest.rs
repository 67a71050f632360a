//! Digest algorithms used for corruption detection and freshness checks

use digest::Digest;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Length in bytes of a sha-1 digest
pub const SHA1_LEN: usize = 20;

/// Hash algorithms accepted by [`StalenessStrategy::CompareLocalDigest`](crate::StalenessStrategy)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    /// SHA-1, also used for the sidecar's corruption check
    #[serde(rename = "sha-1", alias = "sha1")]
    Sha1,
    #[serde(rename = "sha-256", alias = "sha256")]
    Sha256,
    #[serde(rename = "sha-384", alias = "sha384")]
    Sha384,
    #[serde(rename = "sha-512", alias = "sha512")]
    Sha512,
}

impl DigestAlgorithm {
    /// Hash `data` with this algorithm
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// Digest length in bytes
    pub fn output_len(self) -> usize {
        match self {
            Self::Sha1 => SHA1_LEN,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Canonical lowercase name, e.g. `sha-256`
    pub fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "sha-1",
            Self::Sha256 => "sha-256",
            Self::Sha384 => "sha-384",
            Self::Sha512 => "sha-512",
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(Error::InvalidDigest(format!("unknown algorithm '{s}'"))),
        }
    }
}

/// sha-1 of `data` as a fixed-size array
pub fn sha1(data: &[u8]) -> [u8; SHA1_LEN] {
    let mut out = [0u8; SHA1_LEN];
    out.copy_from_slice(&Sha1::digest(data));
    out
}
