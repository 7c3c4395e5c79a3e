//! Content digest naming a blob
//!
//! A digest is the 32-byte Merkle root of a blob's content. It is displayed
//! and parsed as lowercase hex, which is also how blobs are listed.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Length of a digest in bytes (SHA-256)
pub const DIGEST_LEN: usize = 32;

/// Serialized as its hex string, so JSON listings match the CLI output
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// The all-zero digest, stored in free inode slots
    pub const ZERO: Digest = Digest([0u8; DIGEST_LEN]);

    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Digest(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Copy a digest out of a slice of exactly `DIGEST_LEN` bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; DIGEST_LEN] = bytes.try_into().ok()?;
        Some(Digest(arr))
    }
}

impl From<[u8; DIGEST_LEN]> for Digest {
    fn from(bytes: [u8; DIGEST_LEN]) -> Self {
        Digest(bytes)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

impl TryFrom<String> for Digest {
    type Error = InvalidDigest;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        hex::encode(self.0).fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidDigest {
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("digest must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

impl FromStr for Digest {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Digest::from_slice(&bytes).ok_or(InvalidDigest::InvalidLength(bytes.len()))
    }
}
