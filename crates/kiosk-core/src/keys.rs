//! Stable user keys derived by hashing display names.
//!
//! The digest is configurable. Keys written under one algorithm cannot be
//! recomputed under another, but the display name is stored next to each key
//! so lookups by linear scan keep working after a change.

use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::types::Embedding;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    #[error("unsupported hash algorithm: {0} (expected sha224, sha256, sha384 or sha512)")]
    UnsupportedAlgorithm(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    Sha224,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha224 => "sha224",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    /// Lowercase hex digest of `bytes`.
    pub fn hex_digest(&self, bytes: &[u8]) -> String {
        match self {
            HashAlgorithm::Sha224 => format!("{:x}", Sha224::digest(bytes)),
            HashAlgorithm::Sha256 => format!("{:x}", Sha256::digest(bytes)),
            HashAlgorithm::Sha384 => format!("{:x}", Sha384::digest(bytes)),
            HashAlgorithm::Sha512 => format!("{:x}", Sha512::digest(bytes)),
        }
    }

    /// Derive the store key for a display name.
    pub fn hash_name(&self, name: &str) -> String {
        self.hex_digest(name.as_bytes())
    }

    /// Fingerprint of an embedding's little-endian bytes.
    pub fn hash_embedding(&self, embedding: &Embedding) -> String {
        let mut bytes = Vec::with_capacity(embedding.values.len() * 4);
        for v in &embedding.values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        self.hex_digest(&bytes)
    }
}

impl FromStr for HashAlgorithm {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "sha224" => Ok(HashAlgorithm::Sha224),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            _ => Err(KeyError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
