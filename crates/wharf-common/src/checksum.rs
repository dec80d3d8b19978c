//! Checksum utilities for staged-chunk integrity

use crate::error::{Result, WharfError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

/// Checksum algorithm type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
            ChecksumAlgorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

/// Hex digest of an in-memory buffer
pub fn digest_bytes(data: &[u8], algorithm: ChecksumAlgorithm) -> String {
    match algorithm {
        ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        ChecksumAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
    }
}

/// Short, stable identifier derived from arbitrary text.
///
/// Used where a name must fit a length-limited namespace (database identifiers).
pub fn short_digest(text: &str, len: usize) -> String {
    let mut digest = digest_bytes(text.as_bytes(), ChecksumAlgorithm::Sha256);
    digest.truncate(len.min(digest.len()));
    digest
}

/// Verify a buffer against an expected digest
pub fn verify_bytes(data: &[u8], expected: &str, algorithm: ChecksumAlgorithm) -> Result<()> {
    let actual = digest_bytes(data, algorithm);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(WharfError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
