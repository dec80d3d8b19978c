//! Error types shared across Wharf crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, WharfError>;

/// Errors raised by the shared utilities
#[derive(Error, Debug)]
pub enum WharfError {
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}
