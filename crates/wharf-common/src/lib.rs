//! Wharf Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities used by every Wharf workspace member.
//!
//! # Overview
//!
//! - **Error Handling**: the common error type and result alias
//! - **Checksums**: integrity digests for staged chunks and shadow-table naming
//! - **Logging**: `tracing` subscriber initialisation driven by `LOG_*` variables
//!
//! # Example
//!
//! ```no_run
//! use wharf_common::checksum::{digest_bytes, ChecksumAlgorithm};
//!
//! let digest = digest_bytes(b"staged payload", ChecksumAlgorithm::Sha256);
//! assert_eq!(digest.len(), 64);
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{Result, WharfError};
