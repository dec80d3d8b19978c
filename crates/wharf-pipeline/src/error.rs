//! Error taxonomy for the extraction and load layers
//!
//! Every error that can reach the retry executor implements [`Classify`], which
//! is the only thing the executor looks at when deciding whether to try again.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::ChunkKey;

/// Whether an operation may succeed if attempted again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

pub trait Classify {
    fn class(&self) -> ErrorClass;

    fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionErrorKind {
    /// The source answered with something that cannot be decoded
    Malformed,
    /// The source could not be reached; worth retrying
    Unavailable,
    /// Authentication, permission or configuration failure
    Fatal,
}

#[derive(Debug, Error)]
#[error("{kind:?} extraction error{}: {message}", .chunk_key.as_ref().map(|k| format!(" for chunk {k}")).unwrap_or_default())]
pub struct ExtractionError {
    pub kind: ExtractionErrorKind,
    pub chunk_key: Option<ChunkKey>,
    pub message: String,
}

impl ExtractionError {
    pub fn new(kind: ExtractionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            chunk_key: None,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ExtractionErrorKind::Malformed, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ExtractionErrorKind::Unavailable, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ExtractionErrorKind::Fatal, message)
    }

    pub fn for_chunk(mut self, key: &ChunkKey) -> Self {
        self.chunk_key = Some(key.clone());
        self
    }
}

impl Classify for ExtractionError {
    fn class(&self) -> ErrorClass {
        match self.kind {
            ExtractionErrorKind::Unavailable => ErrorClass::Retryable,
            ExtractionErrorKind::Malformed | ExtractionErrorKind::Fatal => ErrorClass::Fatal,
        }
    }
}

/// Failures raised by a warehouse backend
#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("Constraint violation on {table}: {detail}")]
    ConstraintViolation {
        table: String,
        detail: String,
        /// Short summaries of the rows involved, when known
        offending: Vec<String>,
    },

    #[error("Schema mismatch on {table}: {detail}")]
    SchemaMismatch { table: String, detail: String },

    #[error("Warehouse unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Warehouse error: {0}")]
    Fatal(String),
}

/// SQLSTATE codes worth retrying: connection loss, serialization failure,
/// deadlock, shutdown in progress, too many connections.
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "40001" | "40P01" | "57P01" | "57P03" | "53300")
}

/// Retry classification for raw sqlx errors
pub fn classify_sqlx(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorClass::Retryable,
        sqlx::Error::Database(db) => match db.code() {
            Some(code) if is_transient_sqlstate(&code) => ErrorClass::Retryable,
            _ => ErrorClass::Fatal,
        },
        _ => ErrorClass::Fatal,
    }
}

impl Classify for WarehouseError {
    fn class(&self) -> ErrorClass {
        match self {
            WarehouseError::Unavailable(_) => ErrorClass::Retryable,
            WarehouseError::Database(err) => classify_sqlx(err),
            WarehouseError::ConstraintViolation { .. }
            | WarehouseError::SchemaMismatch { .. }
            | WarehouseError::Fatal(_) => ErrorClass::Fatal,
        }
    }
}

/// A chunk could not be applied; the warehouse holds none of its rows
#[derive(Debug, Error)]
#[error("Load failed for chunk {chunk_key}: {cause}")]
pub struct LoadError {
    pub chunk_key: ChunkKey,
    #[source]
    pub cause: WarehouseError,
}

impl LoadError {
    pub fn new(chunk_key: &ChunkKey, cause: WarehouseError) -> Self {
        Self {
            chunk_key: chunk_key.clone(),
            cause,
        }
    }
}

impl Classify for LoadError {
    fn class(&self) -> ErrorClass {
        self.cause.class()
    }
}

/// The transform contract was violated. Never retried.
#[derive(Debug, Error)]
#[error("Transform failed for chunk {chunk_key}: {message}")]
pub struct TransformError {
    pub chunk_key: ChunkKey,
    pub message: String,
}

impl Classify for TransformError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Fatal
    }
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Staging IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Staging serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StagingError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Run state IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Run state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Run state database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Run {run_id} is locked by {holder}")]
    Locked { run_id: String, holder: String },

    #[error("Lease for run {lease_run_id} cannot write state of run {state_run_id}")]
    LeaseMismatch {
        lease_run_id: String,
        state_run_id: String,
    },
}

impl StateError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Run-level failure; chunk-level failures are recorded in the run report instead
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}
