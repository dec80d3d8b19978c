//! Source readers
//!
//! Each reader turns a [`Cursor`] into one chunk of raw records plus the cursor
//! of the following chunk. Readers hold no progress of their own; the
//! coordinator persists the cursor, so any reader can resume from any point it
//! previously returned.

pub mod api;
pub mod db;
pub mod encoding;
pub mod file;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{PipelineConfig, SourceKind};
use crate::error::{ConfigError, ExtractionError};
use crate::record::{Chunk, ChunkKey, Provenance, RawRecord};

pub use api::ApiSource;
pub use db::DbSource;
pub use file::FileSource;

/// Position within a source
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cursor {
    /// Source-specific start
    #[default]
    Origin,
    Page {
        page: u64,
    },
    Offset {
        offset: u64,
    },
    Token {
        token: String,
    },
    File {
        file_index: usize,
        /// Offset into the decoded text of the file; 0 means before the header row
        byte_offset: u64,
        /// Data rows already read from this file
        row: u64,
        /// Encoding resolved for this file, reused for every later chunk
        encoding: Option<String>,
    },
    /// Last watermark value read, rendered as text
    Watermark {
        value: String,
    },
    /// Nothing left; the next read reports end of source without touching it
    Exhausted,
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Origin => f.write_str("origin"),
            Cursor::Page { page } => write!(f, "page {page}"),
            Cursor::Offset { offset } => write!(f, "offset {offset}"),
            Cursor::Token { token } => write!(f, "token {token}"),
            Cursor::File {
                file_index, byte_offset, ..
            } => write!(f, "file {file_index} @ {byte_offset}"),
            Cursor::Watermark { value } => write!(f, "watermark {value}"),
            Cursor::Exhausted => f.write_str("exhausted"),
        }
    }
}

/// Result of one read
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkRead {
    Chunk { chunk: Chunk<RawRecord>, next: Cursor },
    EndOfSource,
}

/// Closed set of source kinds, dispatched by configuration
#[derive(Debug)]
pub enum SourceReader {
    Api(ApiSource),
    File(FileSource),
    Db(DbSource),
}

impl SourceReader {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        let source_id = config.source_id();
        let chunk_size = config.chunk.size;
        let missing = |section: &str| ConfigError::Invalid(format!("missing [source.{section}] section"));

        match config.source.kind {
            SourceKind::Api => {
                let api = config.source.api.clone().ok_or_else(|| missing("api"))?;
                Ok(SourceReader::Api(ApiSource::new(source_id, api, chunk_size)?))
            },
            SourceKind::File => {
                let file = config.source.file.clone().ok_or_else(|| missing("file"))?;
                Ok(SourceReader::File(FileSource::new(source_id, file, chunk_size)?))
            },
            SourceKind::Db => {
                let db = config.source.db.clone().ok_or_else(|| missing("db"))?;
                let url = db
                    .url
                    .clone()
                    .or_else(|| config.warehouse.resolved_url())
                    .ok_or_else(|| ConfigError::Invalid("source.db.url or warehouse.url is required".into()))?;
                Ok(SourceReader::Db(DbSource::connect_lazy(source_id, db, &url, chunk_size)?))
            },
        }
    }

    pub fn source_id(&self) -> &str {
        match self {
            SourceReader::Api(s) => s.source_id(),
            SourceReader::File(s) => s.source_id(),
            SourceReader::Db(s) => s.source_id(),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            SourceReader::Api(_) => SourceKind::Api,
            SourceReader::File(_) => SourceKind::File,
            SourceReader::Db(_) => SourceKind::Db,
        }
    }

    /// Whether a chunk that failed to load may be passed over while later chunks proceed.
    ///
    /// Watermark-driven sources are strictly sequential.
    pub fn independent_chunks(&self) -> bool {
        !matches!(self, SourceReader::Db(_))
    }

    /// Cursor of the chunk after the one starting at `cursor`, when it can be
    /// computed without reading the chunk
    pub fn skip_cursor(&self, cursor: &Cursor) -> Option<Cursor> {
        match self {
            SourceReader::Api(s) => s.skip_cursor(cursor),
            SourceReader::File(_) | SourceReader::Db(_) => None,
        }
    }

    /// Read the chunk starting at `cursor` under the identity `key`
    pub async fn next_chunk(&self, cursor: &Cursor, key: &ChunkKey) -> Result<ChunkRead, ExtractionError> {
        if *cursor == Cursor::Exhausted {
            return Ok(ChunkRead::EndOfSource);
        }

        let read = match self {
            SourceReader::Api(s) => s.next_chunk(cursor, key).await,
            SourceReader::File(s) => s.next_chunk(cursor, key).await,
            SourceReader::Db(s) => s.next_chunk(cursor, key).await,
        };
        read.map_err(|e| e.for_chunk(key))
    }
}

/// Provenance stamped on every record of the chunk being read
pub(crate) fn provenance(key: &ChunkKey, origin: Option<String>) -> Provenance {
    Provenance {
        source_id: key.source_id.clone(),
        extracted_at: Utc::now(),
        sequence: key.sequence,
        origin,
    }
}

pub(crate) fn into_raw_records(
    rows: Vec<serde_json::Map<String, serde_json::Value>>,
    key: &ChunkKey,
    origin: Option<String>,
) -> Vec<RawRecord> {
    let provenance = provenance(key, origin);
    rows.into_iter()
        .map(|fields| RawRecord::new(fields, provenance.clone()))
        .collect()
}
