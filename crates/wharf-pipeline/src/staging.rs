//! Filesystem staging area for raw chunks
//!
//! Layout: `<root>/<run>/<source>/<sequence>.chunk`, with an empty
//! `<sequence>.committed` marker dropped next to a chunk once the warehouse
//! has it. A chunk file is one header line followed by the JSON payload:
//!
//! ```text
//! wharf-chunk 1 <payload bytes> <sha256 of payload>
//! {"key": ..., "records": [...]}
//! ```
//!
//! Files are written to a temporary name and renamed into place, so a reader
//! sees either the previous version or the complete new one. A torn or
//! tampered file fails the length or checksum check and is discarded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use wharf_common::checksum::{digest_bytes, verify_bytes, ChecksumAlgorithm};

use crate::error::StagingError;
use crate::extract::Cursor;
use crate::record::{ChunkKey, RawRecord};

const MAGIC: &str = "wharf-chunk";
const FORMAT_VERSION: u32 = 1;
const CHUNK_EXT: &str = "chunk";
const COMMITTED_EXT: &str = "committed";
const TEMP_EXT: &str = "tmp";

/// A raw chunk together with the cursors that bracket it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedChunk {
    pub key: ChunkKey,
    /// Cursor the chunk was read from
    pub start_cursor: Cursor,
    /// Cursor of the following chunk
    pub next_cursor: Cursor,
    pub records: Vec<RawRecord>,
    pub staged_at: DateTime<Utc>,
}

impl StagedChunk {
    pub fn new(key: ChunkKey, start_cursor: Cursor, next_cursor: Cursor, records: Vec<RawRecord>) -> Self {
        Self {
            key,
            start_cursor,
            next_cursor,
            records,
            staged_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StagingSink {
    root: PathBuf,
}

/// Path component safe for any filesystem
pub(crate) fn path_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{cleaned}"),
        _ => cleaned,
    }
}

impl StagingSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(path_segment(run_id))
    }

    fn source_dir(&self, key: &ChunkKey) -> PathBuf {
        self.run_dir(&key.run_id).join(path_segment(&key.source_id))
    }

    pub fn chunk_path(&self, key: &ChunkKey) -> PathBuf {
        self.source_dir(key).join(format!("{:010}.{CHUNK_EXT}", key.sequence))
    }

    fn marker_path(&self, key: &ChunkKey) -> PathBuf {
        self.source_dir(key).join(format!("{:010}.{COMMITTED_EXT}", key.sequence))
    }

    /// Stage a chunk, replacing any earlier copy with the same key
    pub async fn put(&self, chunk: &StagedChunk) -> Result<PathBuf, StagingError> {
        let dir = self.source_dir(&chunk.key);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StagingError::io(&dir, e))?;

        let payload = serde_json::to_vec(chunk)?;
        let digest = digest_bytes(&payload, ChecksumAlgorithm::Sha256);
        let mut contents = format!("{MAGIC} {FORMAT_VERSION} {} {digest}\n", payload.len()).into_bytes();
        contents.extend_from_slice(&payload);

        let target = self.chunk_path(&chunk.key);
        let temp = dir.join(format!(
            "{:010}.{}.{TEMP_EXT}",
            chunk.key.sequence,
            uuid::Uuid::new_v4().simple()
        ));

        write_synced(&temp, &contents).await?;
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StagingError::io(&target, e));
        }

        debug!(chunk = %chunk.key, records = chunk.records.len(), bytes = contents.len(), "Staged chunk");
        Ok(target)
    }

    /// Staged copy of `key`, or `None` when absent or unreadable
    pub async fn get(&self, key: &ChunkKey) -> Result<Option<StagedChunk>, StagingError> {
        let path = self.chunk_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StagingError::io(&path, e)),
        };

        match parse_chunk_file(&bytes) {
            Ok(chunk) if chunk.key == *key => Ok(Some(chunk)),
            Ok(chunk) => {
                warn!(path = %path.display(), found = %chunk.key, "Staged chunk has a foreign key, discarding");
                self.discard(&path).await;
                Ok(None)
            },
            Err(reason) => {
                warn!(path = %path.display(), reason = %reason, "Discarding corrupt staged chunk");
                self.discard(&path).await;
                Ok(None)
            },
        }
    }

    async fn discard(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove staged chunk");
            }
        }
    }

    pub async fn mark_committed(&self, key: &ChunkKey) -> Result<(), StagingError> {
        let marker = self.marker_path(key);
        if let Some(dir) = marker.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StagingError::io(dir, e))?;
        }
        tokio::fs::write(&marker, b"")
            .await
            .map_err(|e| StagingError::io(&marker, e))
    }

    pub async fn is_committed(&self, key: &ChunkKey) -> bool {
        tokio::fs::try_exists(self.marker_path(key)).await.unwrap_or(false)
    }

    /// Staged chunks of a run without a commit marker, in (source, sequence) order.
    ///
    /// Keys come from the staged files themselves since directory names are
    /// sanitised. Corrupt chunk files and leftover temporary files from
    /// interrupted writes are removed on the way.
    pub async fn list_uncommitted(&self, run_id: &str) -> Result<Vec<ChunkKey>, StagingError> {
        let run_dir = self.run_dir(run_id);
        let mut sources = match tokio::fs::read_dir(&run_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StagingError::io(&run_dir, e)),
        };

        let mut keys = Vec::new();
        while let Some(source) = sources.next_entry().await.map_err(|e| StagingError::io(&run_dir, e))? {
            let source_path = source.path();
            if !source_path.is_dir() {
                continue;
            }

            let mut entries = tokio::fs::read_dir(&source_path)
                .await
                .map_err(|e| StagingError::io(&source_path, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StagingError::io(&source_path, e))?
            {
                let path = entry.path();
                match path.extension().and_then(|e| e.to_str()) {
                    Some(TEMP_EXT) => {
                        debug!(path = %path.display(), "Removing leftover temp file");
                        self.discard(&path).await;
                    },
                    Some(CHUNK_EXT) => {
                        if tokio::fs::try_exists(path.with_extension(COMMITTED_EXT))
                            .await
                            .unwrap_or(false)
                        {
                            continue;
                        }
                        if let Some(key) = self.staged_key(&path).await? {
                            keys.push(key);
                        }
                    },
                    _ => {},
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn staged_key(&self, path: &Path) -> Result<Option<ChunkKey>, StagingError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StagingError::io(path, e)),
        };
        match parse_chunk_file(&bytes) {
            Ok(chunk) if self.chunk_path(&chunk.key) == path => Ok(Some(chunk.key)),
            Ok(chunk) => {
                warn!(path = %path.display(), found = %chunk.key, "Staged chunk has a foreign key, discarding");
                self.discard(path).await;
                Ok(None)
            },
            Err(reason) => {
                warn!(path = %path.display(), reason = %reason, "Discarding corrupt staged chunk");
                self.discard(path).await;
                Ok(None)
            },
        }
    }

    /// Remove everything staged for a run
    pub async fn purge_run(&self, run_id: &str) -> Result<(), StagingError> {
        let dir = self.run_dir(run_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StagingError::io(&dir, e)),
        }
    }
}

async fn write_synced(path: &Path, contents: &[u8]) -> Result<(), StagingError> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| StagingError::io(path, e))?;
    file.write_all(contents).await.map_err(|e| StagingError::io(path, e))?;
    file.sync_all().await.map_err(|e| StagingError::io(path, e))
}

fn parse_chunk_file(bytes: &[u8]) -> Result<StagedChunk, String> {
    let newline = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| "missing header line".to_string())?;
    let header = std::str::from_utf8(&bytes[..newline]).map_err(|_| "header is not UTF-8".to_string())?;
    let payload = &bytes[newline + 1..];

    let parts: Vec<&str> = header.split(' ').collect();
    let [magic, version, length, digest] = parts.as_slice() else {
        return Err(format!("malformed header {header:?}"));
    };
    if *magic != MAGIC {
        return Err(format!("unexpected magic {magic:?}"));
    }
    if version.parse::<u32>().ok() != Some(FORMAT_VERSION) {
        return Err(format!("unsupported format version {version}"));
    }
    let expected_len: usize = length.parse().map_err(|_| format!("bad length {length:?}"))?;
    if payload.len() != expected_len {
        return Err(format!("payload is {} bytes, header says {expected_len}", payload.len()));
    }
    verify_bytes(payload, digest, ChecksumAlgorithm::Sha256).map_err(|e| e.to_string())?;

    serde_json::from_slice(payload).map_err(|e| format!("undecodable payload: {e}"))
}
