//! Delimited-file source
//!
//! Files are decoded once into text using the encoding stored in the cursor (or
//! detected on first touch), then read in row ranges addressed by byte offsets
//! into that decoded text.

use csv::{ReaderBuilder, StringRecord};
use encoding_rs::Encoding;
use serde_json::{Map, Value as Json};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::encoding::{decode, detect_encoding, resolve_label};
use super::{into_raw_records, ChunkRead, Cursor};
use crate::config::FileSourceConfig;
use crate::error::{ConfigError, ExtractionError};
use crate::record::{Chunk, ChunkKey};

#[derive(Debug)]
pub struct FileSource {
    source_id: String,
    config: FileSourceConfig,
    delimiter: u8,
    fallback: &'static Encoding,
    chunk_size: usize,
    cache: Mutex<Option<Arc<DecodedFile>>>,
}

/// A file decoded to text, with its header row resolved
#[derive(Debug)]
struct DecodedFile {
    index: usize,
    encoding: &'static Encoding,
    name: String,
    text: String,
    headers: Option<Vec<String>>,
    /// Offset of the first data row
    data_start: usize,
}

impl FileSource {
    pub fn new(source_id: impl Into<String>, config: FileSourceConfig, chunk_size: usize) -> Result<Self, ConfigError> {
        let delimiter = config.delimiter_byte()?;
        let fallback = Encoding::for_label(config.fallback_encoding.as_bytes()).ok_or_else(|| {
            ConfigError::Invalid(format!("unknown fallback encoding {:?}", config.fallback_encoding))
        })?;

        Ok(Self {
            source_id: source_id.into(),
            config,
            delimiter,
            fallback,
            chunk_size: chunk_size.max(1),
            cache: Mutex::new(None),
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub async fn next_chunk(&self, cursor: &Cursor, key: &ChunkKey) -> Result<ChunkRead, ExtractionError> {
        let (mut index, mut offset, mut row, mut encoding) = match cursor {
            Cursor::Origin => (0, 0, 0, None),
            Cursor::File {
                file_index,
                byte_offset,
                row,
                encoding,
            } => (*file_index, *byte_offset as usize, *row, encoding.clone()),
            other => {
                return Err(ExtractionError::fatal(format!(
                    "cursor {other} is not valid for a file source"
                )))
            },
        };

        loop {
            if index >= self.config.paths.len() {
                return Ok(ChunkRead::EndOfSource);
            }

            let file = self.decoded(index, encoding.as_deref()).await?;
            let start = if offset == 0 { file.data_start } else { offset };
            let (rows, end) = self.read_rows(&file, start, row)?;

            if rows.is_empty() {
                debug!(file = %file.name, "File exhausted, moving to next file");
                index += 1;
                offset = 0;
                row = 0;
                encoding = None;
                continue;
            }

            let rows_read = rows.len() as u64;
            let next = if end < file.text.len() {
                Cursor::File {
                    file_index: index,
                    byte_offset: end as u64,
                    row: row + rows_read,
                    encoding: Some(file.encoding.name().to_string()),
                }
            } else if index + 1 < self.config.paths.len() {
                Cursor::File {
                    file_index: index + 1,
                    byte_offset: 0,
                    row: 0,
                    encoding: None,
                }
            } else {
                Cursor::Exhausted
            };

            debug!(chunk = %key, file = %file.name, rows = rows_read, next = %next, "Read file chunk");
            let records = into_raw_records(rows, key, Some(file.name.clone()));
            return Ok(ChunkRead::Chunk {
                chunk: Chunk::new(key.clone(), records),
                next,
            });
        }
    }

    /// Decoded contents of file `index`, reusing the cached copy when it matches
    async fn decoded(&self, index: usize, label: Option<&str>) -> Result<Arc<DecodedFile>, ExtractionError> {
        let wanted = label.map(resolve_label).transpose()?;

        let mut cache = self.cache.lock().await;
        if let Some(file) = cache.as_ref() {
            if file.index == index && wanted.map_or(true, |e| e == file.encoding) {
                return Ok(Arc::clone(file));
            }
        }

        let path = &self.config.paths[index];
        let bytes = tokio::fs::read(path).await.map_err(|e| classify_io(path, e))?;

        let encoding = match wanted.or(self.configured_encoding()?) {
            Some(encoding) => encoding,
            None => {
                let detected = detect_encoding(&bytes, self.config.sniff_bytes, self.fallback);
                info!(
                    file = %path.display(),
                    encoding = detected.encoding.name(),
                    method = ?detected.method,
                    "Resolved file encoding"
                );
                detected.encoding
            },
        };

        let text = decode(&bytes, encoding).map_err(|e| ExtractionError::malformed(format!("{}: {}", path.display(), e.message)))?;
        let (headers, data_start) = if self.config.has_headers {
            self.read_headers(&text, path)?
        } else {
            (None, 0)
        };

        let file = Arc::new(DecodedFile {
            index,
            encoding,
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            text,
            headers,
            data_start,
        });
        *cache = Some(Arc::clone(&file));
        Ok(file)
    }

    fn configured_encoding(&self) -> Result<Option<&'static Encoding>, ExtractionError> {
        self.config.encoding.as_deref().map(resolve_label).transpose()
    }

    fn reader<'a>(&self, text: &'a str) -> csv::Reader<&'a [u8]> {
        ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes())
    }

    fn read_headers(&self, text: &str, path: &Path) -> Result<(Option<Vec<String>>, usize), ExtractionError> {
        let mut reader = self.reader(text);
        let mut record = StringRecord::new();
        let found = reader
            .read_record(&mut record)
            .map_err(|e| ExtractionError::malformed(format!("{}: bad header row: {e}", path.display())))?;
        if !found {
            return Ok((Some(Vec::new()), text.len()));
        }
        let headers = record.iter().map(|h| h.trim().to_string()).collect();
        Ok((Some(headers), reader.position().byte() as usize))
    }

    /// Up to `chunk_size` rows starting at `start`, plus the offset after the last one
    fn read_rows(
        &self,
        file: &DecodedFile,
        start: usize,
        first_row: u64,
    ) -> Result<(Vec<Map<String, Json>>, usize), ExtractionError> {
        let slice = file.text.get(start..).ok_or_else(|| {
            ExtractionError::malformed(format!(
                "{}: offset {start} is outside the decoded file",
                file.name
            ))
        })?;

        let mut reader = self.reader(slice);
        let mut record = StringRecord::new();
        let mut rows = Vec::with_capacity(self.chunk_size);
        let mut end = start;

        while rows.len() < self.chunk_size {
            let found = reader.read_record(&mut record).map_err(|e| {
                ExtractionError::malformed(format!("{}: row {}: {e}", file.name, first_row + rows.len() as u64 + 1))
            })?;
            if !found {
                break;
            }

            let row_number = first_row + rows.len() as u64 + 1;
            let mut fields = Map::with_capacity(record.len());
            match &file.headers {
                Some(headers) => {
                    if record.len() != headers.len() {
                        return Err(ExtractionError::malformed(format!(
                            "{}: row {row_number} has {} fields, header has {}",
                            file.name,
                            record.len(),
                            headers.len()
                        )));
                    }
                    for (name, value) in headers.iter().zip(record.iter()) {
                        fields.insert(name.clone(), Json::String(value.to_string()));
                    }
                },
                None => {
                    for (i, value) in record.iter().enumerate() {
                        fields.insert(format!("column_{}", i + 1), Json::String(value.to_string()));
                    }
                },
            }
            rows.push(fields);
            end = start + reader.position().byte() as usize;
        }

        Ok((rows, end))
    }
}

fn classify_io(path: &Path, err: std::io::Error) -> ExtractionError {
    let message = format!("{}: {err}", path.display());
    match err.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::InvalidInput => ExtractionError::fatal(message),
        ErrorKind::InvalidData => ExtractionError::malformed(message),
        _ => ExtractionError::unavailable(message),
    }
}
