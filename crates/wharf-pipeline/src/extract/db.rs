//! Watermark-driven Postgres source
//!
//! Each chunk is the range `(cursor, boundary]` of the watermark column, where
//! the boundary is the watermark of the `chunk.size`-th row after the cursor.
//! Every row sharing the boundary value lands in the same chunk, so a chunk
//! may exceed the configured size but no row is ever stranded between two
//! chunks.

use serde_json::{Map, Value as Json};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};
use std::time::Duration;
use tracing::debug;

use super::{into_raw_records, ChunkRead, Cursor};
use crate::config::DbSourceConfig;
use crate::error::{classify_sqlx, ConfigError, ErrorClass, ExtractionError};
use crate::load::postgres::quote_ident;
use crate::record::{Chunk, ChunkKey};

#[derive(Debug)]
pub struct DbSource {
    source_id: String,
    config: DbSourceConfig,
    chunk_size: usize,
    pool: PgPool,
}

impl DbSource {
    /// Build the source without opening a connection; the first read connects
    pub fn connect_lazy(
        source_id: impl Into<String>,
        config: DbSourceConfig,
        url: &str,
        chunk_size: usize,
    ) -> Result<Self, ConfigError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect_lazy(url)
            .map_err(|e| ConfigError::Invalid(format!("invalid source.db.url: {e}")))?;
        Self::with_pool(source_id, config, pool, chunk_size)
    }

    pub fn with_pool(
        source_id: impl Into<String>,
        config: DbSourceConfig,
        pool: PgPool,
        chunk_size: usize,
    ) -> Result<Self, ConfigError> {
        let cast_ok = !config.watermark_cast.is_empty()
            && config
                .watermark_cast
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ' ');
        if !cast_ok {
            return Err(ConfigError::Invalid(format!(
                "source.db.watermark_cast {:?} is not a plain type name",
                config.watermark_cast
            )));
        }

        Ok(Self {
            source_id: source_id.into(),
            config,
            chunk_size: chunk_size.max(1),
            pool,
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    fn relation(&self) -> String {
        format!("{}.{}", quote_ident(&self.config.schema), quote_ident(&self.config.table))
    }

    fn select_list(&self) -> String {
        if self.config.columns.is_empty() {
            return "*".to_string();
        }
        let mut columns: Vec<&str> = self.config.columns.iter().map(String::as_str).collect();
        if !columns.contains(&self.config.watermark_column.as_str()) {
            columns.push(&self.config.watermark_column);
        }
        columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
    }

    fn push_lower_bound(&self, query: &mut QueryBuilder<'_, Postgres>, lower: Option<&str>) {
        let mark = quote_ident(&self.config.watermark_column);
        query.push(format!(" WHERE {mark} IS NOT NULL"));
        if let Some(lower) = lower {
            query.push(format!(" AND {mark} > "));
            query.push_bind(lower.to_string());
            query.push(format!("::text::{}", self.config.watermark_cast));
        }
    }

    pub async fn next_chunk(&self, cursor: &Cursor, key: &ChunkKey) -> Result<ChunkRead, ExtractionError> {
        let lower = match cursor {
            Cursor::Origin => self.config.start_after.clone(),
            Cursor::Watermark { value } => Some(value.clone()),
            other => {
                return Err(ExtractionError::fatal(format!(
                    "cursor {other} is not valid for a database source"
                )))
            },
        };

        let mark = quote_ident(&self.config.watermark_column);
        let relation = self.relation();

        // Watermark of the chunk_size-th row past the cursor
        let mut boundary_query = QueryBuilder::<Postgres>::new(format!("SELECT {mark}::text FROM {relation}"));
        self.push_lower_bound(&mut boundary_query, lower.as_deref());
        boundary_query.push(format!(" ORDER BY {mark} OFFSET "));
        boundary_query.push_bind((self.chunk_size - 1) as i64);
        boundary_query.push(" LIMIT 1");

        let upper: Option<String> = boundary_query
            .build_query_scalar()
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_db)?;

        let mut rows_query = QueryBuilder::<Postgres>::new(format!(
            "SELECT row_to_json(s)::text AS row, s.{mark}::text AS mark FROM (SELECT {} FROM {relation}",
            self.select_list()
        ));
        self.push_lower_bound(&mut rows_query, lower.as_deref());
        if let Some(upper) = &upper {
            rows_query.push(format!(" AND {mark} <= "));
            rows_query.push_bind(upper.clone());
            rows_query.push(format!("::text::{}", self.config.watermark_cast));
        }
        rows_query.push(format!(") s ORDER BY s.{mark}"));

        let rows = rows_query.build().fetch_all(&self.pool).await.map_err(classify_db)?;
        if rows.is_empty() {
            return Ok(ChunkRead::EndOfSource);
        }

        let mut records: Vec<Map<String, Json>> = Vec::with_capacity(rows.len());
        let mut last_mark = None;
        for row in &rows {
            let text: String = row.try_get("row").map_err(classify_db)?;
            let json: Json = serde_json::from_str(&text)
                .map_err(|e| ExtractionError::malformed(format!("undecodable row: {e}")))?;
            let Json::Object(map) = json else {
                return Err(ExtractionError::malformed("row_to_json did not return an object"));
            };
            records.push(map);
            last_mark = row.try_get::<Option<String>, _>("mark").map_err(classify_db)?;
        }

        let next = match last_mark {
            Some(value) => Cursor::Watermark { value },
            None => return Err(ExtractionError::malformed("row without a watermark value")),
        };

        debug!(
            chunk = %key,
            rows = records.len(),
            lower = ?lower,
            upper = ?upper,
            "Read watermark range"
        );

        Ok(ChunkRead::Chunk {
            chunk: Chunk::new(key.clone(), into_raw_records(records, key, Some(relation))),
            next,
        })
    }
}

fn classify_db(err: sqlx::Error) -> ExtractionError {
    if let sqlx::Error::Database(db) = &err {
        let code = db.code().map(|c| c.to_string()).unwrap_or_default();
        // Authentication, permission and missing relations will not fix themselves
        if code.starts_with("28") || code.starts_with("42") {
            return ExtractionError::fatal(format!("database rejected query: {err}"));
        }
    }
    match &err {
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
            ExtractionError::malformed(format!("undecodable row: {err}"))
        },
        _ if classify_sqlx(&err) == ErrorClass::Retryable => ExtractionError::unavailable(err.to_string()),
        _ => ExtractionError::fatal(err.to_string()),
    }
}
