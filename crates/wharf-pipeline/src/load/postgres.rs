//! Postgres warehouse
//!
//! Every chunk write runs in one transaction that:
//! 1. takes a transaction-scoped advisory lock on the target table
//! 2. claims the chunk key in `wharf_chunk_ledger` (a key already present
//!    makes the whole write a no-op)
//! 3. writes the rows in multi-row INSERT batches
//!
//! so a chunk is either fully visible together with its ledger entry or not
//! at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgDatabaseError, PgPool, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info};

use super::warehouse::{index_name, max_watermark, shadow_table_name, CommitOutcome, Warehouse};
use crate::config::WarehouseConfig;
use crate::error::WarehouseError;
use crate::record::{ChunkKey, CleanRecord, ColumnType, TableSpec, Value};

/// Quote an identifier for interpolation into SQL
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn relation(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

fn column_list(table: &TableSpec) -> String {
    table
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Map a database error onto the warehouse taxonomy
fn map_pg_error(table: &TableSpec, err: sqlx::Error) -> WarehouseError {
    if let sqlx::Error::Database(db) = &err {
        let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
        if code.starts_with("23") {
            let detail = db
                .try_downcast_ref::<PgDatabaseError>()
                .and_then(|pg| pg.detail())
                .map(str::to_string);
            return WarehouseError::ConstraintViolation {
                table: table.qualified_name(),
                detail: db.message().to_string(),
                offending: detail.into_iter().collect(),
            };
        }
        if matches!(code.as_str(), "42703" | "42P01" | "42804") {
            return WarehouseError::SchemaMismatch {
                table: table.qualified_name(),
                detail: db.message().to_string(),
            };
        }
    }
    WarehouseError::Database(err)
}

/// Bind one cell, typing NULLs by the declared column type
fn push_value(row: &mut Separated<'_, '_, Postgres, &'static str>, value: Option<&Value>, column_type: ColumnType) {
    match (value.unwrap_or(&Value::Null), column_type) {
        (Value::Null, ColumnType::Text) => {
            row.push_bind(None::<String>);
        },
        (Value::Null, ColumnType::Integer) => {
            row.push_bind(None::<i64>);
        },
        (Value::Null, ColumnType::Float) => {
            row.push_bind(None::<f64>);
        },
        (Value::Null, ColumnType::Boolean) => {
            row.push_bind(None::<bool>);
        },
        (Value::Null, ColumnType::Timestamp) => {
            row.push_bind(None::<DateTime<Utc>>);
        },
        (Value::Null, ColumnType::Json) => {
            row.push_bind(None::<Json<serde_json::Value>>);
        },
        (other, ColumnType::Json) => {
            row.push_bind(Json(other.to_json()));
        },
        (Value::Integer(i), ColumnType::Float) => {
            row.push_bind(*i as f64);
        },
        (Value::Integer(i), _) => {
            row.push_bind(*i);
        },
        (Value::Float(f), _) => {
            row.push_bind(*f);
        },
        (Value::Bool(b), _) => {
            row.push_bind(*b);
        },
        (Value::Timestamp(ts), _) => {
            row.push_bind(*ts);
        },
        (Value::Text(s), _) => {
            row.push_bind(s.clone());
        },
        (Value::Json(j), _) => {
            row.push_bind(Json(j.clone()));
        },
    }
}

fn column_type_of(data_type: &str) -> Option<ColumnType> {
    match data_type {
        "text" | "character varying" | "character" | "uuid" => Some(ColumnType::Text),
        "bigint" | "integer" | "smallint" => Some(ColumnType::Integer),
        "double precision" | "real" | "numeric" => Some(ColumnType::Float),
        "boolean" => Some(ColumnType::Boolean),
        "timestamp with time zone" | "timestamp without time zone" | "date" => Some(ColumnType::Timestamp),
        "jsonb" | "json" => Some(ColumnType::Json),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conflict {
    /// Any key collision fails the chunk
    Fail,
    /// Key collisions overwrite the existing row
    Update,
}

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(config: &WarehouseConfig) -> Result<Self, WarehouseError> {
        let url = config
            .resolved_url()
            .ok_or_else(|| WarehouseError::Fatal("no warehouse.url and DATABASE_URL is not set".into()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&url)
            .await
            .map_err(|e| WarehouseError::Unavailable(format!("cannot connect to warehouse: {e}")))?;

        info!(max_connections = config.max_connections, "Connected to warehouse");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger, watermark and run-state tables
    pub async fn migrate(&self) -> Result<(), WarehouseError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| WarehouseError::Fatal(format!("migration failed: {e}")))
    }

    async fn lock_table(tx: &mut Transaction<'_, Postgres>, table: &TableSpec) -> Result<(), WarehouseError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(table.qualified_name())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Record the chunk key; false when another transaction already committed it
    async fn claim_chunk(
        tx: &mut Transaction<'_, Postgres>,
        table: &TableSpec,
        key: &ChunkKey,
    ) -> Result<bool, WarehouseError> {
        let claimed = sqlx::query(
            r#"
            INSERT INTO wharf_chunk_ledger (table_name, run_id, source_id, sequence)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(table.qualified_name())
        .bind(&key.run_id)
        .bind(&key.source_id)
        .bind(key.sequence as i64)
        .execute(&mut **tx)
        .await?
        .rows_affected();
        Ok(claimed == 1)
    }

    async fn record_rows(
        tx: &mut Transaction<'_, Postgres>,
        table: &TableSpec,
        key: &ChunkKey,
        rows_written: u64,
    ) -> Result<(), WarehouseError> {
        sqlx::query(
            r#"
            UPDATE wharf_chunk_ledger SET rows_written = $5
            WHERE table_name = $1 AND run_id = $2 AND source_id = $3 AND sequence = $4
            "#,
        )
        .bind(table.qualified_name())
        .bind(&key.run_id)
        .bind(&key.source_id)
        .bind(key.sequence as i64)
        .bind(rows_written as i64)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_rows(
        tx: &mut Transaction<'_, Postgres>,
        target: &str,
        table: &TableSpec,
        rows: &[&CleanRecord],
        batch_size: usize,
        conflict: Conflict,
    ) -> Result<u64, WarehouseError> {
        let columns = column_list(table);
        let mut written = 0u64;

        for batch in rows.chunks(batch_size.max(1)) {
            let mut query = QueryBuilder::<Postgres>::new(format!("INSERT INTO {target} ({columns}) "));
            query.push_values(batch, |mut row, record| {
                for column in &table.columns {
                    push_value(&mut row, record.get(&column.name), column.column_type);
                }
            });

            if conflict == Conflict::Update && !table.primary_key.is_empty() {
                let keys = table
                    .primary_key
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let updates = table
                    .columns
                    .iter()
                    .filter(|c| !table.primary_key.contains(&c.name))
                    .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(&c.name)))
                    .collect::<Vec<_>>();
                if updates.is_empty() {
                    query.push(format!(" ON CONFLICT ({keys}) DO NOTHING"));
                } else {
                    query.push(format!(" ON CONFLICT ({keys}) DO UPDATE SET {}", updates.join(", ")));
                }
            }

            let result = query
                .build()
                .execute(&mut **tx)
                .await
                .map_err(|e| map_pg_error(table, e))?;
            written += batch.len() as u64;
            debug!(relation = target, batch = batch.len(), affected = result.rows_affected(), "Inserted batch");
        }

        Ok(written)
    }

    async fn write_chunk(
        &self,
        table: &TableSpec,
        key: &ChunkKey,
        rows: &[CleanRecord],
        batch_size: usize,
        target: &str,
        conflict: Conflict,
    ) -> Result<CommitOutcome, WarehouseError> {
        let mut tx = self.pool.begin().await?;
        Self::lock_table(&mut tx, table).await?;
        if !Self::claim_chunk(&mut tx, table, key).await? {
            tx.rollback().await?;
            return Ok(CommitOutcome::duplicate());
        }

        let selected: Vec<&CleanRecord> = rows.iter().collect();
        let written = Self::insert_rows(&mut tx, target, table, &selected, batch_size, conflict).await?;
        Self::record_rows(&mut tx, table, key, written).await?;
        tx.commit().await?;

        Ok(CommitOutcome::written(written))
    }

    fn shadow_relation(table: &TableSpec, run_id: &str) -> String {
        relation(&table.schema, &shadow_table_name(&table.name, run_id))
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn ensure_table(&self, table: &TableSpec) -> Result<(), WarehouseError> {
        let mut definitions: Vec<String> = table
            .columns
            .iter()
            .map(|c| {
                let null = if c.nullable { "" } else { " NOT NULL" };
                format!("{} {}{null}", quote_ident(&c.name), c.column_type.pg_type())
            })
            .collect();
        if !table.primary_key.is_empty() {
            let keys = table
                .primary_key
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            definitions.push(format!("PRIMARY KEY ({keys})"));
        }

        let mut tx = self.pool.begin().await?;
        Self::lock_table(&mut tx, table).await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&table.schema)))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            relation(&table.schema, &table.name),
            definitions.join(", ")
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_pg_error(table, e))?;
        tx.commit().await?;

        debug!(table = %table.qualified_name(), "Ensured table");
        Ok(())
    }

    async fn verify_schema(&self, table: &TableSpec) -> Result<(), WarehouseError> {
        let rows = sqlx::query(
            r#"
            SELECT column_name, data_type
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            "#,
        )
        .bind(&table.schema)
        .bind(&table.name)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(WarehouseError::SchemaMismatch {
                table: table.qualified_name(),
                detail: "table does not exist".into(),
            });
        }

        let mut existing = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("column_name")?;
            let data_type: String = row.try_get("data_type")?;
            existing.push((name, data_type));
        }

        for column in &table.columns {
            let Some((_, data_type)) = existing.iter().find(|(name, _)| name == &column.name) else {
                return Err(WarehouseError::SchemaMismatch {
                    table: table.qualified_name(),
                    detail: format!("column {:?} does not exist", column.name),
                });
            };
            if column_type_of(data_type) != Some(column.column_type) {
                return Err(WarehouseError::SchemaMismatch {
                    table: table.qualified_name(),
                    detail: format!(
                        "column {:?} is {data_type}, declared {:?}",
                        column.name, column.column_type
                    ),
                });
            }
        }
        Ok(())
    }

    async fn append(
        &self,
        table: &TableSpec,
        key: &ChunkKey,
        rows: &[CleanRecord],
        batch_size: usize,
    ) -> Result<CommitOutcome, WarehouseError> {
        let target = relation(&table.schema, &table.name);
        self.write_chunk(table, key, rows, batch_size, &target, Conflict::Fail).await
    }

    async fn upsert(
        &self,
        table: &TableSpec,
        key: &ChunkKey,
        rows: &[CleanRecord],
        batch_size: usize,
    ) -> Result<CommitOutcome, WarehouseError> {
        let target = relation(&table.schema, &table.name);
        self.write_chunk(table, key, rows, batch_size, &target, Conflict::Update).await
    }

    async fn stage_replacement(
        &self,
        table: &TableSpec,
        key: &ChunkKey,
        rows: &[CleanRecord],
        batch_size: usize,
    ) -> Result<CommitOutcome, WarehouseError> {
        let shadow = Self::shadow_relation(table, &key.run_id);
        let base = relation(&table.schema, &table.name);

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {shadow} (LIKE {base} INCLUDING DEFAULTS INCLUDING CONSTRAINTS INCLUDING INDEXES)"
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| map_pg_error(table, e))?;

        self.write_chunk(table, key, rows, batch_size, &shadow, Conflict::Update).await
    }

    async fn swap_replacement(&self, table: &TableSpec, run_id: &str) -> Result<Option<u64>, WarehouseError> {
        let shadow = Self::shadow_relation(table, run_id);
        let base = relation(&table.schema, &table.name);
        let columns = column_list(table);

        let mut tx = self.pool.begin().await?;
        Self::lock_table(&mut tx, table).await?;

        let exists: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(&shadow)
            .fetch_one(&mut *tx)
            .await?;
        if exists.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        // DELETE rather than TRUNCATE keeps concurrent readers on the old rows
        sqlx::query(&format!("DELETE FROM {base}")).execute(&mut *tx).await?;
        let copied = sqlx::query(&format!("INSERT INTO {base} ({columns}) SELECT {columns} FROM {shadow}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_pg_error(table, e))?
            .rows_affected();
        sqlx::query(&format!("DROP TABLE {shadow}")).execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(Some(copied))
    }

    async fn append_incremental(
        &self,
        table: &TableSpec,
        key: &ChunkKey,
        rows: &[CleanRecord],
        batch_size: usize,
    ) -> Result<CommitOutcome, WarehouseError> {
        let column = table.watermark_column.as_deref().ok_or_else(|| WarehouseError::SchemaMismatch {
            table: table.qualified_name(),
            detail: "incremental load requires a watermark column".into(),
        })?;
        let target = relation(&table.schema, &table.name);

        let mut tx = self.pool.begin().await?;
        Self::lock_table(&mut tx, table).await?;
        if !Self::claim_chunk(&mut tx, table, key).await? {
            tx.rollback().await?;
            return Ok(CommitOutcome::duplicate());
        }

        sqlx::query("INSERT INTO wharf_watermarks (table_name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(table.qualified_name())
            .execute(&mut *tx)
            .await?;
        let current: Option<Json<Value>> =
            sqlx::query_scalar("SELECT watermark FROM wharf_watermarks WHERE table_name = $1 FOR UPDATE")
                .bind(table.qualified_name())
                .fetch_one(&mut *tx)
                .await?;
        let current = current.map(|Json(v)| v);

        let fresh: Vec<&CleanRecord> = rows
            .iter()
            .filter(|r| r.get(column).is_some_and(|v| v.exceeds(current.as_ref())))
            .collect();
        let written = Self::insert_rows(&mut tx, &target, table, &fresh, batch_size, Conflict::Fail).await?;

        let watermark = match (max_watermark(fresh.iter().copied(), column), current) {
            (Some(new), Some(old)) if !new.exceeds(Some(&old)) => Some(old),
            (Some(new), _) => Some(new),
            (None, old) => old,
        };
        if let Some(mark) = &watermark {
            sqlx::query("UPDATE wharf_watermarks SET watermark = $2, updated_at = NOW() WHERE table_name = $1")
                .bind(table.qualified_name())
                .bind(Json(mark))
                .execute(&mut *tx)
                .await?;
        }
        Self::record_rows(&mut tx, table, key, written).await?;
        tx.commit().await?;

        Ok(CommitOutcome {
            rows_written: written,
            already_committed: false,
            watermark,
        })
    }

    async fn watermark(&self, table: &TableSpec) -> Result<Option<Value>, WarehouseError> {
        let mark: Option<Option<Json<Value>>> =
            sqlx::query_scalar("SELECT watermark FROM wharf_watermarks WHERE table_name = $1")
                .bind(table.qualified_name())
                .fetch_optional(&self.pool)
                .await?;
        Ok(mark.flatten().map(|Json(v)| v))
    }

    async fn create_indexes(&self, table: &TableSpec, columns: &[String]) -> Result<(), WarehouseError> {
        let base = relation(&table.schema, &table.name);
        for column in columns {
            let name = quote_ident(&index_name(&table.name, column));
            sqlx::query(&format!("CREATE INDEX IF NOT EXISTS {name} ON {base} ({})", quote_ident(column)))
                .execute(&self.pool)
                .await
                .map_err(|e| map_pg_error(table, e))?;
            debug!(table = %table.qualified_name(), column = %column, "Ensured index");
        }
        Ok(())
    }

    async fn row_count(&self, table: &TableSpec) -> Result<u64, WarehouseError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {}",
            relation(&table.schema, &table.name)
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_pg_error(table, e))?;
        Ok(count as u64)
    }

    async fn is_committed(&self, table: &TableSpec, key: &ChunkKey) -> Result<bool, WarehouseError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM wharf_chunk_ledger
                WHERE table_name = $1 AND run_id = $2 AND source_id = $3 AND sequence = $4
            )
            "#,
        )
        .bind(table.qualified_name())
        .bind(&key.run_id)
        .bind(&key.source_id)
        .bind(key.sequence as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn forget_run(&self, table: &TableSpec, run_id: &str) -> Result<u64, WarehouseError> {
        let mut tx = self.pool.begin().await?;
        Self::lock_table(&mut tx, table).await?;
        let removed = sqlx::query("DELETE FROM wharf_chunk_ledger WHERE table_name = $1 AND run_id = $2")
            .bind(table.qualified_name())
            .bind(run_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", Self::shadow_relation(table, run_id)))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }
}
