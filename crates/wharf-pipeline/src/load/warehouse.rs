//! Warehouse backend abstraction

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use wharf_common::checksum::short_digest;

use crate::error::WarehouseError;
use crate::record::{ChunkKey, CleanRecord, TableSpec, Value};

/// Postgres caps a statement at 65 535 bind parameters
pub const MAX_BIND_PARAMS: usize = 65_000;

/// Postgres truncates identifiers beyond 63 bytes
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Effect of committing one chunk
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub rows_written: u64,
    /// The chunk ledger already held this key; nothing was written
    pub already_committed: bool,
    /// Table watermark after the commit, for incremental loads
    pub watermark: Option<Value>,
}

impl CommitOutcome {
    pub fn written(rows_written: u64) -> Self {
        Self {
            rows_written,
            ..Self::default()
        }
    }

    pub fn duplicate() -> Self {
        Self {
            already_committed: true,
            ..Self::default()
        }
    }
}

/// A relational target.
///
/// Every chunk-level write runs in one transaction that also records the chunk
/// key in a ledger; a key already in the ledger makes the write a no-op.
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create the table when it does not exist
    async fn ensure_table(&self, table: &TableSpec) -> Result<(), WarehouseError>;

    /// Fail with `SchemaMismatch` unless the table exists with every declared column
    async fn verify_schema(&self, table: &TableSpec) -> Result<(), WarehouseError>;

    async fn append(
        &self,
        table: &TableSpec,
        key: &ChunkKey,
        rows: &[CleanRecord],
        batch_size: usize,
    ) -> Result<CommitOutcome, WarehouseError>;

    async fn upsert(
        &self,
        table: &TableSpec,
        key: &ChunkKey,
        rows: &[CleanRecord],
        batch_size: usize,
    ) -> Result<CommitOutcome, WarehouseError>;

    /// Write rows into the run's shadow copy of `table`
    async fn stage_replacement(
        &self,
        table: &TableSpec,
        key: &ChunkKey,
        rows: &[CleanRecord],
        batch_size: usize,
    ) -> Result<CommitOutcome, WarehouseError>;

    /// Atomically replace the contents of `table` with the run's shadow copy.
    ///
    /// Returns the new row count, or `None` when the run staged nothing.
    async fn swap_replacement(&self, table: &TableSpec, run_id: &str) -> Result<Option<u64>, WarehouseError>;

    /// Append rows above the table watermark and advance it
    async fn append_incremental(
        &self,
        table: &TableSpec,
        key: &ChunkKey,
        rows: &[CleanRecord],
        batch_size: usize,
    ) -> Result<CommitOutcome, WarehouseError>;

    async fn watermark(&self, table: &TableSpec) -> Result<Option<Value>, WarehouseError>;

    async fn create_indexes(&self, table: &TableSpec, columns: &[String]) -> Result<(), WarehouseError>;

    async fn row_count(&self, table: &TableSpec) -> Result<u64, WarehouseError>;

    async fn is_committed(&self, table: &TableSpec, key: &ChunkKey) -> Result<bool, WarehouseError>;

    /// Drop ledger entries and shadow data of a run; returns ledger entries removed
    async fn forget_run(&self, table: &TableSpec, run_id: &str) -> Result<u64, WarehouseError>;
}

/// Rows per INSERT so that `rows * columns` stays under the bind limit
pub fn effective_batch_size(batch_size: usize, columns: usize) -> usize {
    let ceiling = MAX_BIND_PARAMS / columns.max(1);
    batch_size.clamp(1, ceiling.max(1))
}

fn truncate_identifier(mut name: String) -> String {
    if name.len() > MAX_IDENTIFIER_LEN {
        let mut cut = MAX_IDENTIFIER_LEN;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    name
}

/// Name of the table a replace run writes into before the swap
pub fn shadow_table_name(table: &str, run_id: &str) -> String {
    let suffix = format!("__shadow_{}", short_digest(run_id, 12));
    let keep = MAX_IDENTIFIER_LEN.saturating_sub(suffix.len());
    let mut base = table.to_string();
    if base.len() > keep {
        let mut cut = keep;
        while !base.is_char_boundary(cut) {
            cut -= 1;
        }
        base.truncate(cut);
    }
    format!("{base}{suffix}")
}

/// `idx_<table>_<column>`, truncated to a valid identifier
pub fn index_name(table: &str, column: &str) -> String {
    truncate_identifier(format!("idx_{table}_{column}"))
}

/// Check rows against the declared schema before anything is written.
///
/// With `unique_keys`, a primary key appearing twice within the rows is a
/// constraint violation.
pub fn validate_rows(table: &TableSpec, rows: &[CleanRecord], unique_keys: bool) -> Result<(), WarehouseError> {
    for (index, row) in rows.iter().enumerate() {
        for column in row.columns() {
            if table.column(column).is_none() {
                return Err(WarehouseError::SchemaMismatch {
                    table: table.qualified_name(),
                    detail: format!("row {index} has undeclared column {column:?}"),
                });
            }
        }
        for spec in &table.columns {
            let value = row.get(&spec.name).unwrap_or(&Value::Null);
            if !value.fits(spec.column_type) {
                return Err(WarehouseError::SchemaMismatch {
                    table: table.qualified_name(),
                    detail: format!(
                        "row {index} column {:?} holds {value:?}, declared {:?}",
                        spec.name, spec.column_type
                    ),
                });
            }
            if value.is_null() && !spec.nullable {
                return Err(WarehouseError::ConstraintViolation {
                    table: table.qualified_name(),
                    detail: format!("row {index} column {:?} is null", spec.name),
                    offending: vec![row.summary()],
                });
            }
        }
    }

    if unique_keys && !table.primary_key.is_empty() {
        let mut seen = HashSet::with_capacity(rows.len());
        for row in rows {
            if let Some(key) = table.key_of(row) {
                if !seen.insert(key.clone()) {
                    return Err(WarehouseError::ConstraintViolation {
                        table: table.qualified_name(),
                        detail: format!("primary key ({}) appears twice in one chunk", key.join(", ")),
                        offending: vec![row.summary()],
                    });
                }
            }
        }
    }

    Ok(())
}

/// Largest watermark value among `rows`
pub fn max_watermark<'a>(rows: impl IntoIterator<Item = &'a CleanRecord>, column: &str) -> Option<Value> {
    rows.into_iter()
        .filter_map(|r| r.get(column))
        .filter(|v| !v.is_null())
        .fold(None, |best: Option<&Value>, v| match best {
            Some(b) if !v.exceeds(Some(b)) => Some(b),
            _ => Some(v),
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ColumnSpec, ColumnType};

    fn table() -> TableSpec {
        TableSpec::new(
            "orders",
            vec![
                ColumnSpec::new("id", ColumnType::Integer).not_null(),
                ColumnSpec::new("amount", ColumnType::Float),
            ],
        )
        .with_primary_key(["id"])
    }

    #[test]
    fn test_batch_size_respects_bind_limit() {
        assert_eq!(effective_batch_size(500, 10), 500);
        assert_eq!(effective_batch_size(100_000, 10), 6_500);
        assert_eq!(effective_batch_size(0, 3), 1);
    }

    #[test]
    fn test_shadow_names_fit_identifier_limit() {
        let long = "a".repeat(80);
        let name = shadow_table_name(&long, "run-1");
        assert!(name.len() <= MAX_IDENTIFIER_LEN);
        assert_ne!(name, shadow_table_name(&long, "run-2"));
        assert!(shadow_table_name("orders", "run-1").starts_with("orders__shadow_"));
    }

    #[test]
    fn test_undeclared_column_is_schema_mismatch() {
        let rows = vec![CleanRecord::new().with("id", Value::Integer(1)).with("tax", Value::Float(0.2))];
        assert!(matches!(
            validate_rows(&table(), &rows, false),
            Err(WarehouseError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_wrong_kind_is_schema_mismatch() {
        let rows = vec![CleanRecord::new().with("id", Value::Text("x".into()))];
        assert!(matches!(
            validate_rows(&table(), &rows, false),
            Err(WarehouseError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_duplicate_keys_in_chunk() {
        let rows = vec![
            CleanRecord::new().with("id", Value::Integer(1)),
            CleanRecord::new().with("id", Value::Integer(1)),
        ];
        assert!(validate_rows(&table(), &rows, false).is_ok());
        match validate_rows(&table(), &rows, true) {
            Err(WarehouseError::ConstraintViolation { offending, .. }) => assert_eq!(offending.len(), 1),
            other => panic!("expected constraint violation, got {other:?}"),
        }
    }

    #[test]
    fn test_max_watermark() {
        let rows = vec![
            CleanRecord::new().with("v", Value::Integer(3)),
            CleanRecord::new().with("v", Value::Null),
            CleanRecord::new().with("v", Value::Integer(9)),
            CleanRecord::new().with("v", Value::Integer(5)),
        ];
        assert_eq!(max_watermark(&rows, "v"), Some(Value::Integer(9)));
        assert_eq!(max_watermark(&[], "v"), None);
    }
}
