//! Load strategies
//!
//! A [`LoadStrategy`] decides how one chunk of clean rows lands in the target
//! table; the [`Warehouse`] backend owns the transaction that makes the chunk
//! all-or-nothing.

pub mod memory;
pub mod postgres;
mod warehouse;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::error::{LoadError, WarehouseError};
use crate::record::{ChunkKey, CleanRecord, TableSpec};

pub use memory::{Fault, MemoryWarehouse};
pub use postgres::PgWarehouse;
pub use warehouse::{
    effective_batch_size, index_name, max_watermark, shadow_table_name, validate_rows, CommitOutcome, Warehouse,
    MAX_BIND_PARAMS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// Insert every row; duplicates against a unique key fail the chunk
    #[default]
    Append,
    /// Swap the table contents for everything the run produced
    Replace,
    /// Insert or update by primary key
    Upsert,
    /// Append rows whose watermark exceeds the table's recorded watermark
    Incremental,
}

impl LoadStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStrategy::Append => "append",
            LoadStrategy::Replace => "replace",
            LoadStrategy::Upsert => "upsert",
            LoadStrategy::Incremental => "incremental",
        }
    }

    /// Table requirements of the strategy
    pub fn validate(&self, table: &TableSpec) -> Result<(), WarehouseError> {
        match self {
            LoadStrategy::Upsert if table.primary_key.is_empty() => Err(WarehouseError::SchemaMismatch {
                table: table.qualified_name(),
                detail: "upsert requires a primary key".into(),
            }),
            LoadStrategy::Incremental if table.watermark_column.is_none() => Err(WarehouseError::SchemaMismatch {
                table: table.qualified_name(),
                detail: "incremental load requires a watermark column".into(),
            }),
            _ => Ok(()),
        }
    }

    /// Apply one chunk in a single warehouse transaction
    pub async fn commit(
        &self,
        warehouse: &dyn Warehouse,
        table: &TableSpec,
        key: &ChunkKey,
        rows: &[CleanRecord],
        batch_size: usize,
    ) -> Result<CommitOutcome, LoadError> {
        let fail = |cause| LoadError::new(key, cause);

        self.validate(table).map_err(fail)?;
        let unique_keys = matches!(self, LoadStrategy::Upsert | LoadStrategy::Replace);
        validate_rows(table, rows, unique_keys).map_err(fail)?;

        let batch_size = effective_batch_size(batch_size, table.columns.len());
        let outcome = match self {
            LoadStrategy::Append => warehouse.append(table, key, rows, batch_size).await,
            LoadStrategy::Upsert => warehouse.upsert(table, key, rows, batch_size).await,
            LoadStrategy::Replace => warehouse.stage_replacement(table, key, rows, batch_size).await,
            LoadStrategy::Incremental => warehouse.append_incremental(table, key, rows, batch_size).await,
        }
        .map_err(fail)?;

        if outcome.already_committed {
            debug!(chunk = %key, strategy = self.as_str(), "Chunk already in warehouse ledger");
        } else {
            debug!(
                chunk = %key,
                strategy = self.as_str(),
                rows = outcome.rows_written,
                "Committed chunk"
            );
        }
        Ok(outcome)
    }

    /// Run-level completion once every chunk of the run has committed
    pub async fn finalize(&self, warehouse: &dyn Warehouse, table: &TableSpec, run_id: &str) -> Result<(), WarehouseError> {
        if *self != LoadStrategy::Replace {
            return Ok(());
        }

        match warehouse.swap_replacement(table, run_id).await? {
            Some(rows) => {
                info!(table = %table.qualified_name(), run_id, rows, "Replaced table contents");
            },
            None => {
                warn!(
                    table = %table.qualified_name(),
                    run_id,
                    "Replace run staged no rows, table left unchanged"
                );
            },
        }
        Ok(())
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "append" => Ok(LoadStrategy::Append),
            "replace" => Ok(LoadStrategy::Replace),
            "upsert" => Ok(LoadStrategy::Upsert),
            "incremental" => Ok(LoadStrategy::Incremental),
            other => Err(format!("Unknown load strategy: {other}")),
        }
    }
}
