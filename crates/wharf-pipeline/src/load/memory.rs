//! In-process warehouse
//!
//! Backs dry runs and tests. A write works on a copy of the whole store and
//! swaps it in only on success, which gives the same all-or-nothing chunk
//! semantics as a database transaction. Faults can be injected to fail a
//! given chunk or the replace swap part-way through.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::warehouse::{max_watermark, shadow_table_name, validate_rows, CommitOutcome, Warehouse};
use crate::error::{ErrorClass, WarehouseError};
use crate::record::{ChunkKey, CleanRecord, TableSpec, Value};

/// Where an injected fault fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    /// Any chunk write with this sequence number
    Chunk(u64),
    /// The replace swap
    Swap,
}

/// A failure the memory warehouse raises on purpose
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub point: FaultPoint,
    pub class: ErrorClass,
    /// How many matching operations fail before the fault is spent
    pub remaining: u32,
}

impl Fault {
    pub fn chunk(sequence: u64, class: ErrorClass) -> Self {
        Self {
            point: FaultPoint::Chunk(sequence),
            class,
            remaining: 1,
        }
    }

    pub fn swap(class: ErrorClass) -> Self {
        Self {
            point: FaultPoint::Swap,
            class,
            remaining: 1,
        }
    }

    pub fn times(mut self, n: u32) -> Self {
        self.remaining = n;
        self
    }

    fn error(&self) -> WarehouseError {
        let message = format!("injected fault at {:?}", self.point);
        match self.class {
            ErrorClass::Retryable => WarehouseError::Unavailable(message),
            ErrorClass::Fatal => WarehouseError::Fatal(message),
        }
    }
}

#[derive(Debug, Clone)]
struct MemTable {
    spec: TableSpec,
    rows: Vec<CleanRecord>,
}

#[derive(Debug, Clone, Default)]
struct Store {
    tables: HashMap<String, MemTable>,
    /// (table, chunk) -> rows written
    ledger: BTreeMap<(String, ChunkKey), u64>,
    watermarks: HashMap<String, Value>,
    indexes: BTreeSet<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Append,
    Upsert,
    Shadow,
    Incremental,
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    store: Mutex<Store>,
    faults: Mutex<Vec<Fault>>,
    commit_log: Mutex<Vec<ChunkKey>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn shadow_spec(table: &TableSpec, run_id: &str) -> TableSpec {
    TableSpec {
        name: shadow_table_name(&table.name, run_id),
        ..table.clone()
    }
}

fn missing_table(table: &TableSpec) -> WarehouseError {
    WarehouseError::SchemaMismatch {
        table: table.qualified_name(),
        detail: "table does not exist".into(),
    }
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a fault; faults fire in the order they were injected
    pub fn inject(&self, fault: Fault) {
        lock(&self.faults).push(fault);
    }

    fn take_fault(&self, point: FaultPoint) -> Option<Fault> {
        let mut faults = lock(&self.faults);
        let index = faults.iter().position(|f| f.point == point && f.remaining > 0)?;
        let fault = faults[index].clone();
        faults[index].remaining -= 1;
        if faults[index].remaining == 0 {
            faults.remove(index);
        }
        Some(fault)
    }

    /// Current rows of a table, in insertion order
    pub fn rows(&self, table: &TableSpec) -> Vec<CleanRecord> {
        lock(&self.store)
            .tables
            .get(&table.qualified_name())
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Every chunk successfully written, in commit order
    pub fn commit_log(&self) -> Vec<ChunkKey> {
        lock(&self.commit_log).clone()
    }

    pub fn has_index(&self, table: &TableSpec, column: &str) -> bool {
        lock(&self.store)
            .indexes
            .contains(&(table.qualified_name(), column.to_string()))
    }

    pub fn table_exists(&self, table: &TableSpec) -> bool {
        lock(&self.store).tables.contains_key(&table.qualified_name())
    }

    /// Apply `f` to a copy of the store, keeping the copy only on success
    fn transact<T>(&self, f: impl FnOnce(&mut Store) -> Result<T, WarehouseError>) -> Result<T, WarehouseError> {
        let mut store = lock(&self.store);
        let mut working = store.clone();
        let out = f(&mut working)?;
        *store = working;
        Ok(out)
    }

    fn write_chunk(
        &self,
        table: &TableSpec,
        key: &ChunkKey,
        rows: &[CleanRecord],
        batch_size: usize,
        mode: WriteMode,
    ) -> Result<CommitOutcome, WarehouseError> {
        validate_rows(table, rows, mode == WriteMode::Upsert || mode == WriteMode::Shadow)?;
        let mut fault = self.take_fault(FaultPoint::Chunk(key.sequence));
        let ledger_key = (table.qualified_name(), key.clone());

        let outcome = self.transact(|store| {
            if store.ledger.contains_key(&ledger_key) {
                return Ok(CommitOutcome::duplicate());
            }

            let target_spec = match mode {
                WriteMode::Shadow => {
                    if !store.tables.contains_key(&table.qualified_name()) {
                        return Err(missing_table(table));
                    }
                    let spec = shadow_spec(table, &key.run_id);
                    store
                        .tables
                        .entry(spec.qualified_name())
                        .or_insert_with(|| MemTable {
                            spec: spec.clone(),
                            rows: Vec::new(),
                        });
                    spec
                },
                _ => table.clone(),
            };
            let target_name = target_spec.qualified_name();

            let (selected, previous_mark): (Vec<&CleanRecord>, Option<Value>) = match mode {
                WriteMode::Incremental => {
                    let column = table.watermark_column.as_deref().unwrap_or_default();
                    let mark = store.watermarks.get(&target_name).cloned();
                    let fresh = rows
                        .iter()
                        .filter(|r| r.get(column).is_some_and(|v| v.exceeds(mark.as_ref())))
                        .collect();
                    (fresh, mark)
                },
                _ => (rows.iter().collect(), None),
            };

            let target = store.tables.get_mut(&target_name).ok_or_else(|| missing_table(table))?;
            let mut written = 0u64;
            for batch in selected.chunks(batch_size.max(1)) {
                match mode {
                    WriteMode::Upsert => upsert_rows(target, batch),
                    WriteMode::Shadow if !target_spec.primary_key.is_empty() => upsert_rows(target, batch),
                    _ => append_rows(target, batch)?,
                }
                written += batch.len() as u64;

                // Fail with part of the chunk already applied to the working copy
                if let Some(f) = fault.take() {
                    return Err(f.error());
                }
            }
            if let Some(f) = fault.take() {
                return Err(f.error());
            }

            let mut watermark = None;
            if mode == WriteMode::Incremental {
                let column = table.watermark_column.as_deref().unwrap_or_default();
                let chunk_max = max_watermark(selected.iter().copied(), column);
                let next = match (chunk_max, previous_mark) {
                    (Some(new), Some(old)) if !new.exceeds(Some(&old)) => Some(old),
                    (Some(new), _) => Some(new),
                    (None, old) => old,
                };
                if let Some(mark) = &next {
                    store.watermarks.insert(target_name.clone(), mark.clone());
                }
                watermark = next;
            }

            store.ledger.insert(ledger_key.clone(), written);
            Ok(CommitOutcome {
                rows_written: written,
                already_committed: false,
                watermark,
            })
        })?;

        if !outcome.already_committed {
            lock(&self.commit_log).push(key.clone());
        }
        Ok(outcome)
    }
}

fn append_rows(target: &mut MemTable, batch: &[&CleanRecord]) -> Result<(), WarehouseError> {
    if !target.spec.primary_key.is_empty() {
        let mut existing: HashSet<Vec<String>> = target.rows.iter().filter_map(|r| target.spec.key_of(r)).collect();
        for row in batch {
            if let Some(key) = target.spec.key_of(row) {
                if !existing.insert(key.clone()) {
                    return Err(WarehouseError::ConstraintViolation {
                        table: target.spec.qualified_name(),
                        detail: format!("duplicate primary key ({})", key.join(", ")),
                        offending: vec![row.summary()],
                    });
                }
            }
        }
    }
    target.rows.extend(batch.iter().map(|r| (*r).clone()));
    Ok(())
}

fn upsert_rows(target: &mut MemTable, batch: &[&CleanRecord]) {
    for row in batch {
        let key = target.spec.key_of(row);
        let existing = key
            .as_ref()
            .and_then(|k| target.rows.iter().position(|r| target.spec.key_of(r).as_ref() == Some(k)));
        match existing {
            Some(index) => target.rows[index] = (*row).clone(),
            None => target.rows.push((*row).clone()),
        }
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ensure_table(&self, table: &TableSpec) -> Result<(), WarehouseError> {
        let mut store = lock(&self.store);
        store.tables.entry(table.qualified_name()).or_insert_with(|| MemTable {
            spec: table.clone(),
            rows: Vec::new(),
        });
        Ok(())
    }

    async fn verify_schema(&self, table: &TableSpec) -> Result<(), WarehouseError> {
        let store = lock(&self.store);
        let existing = store.tables.get(&table.qualified_name()).ok_or_else(|| missing_table(table))?;
        for column in &table.columns {
            match existing.spec.column(&column.name) {
                Some(found) if found.column_type == column.column_type => {},
                Some(found) => {
                    return Err(WarehouseError::SchemaMismatch {
                        table: table.qualified_name(),
                        detail: format!(
                            "column {:?} is {:?}, declared {:?}",
                            column.name, found.column_type, column.column_type
                        ),
                    })
                },
                None => {
                    return Err(WarehouseError::SchemaMismatch {
                        table: table.qualified_name(),
                        detail: format!("column {:?} does not exist", column.name),
                    })
                },
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
        self.write_chunk(table, key, rows, batch_size, WriteMode::Append)
    }

    async fn upsert(
        &self,
        table: &TableSpec,
        key: &ChunkKey,
        rows: &[CleanRecord],
        batch_size: usize,
    ) -> Result<CommitOutcome, WarehouseError> {
        self.write_chunk(table, key, rows, batch_size, WriteMode::Upsert)
    }

    async fn stage_replacement(
        &self,
        table: &TableSpec,
        key: &ChunkKey,
        rows: &[CleanRecord],
        batch_size: usize,
    ) -> Result<CommitOutcome, WarehouseError> {
        self.write_chunk(table, key, rows, batch_size, WriteMode::Shadow)
    }

    async fn swap_replacement(&self, table: &TableSpec, run_id: &str) -> Result<Option<u64>, WarehouseError> {
        let shadow = shadow_spec(table, run_id).qualified_name();
        let mut fault = self.take_fault(FaultPoint::Swap);

        self.transact(|store| {
            let Some(staged) = store.tables.remove(&shadow) else {
                return Ok(None);
            };
            let target = store
                .tables
                .get_mut(&table.qualified_name())
                .ok_or_else(|| missing_table(table))?;

            target.rows.clear();
            if let Some(f) = fault.take() {
                return Err(f.error());
            }
            target.rows = staged.rows;

            debug!(table = %table.qualified_name(), rows = target.rows.len(), "Swapped in shadow table");
            Ok(Some(target.rows.len() as u64))
        })
    }

    async fn append_incremental(
        &self,
        table: &TableSpec,
        key: &ChunkKey,
        rows: &[CleanRecord],
        batch_size: usize,
    ) -> Result<CommitOutcome, WarehouseError> {
        self.write_chunk(table, key, rows, batch_size, WriteMode::Incremental)
    }

    async fn watermark(&self, table: &TableSpec) -> Result<Option<Value>, WarehouseError> {
        Ok(lock(&self.store).watermarks.get(&table.qualified_name()).cloned())
    }

    async fn create_indexes(&self, table: &TableSpec, columns: &[String]) -> Result<(), WarehouseError> {
        let mut store = lock(&self.store);
        if !store.tables.contains_key(&table.qualified_name()) {
            return Err(missing_table(table));
        }
        for column in columns {
            store.indexes.insert((table.qualified_name(), column.clone()));
        }
        Ok(())
    }

    async fn row_count(&self, table: &TableSpec) -> Result<u64, WarehouseError> {
        Ok(self.rows(table).len() as u64)
    }

    async fn is_committed(&self, table: &TableSpec, key: &ChunkKey) -> Result<bool, WarehouseError> {
        Ok(lock(&self.store)
            .ledger
            .contains_key(&(table.qualified_name(), key.clone())))
    }

    async fn forget_run(&self, table: &TableSpec, run_id: &str) -> Result<u64, WarehouseError> {
        let name = table.qualified_name();
        let shadow = shadow_spec(table, run_id).qualified_name();
        let mut store = lock(&self.store);

        let before = store.ledger.len();
        store.ledger.retain(|(t, k), _| !(t == &name && k.run_id == run_id));
        store.tables.remove(&shadow);
        Ok((before - store.ledger.len()) as u64)
    }
}
