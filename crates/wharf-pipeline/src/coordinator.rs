//! Batch coordinator
//!
//! Drives one logical run chunk by chunk:
//!
//! ```text
//! Pending -> Extracting -> Staged -> Transforming -> Loading -> Committed
//!                \______________\_____________\__________\----> Failed
//! ```
//!
//! Chunks are processed strictly one after another. The persisted cursor of a
//! source only moves past a chunk once that chunk and every chunk before it
//! have committed, and it moves in the same state write that records the
//! commit. A crash between the warehouse commit and that write re-reads the
//! chunk on restart, and the warehouse ledger turns the second commit into a
//! no-op.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Classify, PipelineError};
use crate::extract::{ChunkRead, Cursor, SourceReader};
use crate::load::{LoadStrategy, Warehouse};
use crate::record::{Chunk, ChunkKey, TableSpec};
use crate::retry::{Retried, RetryPolicy};
use crate::staging::{StagedChunk, StagingSink};
use crate::state::{ChunkFailure, ChunkPhase, RunLease, RunState, RunStateStore, RunStatus};
use crate::transform::{SchemaTransform, Transform};

/// What happened to one chunk during this attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkReport {
    pub key: ChunkKey,
    pub phase: ChunkPhase,
    pub records: usize,
    pub rows_written: u64,
    pub extract_attempts: u32,
    pub load_attempts: u32,
    /// Read back from staging instead of the source
    pub replayed: bool,
    /// Committed by an earlier attempt; nothing was written
    pub already_committed: bool,
}

impl ChunkReport {
    fn new(key: ChunkKey) -> Self {
        Self {
            key,
            phase: ChunkPhase::Pending,
            records: 0,
            rows_written: 0,
            extract_attempts: 0,
            load_attempts: 0,
            replayed: false,
            already_committed: false,
        }
    }

    pub fn retries(&self) -> u32 {
        self.extract_attempts.saturating_sub(1) + self.load_attempts.saturating_sub(1)
    }
}

/// Terminal view of a run attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub attempt: u32,
    pub committed_chunk_count: usize,
    pub failed_chunk_count: usize,
    pub rows_written: u64,
    pub committed: Vec<ChunkKey>,
    pub failures: Vec<ChunkFailure>,
    pub chunks: Vec<ChunkReport>,
    /// Resume point of the next attempt
    pub last_cursor: Cursor,
    pub cancelled: bool,
}

impl RunReport {
    fn from_state(state: &RunState, source_id: &str, chunks: Vec<ChunkReport>, cancelled: bool) -> Self {
        Self {
            run_id: state.run_id.clone(),
            status: state.status,
            attempt: state.attempt,
            committed_chunk_count: state.committed.len(),
            failed_chunk_count: state.failures.len(),
            rows_written: chunks.iter().map(|c| c.rows_written).sum(),
            committed: state.committed.iter().cloned().collect(),
            failures: state.failures.clone(),
            chunks,
            last_cursor: state.progress(source_id).cursor,
            cancelled,
        }
    }

    pub fn chunk(&self, sequence: u64) -> Option<&ChunkReport> {
        self.chunks.iter().find(|c| c.key.sequence == sequence)
    }
}

/// How a chunk was obtained
enum Obtained {
    Chunk(StagedChunk),
    End,
    Failed(ChunkFailure),
}

/// Knobs of the load side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub batch_size: usize,
    pub create_table: bool,
    pub create_indexes: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            batch_size: crate::config::DEFAULT_LOAD_BATCH_SIZE,
            create_table: true,
            create_indexes: true,
        }
    }
}

pub struct BatchCoordinator {
    source: SourceReader,
    transform: Arc<dyn Transform>,
    strategy: LoadStrategy,
    warehouse: Arc<dyn Warehouse>,
    staging: StagingSink,
    store: Arc<dyn RunStateStore>,
    table: TableSpec,
    retry: RetryPolicy,
    options: LoadOptions,
}

impl BatchCoordinator {
    pub fn new(
        source: SourceReader,
        warehouse: Arc<dyn Warehouse>,
        store: Arc<dyn RunStateStore>,
        staging: StagingSink,
        table: TableSpec,
        strategy: LoadStrategy,
    ) -> Self {
        Self {
            source,
            transform: Arc::new(SchemaTransform::default()),
            strategy,
            warehouse,
            staging,
            store,
            table,
            retry: RetryPolicy::default(),
            options: LoadOptions::default(),
        }
    }

    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn source_id(&self) -> &str {
        self.source.source_id()
    }

    pub fn table(&self) -> &TableSpec {
        &self.table
    }

    /// Persisted state of a run, if it ever started
    pub async fn status(&self, run_id: &str) -> Result<Option<RunState>, PipelineError> {
        Ok(self.store.load(run_id).await?)
    }

    /// Forget a run entirely: state, staged chunks and warehouse ledger entries
    pub async fn reset(&self, run_id: &str) -> Result<(), PipelineError> {
        let lease = self.store.lease(run_id).await?;
        self.store.reset(&lease).await?;
        self.staging.purge_run(run_id).await?;
        let forgotten = self.warehouse.forget_run(&self.table, run_id).await?;
        info!(run_id, ledger_entries = forgotten, "Reset run");
        Ok(())
    }

    /// Break the lease of a run whose process died
    pub async fn force_unlock(&self, run_id: &str) -> Result<bool, PipelineError> {
        Ok(self.store.force_unlock(run_id).await?)
    }

    /// Run (or resume) `run_id` until the source ends, a chunk halts the run,
    /// or `cancel` fires between chunks
    pub async fn run(&self, run_id: &str, cancel: &CancellationToken) -> Result<RunReport, PipelineError> {
        let lease = self.store.lease(run_id).await?;
        let mut state = self
            .store
            .load(run_id)
            .await?
            .unwrap_or_else(|| RunState::new(run_id));

        if state.status == RunStatus::Succeeded {
            info!(run_id, "Run already succeeded, nothing to do");
            return Ok(RunReport::from_state(&state, self.source_id(), Vec::new(), false));
        }

        state.attempt += 1;
        state.status = RunStatus::Running;
        state.failures.clear();
        state.touch();
        self.store.save(&lease, &state).await?;

        info!(
            run_id,
            source = self.source_id(),
            table = %self.table.qualified_name(),
            strategy = %self.strategy,
            attempt = state.attempt,
            resume_from = %state.progress(self.source_id()).cursor,
            "Starting run"
        );

        match self.drive(&lease, &mut state, cancel).await {
            Ok(report) => Ok(report),
            Err(e) => {
                warn!(run_id, error = %e, "Run aborted");
                state.status = RunStatus::Failed;
                state.touch();
                if let Err(save_err) = self.store.save(&lease, &state).await {
                    warn!(run_id, error = %save_err, "Failed to persist aborted run state");
                }
                Err(e)
            },
        }
    }

    async fn prepare_table(&self) -> Result<(), PipelineError> {
        self.strategy.validate(&self.table)?;
        if self.options.create_table {
            self.warehouse.ensure_table(&self.table).await?;
        }
        self.warehouse.verify_schema(&self.table).await?;
        Ok(())
    }

    async fn drive(
        &self,
        lease: &RunLease,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        self.prepare_table().await?;

        let run_id = state.run_id.clone();
        let source_id = self.source_id().to_string();
        let pending = self.staging.list_uncommitted(&run_id).await?;
        if !pending.is_empty() {
            info!(run_id = %run_id, staged = pending.len(), "Found staged chunks awaiting commit");
        }

        let start = state.progress(&source_id);
        let mut cursor = start.cursor;
        let mut sequence = start.next_sequence;
        // Every chunk before `cursor` has committed
        let mut contiguous = true;
        let mut reached_end = false;
        let mut cancelled = false;
        let mut chunks = Vec::new();

        loop {
            if cancel.is_cancelled() {
                info!(run_id = %run_id, next_sequence = sequence, "Run cancelled between chunks");
                cancelled = true;
                break;
            }

            let key = ChunkKey::new(&run_id, &source_id, sequence);
            let mut report = ChunkReport::new(key.clone());

            let staged = match self.obtain(&key, &cursor, &mut report).await? {
                Obtained::Chunk(staged) => staged,
                Obtained::End => {
                    debug!(run_id = %run_id, sequence, "Source exhausted");
                    reached_end = true;
                    break;
                },
                Obtained::Failed(failure) => {
                    report.phase = ChunkPhase::Failed;
                    chunks.push(report);
                    state.record_failure(failure);
                    state.touch();
                    self.store.save(lease, state).await?;

                    match self.source.skip_cursor(&cursor) {
                        Some(next) if self.source.independent_chunks() => {
                            contiguous = false;
                            cursor = next;
                            sequence += 1;
                            continue;
                        },
                        _ => {
                            warn!(run_id = %run_id, chunk = %key, "Cannot read past failed chunk, halting");
                            break;
                        },
                    }
                },
            };

            report.phase = ChunkPhase::Staged;
            report.records = staged.records.len();
            let next_cursor = staged.next_cursor.clone();

            if state.is_committed(&key) {
                debug!(chunk = %key, "Chunk committed by an earlier attempt, skipping");
                report.phase = ChunkPhase::Committed;
                report.already_committed = true;
                if contiguous {
                    let progress = state.progress_mut(&source_id);
                    progress.cursor = next_cursor.clone();
                    progress.next_sequence = sequence + 1;
                    state.touch();
                    self.store.save(lease, state).await?;
                }
                self.staging.mark_committed(&key).await?;
                chunks.push(report);
                cursor = next_cursor;
                sequence += 1;
                continue;
            }

            match self.load(&key, staged, &mut report).await {
                Ok(()) => {
                    state.record_commit(key.clone());
                    if contiguous {
                        let progress = state.progress_mut(&source_id);
                        progress.cursor = next_cursor.clone();
                        progress.next_sequence = sequence + 1;
                    }
                    state.touch();
                    self.store.save(lease, state).await?;
                    self.staging.mark_committed(&key).await?;

                    if report.retries() > 0 {
                        info!(chunk = %key, retries = report.retries(), "Chunk committed after retry");
                    }
                    chunks.push(report);
                },
                Err(failure) => {
                    report.phase = ChunkPhase::Failed;
                    chunks.push(report);
                    state.record_failure(failure);
                    state.touch();
                    self.store.save(lease, state).await?;

                    if !self.source.independent_chunks() {
                        warn!(run_id = %run_id, chunk = %key, "Sequential source, halting at failed chunk");
                        break;
                    }
                    contiguous = false;
                },
            }

            cursor = next_cursor;
            sequence += 1;
        }

        let failed = !state.failures.is_empty();
        state.status = if cancelled {
            RunStatus::Pending
        } else if !failed && reached_end {
            self.complete(&run_id).await?;
            RunStatus::Succeeded
        } else if state.committed_for(&source_id).next().is_some() {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Failed
        };
        state.touch();
        self.store.save(lease, state).await?;

        let report = RunReport::from_state(state, &source_id, chunks, cancelled);
        info!(
            run_id = %run_id,
            status = %report.status,
            committed = report.committed_chunk_count,
            failed = report.failed_chunk_count,
            rows = report.rows_written,
            "Run finished"
        );
        Ok(report)
    }

    /// Staged copy when it starts where we are, otherwise a fresh read under retry
    async fn obtain(&self, key: &ChunkKey, cursor: &Cursor, report: &mut ChunkReport) -> Result<Obtained, PipelineError> {
        if let Some(staged) = self.staging.get(key).await? {
            if staged.start_cursor == *cursor {
                debug!(chunk = %key, "Replaying staged chunk");
                report.replayed = true;
                return Ok(Obtained::Chunk(staged));
            }
            debug!(chunk = %key, "Staged chunk starts elsewhere, re-extracting");
        }

        report.phase = ChunkPhase::Extracting;
        let source = &self.source;
        let read = self
            .retry
            .execute("extract", move |_| source.next_chunk(cursor, key))
            .await;

        match read {
            Ok(Retried {
                value: ChunkRead::EndOfSource,
                ..
            }) => Ok(Obtained::End),
            Ok(Retried {
                value: ChunkRead::Chunk { chunk, next },
                attempts,
            }) => {
                report.extract_attempts = attempts;
                let staged = StagedChunk::new(key.clone(), cursor.clone(), next, chunk.into_records());
                self.staging.put(&staged).await?;
                Ok(Obtained::Chunk(staged))
            },
            Err(e) => {
                report.extract_attempts = e.attempts();
                Ok(Obtained::Failed(ChunkFailure {
                    key: key.clone(),
                    phase: ChunkPhase::Extracting,
                    class: e.class(),
                    attempts: e.attempts(),
                    cause: e.error().to_string(),
                    failed_at: Utc::now(),
                }))
            },
        }
    }

    /// Transform and commit one staged chunk; only the commit is retried
    async fn load(&self, key: &ChunkKey, staged: StagedChunk, report: &mut ChunkReport) -> Result<(), ChunkFailure> {
        report.phase = ChunkPhase::Transforming;
        let chunk = Chunk::new(key.clone(), staged.records);
        let rows = self.transform.apply(&chunk, &self.table).map_err(|e| ChunkFailure {
            key: key.clone(),
            phase: ChunkPhase::Transforming,
            class: e.class(),
            attempts: 1,
            cause: e.to_string(),
            failed_at: Utc::now(),
        })?;

        report.phase = ChunkPhase::Loading;
        let warehouse = self.warehouse.as_ref();
        let (strategy, table, rows_ref, batch_size) = (&self.strategy, &self.table, &rows, self.options.batch_size);
        let committed = self
            .retry
            .execute("load", move |_| strategy.commit(warehouse, table, key, rows_ref, batch_size))
            .await;

        match committed {
            Ok(Retried { value, attempts }) => {
                report.load_attempts = attempts;
                report.rows_written = value.rows_written;
                report.already_committed = value.already_committed;
                report.phase = ChunkPhase::Committed;
                Ok(())
            },
            Err(e) => {
                report.load_attempts = e.attempts();
                Err(ChunkFailure {
                    key: key.clone(),
                    phase: ChunkPhase::Loading,
                    class: e.class(),
                    attempts: e.attempts(),
                    cause: e.error().to_string(),
                    failed_at: Utc::now(),
                })
            },
        }
    }

    /// Run-level completion once every chunk committed and the source ended
    async fn complete(&self, run_id: &str) -> Result<(), PipelineError> {
        let (strategy, warehouse, table) = (&self.strategy, self.warehouse.as_ref(), &self.table);
        self.retry
            .execute("finalize", move |_| strategy.finalize(warehouse, table, run_id))
            .await
            .map_err(|e| e.into_inner())?;

        if self.options.create_indexes && !self.table.indexes.is_empty() {
            self.warehouse.create_indexes(&self.table, &self.table.indexes).await?;
            info!(table = %self.table.qualified_name(), indexes = self.table.indexes.len(), "Created indexes");
        }
        Ok(())
    }
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("source", &self.source_id())
            .field("table", &self.table.qualified_name())
            .field("strategy", &self.strategy)
            .field("warehouse", &self.warehouse.name())
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileSourceConfig;
    use crate::error::ErrorClass;
    use crate::extract::FileSource;
    use crate::load::{Fault, MemoryWarehouse};
    use crate::record::{ColumnSpec, ColumnType, Value};
    use crate::state::FileRunStateStore;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        warehouse: Arc<MemoryWarehouse>,
    }

    impl Fixture {
        fn new(rows: usize) -> Self {
            let dir = TempDir::new().unwrap();
            let mut csv = String::from("id,name\n");
            for i in 1..=rows {
                csv.push_str(&format!("{i},item-{i}\n"));
            }
            std::fs::write(dir.path().join("items.csv"), csv).unwrap();
            Self {
                dir,
                warehouse: Arc::new(MemoryWarehouse::new()),
            }
        }

        fn table() -> TableSpec {
            TableSpec::new(
                "items",
                vec![
                    ColumnSpec::new("id", ColumnType::Integer).not_null(),
                    ColumnSpec::new("name", ColumnType::Text),
                ],
            )
            .with_primary_key(["id"])
        }

        fn coordinator(&self, strategy: LoadStrategy) -> BatchCoordinator {
            let source = FileSource::new(
                "items",
                FileSourceConfig::new(vec![self.dir.path().join("items.csv")]),
                10,
            )
            .unwrap();
            BatchCoordinator::new(
                SourceReader::File(source),
                self.warehouse.clone(),
                Arc::new(FileRunStateStore::new(self.dir.path().join("state"))),
                StagingSink::new(self.dir.path().join("staging")),
                Self::table(),
                strategy,
            )
            .with_retry(RetryPolicy::immediate(3))
        }
    }

    #[tokio::test]
    async fn test_clean_run_commits_every_chunk() {
        let fx = Fixture::new(25);
        let report = fx
            .coordinator(LoadStrategy::Append)
            .run("r1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.committed_chunk_count, 3);
        assert_eq!(report.rows_written, 25);
        assert_eq!(fx.warehouse.rows(&Fixture::table()).len(), 25);
    }

    #[tokio::test]
    async fn test_succeeded_run_is_not_repeated() {
        let fx = Fixture::new(10);
        let coordinator = fx.coordinator(LoadStrategy::Append);
        coordinator.run("r1", &CancellationToken::new()).await.unwrap();

        let again = coordinator.run("r1", &CancellationToken::new()).await.unwrap();
        assert_eq!(again.status, RunStatus::Succeeded);
        assert!(again.chunks.is_empty());
        assert_eq!(fx.warehouse.commit_log().len(), 1);
    }

    #[tokio::test]
    async fn test_fatal_transform_failure_is_not_retried() {
        let fx = Fixture::new(10);
        std::fs::write(fx.dir.path().join("items.csv"), "id,name\nnot-a-number,x\n").unwrap();

        let report = fx
            .coordinator(LoadStrategy::Append)
            .run("r1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].phase, ChunkPhase::Transforming);
        assert_eq!(report.failures[0].class, ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn test_cancelled_run_stays_pending_and_resumes() {
        let fx = Fixture::new(20);
        let coordinator = fx.coordinator(LoadStrategy::Append);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = coordinator.run("r1", &cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.status, RunStatus::Pending);
        assert!(fx.warehouse.rows(&Fixture::table()).is_empty());

        let report = coordinator.run("r1", &CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.attempt, 2);
    }

    #[tokio::test]
    async fn test_exhausted_load_retries_mark_partial_failure() {
        let fx = Fixture::new(30);
        fx.warehouse.inject(Fault::chunk(2, ErrorClass::Retryable).times(3));

        let coordinator = fx.coordinator(LoadStrategy::Upsert);
        let report = coordinator.run("r1", &CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::PartiallyFailed);
        assert_eq!(report.failed_chunk_count, 1);
        assert_eq!(report.failures[0].attempts, 3);
        assert_eq!(report.chunk(2).unwrap().phase, ChunkPhase::Failed);
        assert_eq!(fx.warehouse.rows(&Fixture::table()).len(), 20);

        // Chunk 3 still loaded, but the resume point waits at chunk 2
        assert_eq!(report.committed_chunk_count, 2);
        let state = coordinator.status("r1").await.unwrap().unwrap();
        assert_eq!(state.progress("items").next_sequence, 2);
        assert!(matches!(report.last_cursor, Cursor::File { row: 10, .. }));
    }

    #[tokio::test]
    async fn test_reset_clears_state_and_ledger() {
        let fx = Fixture::new(10);
        let coordinator = fx.coordinator(LoadStrategy::Upsert);
        coordinator.run("r1", &CancellationToken::new()).await.unwrap();

        coordinator.reset("r1").await.unwrap();
        assert!(coordinator.status("r1").await.unwrap().is_none());
        assert!(!fx
            .warehouse
            .is_committed(&Fixture::table(), &ChunkKey::new("r1", "items", 1))
            .await
            .unwrap());

        let report = coordinator.run("r1", &CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.attempt, 1);
        let rows = fx.warehouse.rows(&Fixture::table());
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0].get("name"), Some(&Value::Text("item-1".into())));
    }
}
