//! Scheduler task interface
//!
//! A scheduler invokes one task per logical run. The task builds every
//! component from a [`PipelineConfig`], runs the coordinator and hands back
//! the run's terminal status. Retrying a whole task is the scheduler's
//! business; per-operation retries happen inside.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{PipelineConfig, StateBackend};
use crate::coordinator::{BatchCoordinator, LoadOptions, RunReport};
use crate::error::PipelineError;
use crate::extract::SourceReader;
use crate::load::{MemoryWarehouse, PgWarehouse, Warehouse};
use crate::retry::RetryPolicy;
use crate::staging::StagingSink;
use crate::state::{FileRunStateStore, PgRunStateStore, RunStateStore, RunStatus};
use crate::transform::SchemaTransform;

/// Subdirectory holding staging and state of dry runs
const DRY_RUN_DIR: &str = "dry-run";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Load into the configured Postgres warehouse
    #[default]
    Live,
    /// Load into an in-process warehouse that is discarded afterwards
    DryRun,
}

/// What the scheduler needs to know about a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub status: RunStatus,
    pub committed_chunk_count: usize,
    pub failed_chunk_count: usize,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

impl From<&RunReport> for TaskOutcome {
    fn from(report: &RunReport) -> Self {
        Self {
            status: report.status,
            committed_chunk_count: report.committed_chunk_count,
            failed_chunk_count: report.failed_chunk_count,
        }
    }
}

fn dry_run_dir(dir: &std::path::Path) -> PathBuf {
    dir.join(DRY_RUN_DIR)
}

/// Assemble a coordinator for `config`
pub async fn build_coordinator(config: &PipelineConfig, mode: RunMode) -> Result<BatchCoordinator, PipelineError> {
    config.validate()?;
    let source = SourceReader::from_config(config)?;

    let (warehouse, pool): (Arc<dyn Warehouse>, _) = match mode {
        RunMode::Live => {
            let warehouse = PgWarehouse::connect(&config.warehouse).await?;
            warehouse.migrate().await?;
            let pool = warehouse.pool().clone();
            (Arc::new(warehouse), Some(pool))
        },
        RunMode::DryRun => (Arc::new(MemoryWarehouse::new()), None),
    };

    let (state_dir, staging_dir) = match mode {
        RunMode::Live => (config.state.dir.clone(), config.staging.dir.clone()),
        RunMode::DryRun => (dry_run_dir(&config.state.dir), dry_run_dir(&config.staging.dir)),
    };
    let store: Arc<dyn RunStateStore> = match (config.state.backend, pool) {
        (StateBackend::Postgres, Some(pool)) => Arc::new(PgRunStateStore::new(pool)),
        (StateBackend::Postgres, None) => {
            warn!("Dry run keeps run state in files instead of postgres");
            Arc::new(FileRunStateStore::new(state_dir))
        },
        (StateBackend::File, _) => Arc::new(FileRunStateStore::new(state_dir)),
    };

    Ok(BatchCoordinator::new(
        source,
        warehouse,
        store,
        StagingSink::new(staging_dir),
        config.target.clone(),
        config.load.strategy,
    )
    .with_transform(Arc::new(SchemaTransform::new(config.transform.clone())))
    .with_retry(RetryPolicy::from_config(&config.retry))
    .with_options(LoadOptions {
        batch_size: config.load.batch_size,
        create_table: config.load.create_table,
        create_indexes: config.load.create_indexes,
    }))
}

/// Run one logical run against the configured warehouse
pub async fn run_task(
    config: &PipelineConfig,
    run_id: &str,
    cancel: CancellationToken,
) -> Result<RunReport, PipelineError> {
    run_task_with(config, run_id, RunMode::Live, cancel).await
}

pub async fn run_task_with(
    config: &PipelineConfig,
    run_id: &str,
    mode: RunMode,
    cancel: CancellationToken,
) -> Result<RunReport, PipelineError> {
    let coordinator = build_coordinator(config, mode).await?;
    if mode == RunMode::DryRun {
        // The memory warehouse starts empty, so earlier dry-run progress is meaningless
        coordinator.reset(run_id).await?;
    }

    let report = coordinator.run(run_id, &cancel).await?;
    info!(run_id, outcome = ?TaskOutcome::from(&report), "Task finished");
    Ok(report)
}

/// Drive independent runs concurrently; each entry carries its own run id
pub async fn run_many(
    runs: &[(PipelineConfig, String)],
    mode: RunMode,
    cancel: CancellationToken,
) -> Vec<(String, Result<RunReport, PipelineError>)> {
    let tasks = runs.iter().map(|(config, run_id)| {
        let cancel = cancel.clone();
        async move {
            let result = run_task_with(config, run_id, mode, cancel).await;
            (run_id.clone(), result)
        }
    });
    join_all(tasks).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir, rows: usize) -> PipelineConfig {
        let mut csv = String::from("id,label\n");
        for i in 1..=rows {
            csv.push_str(&format!("{i},row {i}\n"));
        }
        let path = dir.path().join("input.csv");
        std::fs::write(&path, csv).unwrap();

        let text = format!(
            r#"
            [retry]
            max_attempts = 2
            base_delay_ms = 1
            max_delay_ms = 1

            [chunk]
            size = 4

            [source]
            kind = "file"

            [source.file]
            paths = [{path:?}]

            [load]
            strategy = "upsert"

            [target]
            name = "labels"
            primary_key = ["id"]
            columns = [
                {{ name = "id", type = "integer", nullable = false }},
                {{ name = "label", type = "text" }},
            ]

            [staging]
            dir = {staging:?}

            [state]
            dir = {state:?}
            "#,
            path = path.display().to_string(),
            staging = dir.path().join("staging").display().to_string(),
            state = dir.path().join("state").display().to_string(),
        );
        PipelineConfig::from_toml_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_dry_run_task() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, 10);

        let report = run_task_with(&config, "nightly", RunMode::DryRun, CancellationToken::new())
            .await
            .unwrap();
        let outcome = TaskOutcome::from(&report);
        assert!(outcome.is_success());
        assert_eq!(outcome.committed_chunk_count, 3);
        assert_eq!(outcome.failed_chunk_count, 0);
        assert_eq!(report.rows_written, 10);
        assert!(dir.path().join("state").join(DRY_RUN_DIR).exists());
    }

    #[tokio::test]
    async fn test_dry_runs_start_fresh() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, 5);

        for _ in 0..2 {
            let report = run_task_with(&config, "nightly", RunMode::DryRun, CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(report.attempt, 1);
            assert_eq!(report.rows_written, 5);
        }
    }

    #[tokio::test]
    async fn test_run_many_keeps_runs_apart() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, 6);
        let runs = vec![(config.clone(), "a".to_string()), (config, "b".to_string())];

        let results = run_many(&runs, RunMode::DryRun, CancellationToken::new()).await;
        assert_eq!(results.len(), 2);
        for (run_id, result) in results {
            let report = result.unwrap();
            assert_eq!(report.run_id, run_id);
            assert_eq!(report.status, RunStatus::Succeeded);
        }
    }
}
