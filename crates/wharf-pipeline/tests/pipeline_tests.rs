//! End-to-end runs against the in-memory warehouse
//!
//! Covers the behaviours a scheduler relies on:
//! 1. Transient load failures are retried inside the run
//! 2. Resumed runs never commit a chunk twice
//! 3. Incremental runs only append rows past the table watermark
//! 4. Replace runs swap table contents atomically
//! 5. API sources paginate and recover from transient HTTP errors

use chrono::{TimeZone, Utc};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wharf_pipeline::config::{ApiSourceConfig, FileSourceConfig, Pagination, PipelineConfig};
use wharf_pipeline::error::{PipelineError, StateError};
use wharf_pipeline::extract::{ApiSource, FileSource, SourceReader};
use wharf_pipeline::load::{Fault, MemoryWarehouse, Warehouse};
use wharf_pipeline::record::{ChunkKey, ColumnSpec, ColumnType, TableSpec, Value};
use wharf_pipeline::retry::RetryPolicy;
use wharf_pipeline::staging::StagingSink;
use wharf_pipeline::state::{ChunkPhase, FileRunStateStore, RunStateStore};
use wharf_pipeline::{BatchCoordinator, ErrorClass, LoadStrategy, RunStatus};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CHUNK_SIZE: usize = 10;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,wharf_pipeline=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn items_table() -> TableSpec {
    TableSpec::new(
        "items",
        vec![
            ColumnSpec::new("id", ColumnType::Integer).not_null(),
            ColumnSpec::new("name", ColumnType::Text),
        ],
    )
    .with_primary_key(["id"])
}

fn events_table() -> TableSpec {
    TableSpec::new(
        "events",
        vec![
            ColumnSpec::new("id", ColumnType::Integer).not_null(),
            ColumnSpec::new("name", ColumnType::Text),
            ColumnSpec::new("updated_at", ColumnType::Timestamp).not_null(),
        ],
    )
    .with_primary_key(["id"])
    .with_watermark("updated_at")
}

/// Scratch directory holding input files, staging and run state
struct Workspace {
    dir: TempDir,
    warehouse: Arc<MemoryWarehouse>,
}

impl Workspace {
    fn new() -> Self {
        init_tracing();
        Self {
            dir: TempDir::new().unwrap(),
            warehouse: Arc::new(MemoryWarehouse::new()),
        }
    }

    fn write(&self, name: &str, bytes: impl AsRef<[u8]>) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn write_items(&self, ids: std::ops::RangeInclusive<i64>, label: &str) -> PathBuf {
        let mut csv = String::from("id,name\n");
        for id in ids {
            csv.push_str(&format!("{id},{label}-{id}\n"));
        }
        self.write("items.csv", csv)
    }

    fn store(&self) -> FileRunStateStore {
        FileRunStateStore::new(self.dir.path().join("state"))
    }

    fn file_source(&self, path: PathBuf) -> SourceReader {
        self.file_source_with(FileSourceConfig::new([path]))
    }

    fn file_source_with(&self, config: FileSourceConfig) -> SourceReader {
        SourceReader::File(FileSource::new("items", config, CHUNK_SIZE).unwrap())
    }

    fn coordinator(&self, source: SourceReader, table: TableSpec, strategy: LoadStrategy) -> BatchCoordinator {
        BatchCoordinator::new(
            source,
            self.warehouse.clone(),
            Arc::new(self.store()),
            StagingSink::new(self.dir.path().join("staging")),
            table,
            strategy,
        )
        .with_retry(RetryPolicy::immediate(3))
    }
}

fn sequences(keys: &[ChunkKey]) -> Vec<u64> {
    keys.iter().map(|k| k.sequence).collect()
}

#[tokio::test]
async fn test_transient_load_failure_is_retried_within_run() {
    let ws = Workspace::new();
    let input = ws.write_items(1..=30, "item");
    ws.warehouse.inject(Fault::chunk(2, ErrorClass::Retryable));

    let report = ws
        .coordinator(ws.file_source(input), items_table(), LoadStrategy::Append)
        .run("nightly", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.rows_written, 30);
    assert_eq!(sequences(&report.committed), vec![1, 2, 3]);
    assert_eq!(report.chunk(1).unwrap().retries(), 0);
    assert_eq!(report.chunk(2).unwrap().retries(), 1);
    assert_eq!(report.chunk(2).unwrap().load_attempts, 2);
    assert_eq!(ws.warehouse.rows(&items_table()).len(), 30);

    // The failed first attempt left nothing behind
    assert_eq!(sequences(&ws.warehouse.commit_log()), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_resumed_run_never_recommits_earlier_chunks() {
    let ws = Workspace::new();
    let input = ws.write_items(1..=30, "item");
    ws.warehouse.inject(Fault::chunk(3, ErrorClass::Fatal));

    let coordinator = ws.coordinator(ws.file_source(input), items_table(), LoadStrategy::Append);
    let first = coordinator.run("nightly", &CancellationToken::new()).await.unwrap();
    assert_eq!(first.status, RunStatus::PartiallyFailed);
    assert_eq!(first.failures.len(), 1);
    assert_eq!(first.failures[0].key.sequence, 3);
    assert_eq!(first.failures[0].phase, ChunkPhase::Loading);
    assert_eq!(first.failures[0].class, ErrorClass::Fatal);
    assert_eq!(first.failures[0].attempts, 1);
    assert_eq!(ws.warehouse.rows(&items_table()).len(), 20);

    let second = coordinator.run("nightly", &CancellationToken::new()).await.unwrap();
    assert_eq!(second.status, RunStatus::Succeeded);
    assert_eq!(second.attempt, 2);
    assert!(second.failures.is_empty());
    assert!(second.chunk(1).is_none());
    assert!(second.chunk(2).is_none());
    assert!(second.chunk(3).unwrap().replayed);
    assert_eq!(second.rows_written, 10);

    assert_eq!(sequences(&ws.warehouse.commit_log()), vec![1, 2, 3]);
    assert_eq!(ws.warehouse.rows(&items_table()).len(), 30);
}

#[tokio::test]
async fn test_lost_run_state_is_absorbed_by_warehouse_ledger() {
    let ws = Workspace::new();
    let input = ws.write_items(1..=25, "item");

    let coordinator = ws.coordinator(ws.file_source(input), items_table(), LoadStrategy::Append);
    coordinator.run("nightly", &CancellationToken::new()).await.unwrap();

    // Simulates a crash after the warehouse commits but before any state write survives
    std::fs::remove_dir_all(ws.dir.path().join("state")).unwrap();

    let again = coordinator.run("nightly", &CancellationToken::new()).await.unwrap();
    assert_eq!(again.status, RunStatus::Succeeded);
    assert_eq!(again.rows_written, 0);
    assert!(again.chunks.iter().all(|c| c.already_committed));
    assert_eq!(ws.warehouse.rows(&items_table()).len(), 25);
    assert_eq!(ws.warehouse.commit_log().len(), 3);
}

#[tokio::test]
async fn test_incremental_runs_append_only_new_rows() {
    let ws = Workspace::new();
    let events = |days: std::ops::RangeInclusive<u32>| {
        let mut csv = String::from("id,name,updated_at\n");
        for day in days {
            csv.push_str(&format!("{day},event-{day},2024-03-{day:02}T08:00:00Z\n"));
        }
        csv
    };

    let input = ws.write("events.csv", events(1..=3));
    let first = ws
        .coordinator(ws.file_source(input.clone()), events_table(), LoadStrategy::Incremental)
        .run("day-1", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(first.rows_written, 3);

    // The export now repeats the old rows next to two new ones
    ws.write("events.csv", events(1..=5));
    let second = ws
        .coordinator(ws.file_source(input), events_table(), LoadStrategy::Incremental)
        .run("day-2", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Succeeded);
    assert_eq!(second.rows_written, 2);

    let rows = ws.warehouse.rows(&events_table());
    assert_eq!(rows.len(), 5);
    let watermark = ws.warehouse.watermark(&events_table()).await.unwrap();
    assert_eq!(
        watermark,
        Some(Value::Timestamp(Utc.with_ymd_and_hms(2024, 3, 5, 8, 0, 0).unwrap()))
    );
}

#[tokio::test]
async fn test_replace_is_atomic_when_swap_fails() {
    let ws = Workspace::new();
    let input = ws.write_items(1..=5, "old");
    let coordinator = ws.coordinator(ws.file_source(input.clone()), items_table(), LoadStrategy::Replace);
    let seeded = coordinator.run("monday", &CancellationToken::new()).await.unwrap();
    assert_eq!(seeded.status, RunStatus::Succeeded);
    assert_eq!(ws.warehouse.rows(&items_table()).len(), 5);

    ws.write_items(1..=3, "new");
    ws.warehouse.inject(Fault::swap(ErrorClass::Fatal));
    let coordinator = ws.coordinator(ws.file_source(input), items_table(), LoadStrategy::Replace);
    let err = coordinator.run("tuesday", &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, PipelineError::Warehouse(_)));

    // Readers still see the complete previous contents
    let rows = ws.warehouse.rows(&items_table());
    assert_eq!(rows.len(), 5);
    assert!(rows
        .iter()
        .all(|r| matches!(r.get("name"), Some(Value::Text(name)) if name.starts_with("old-"))));
    let state = coordinator.status("tuesday").await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Failed);

    // Resuming reuses the committed shadow chunk and finishes the swap
    let resumed = coordinator.run("tuesday", &CancellationToken::new()).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Succeeded);
    assert!(resumed.chunk(1).is_none());
    let rows = ws.warehouse.rows(&items_table());
    assert_eq!(rows.len(), 3);
    assert!(rows
        .iter()
        .all(|r| matches!(r.get("name"), Some(Value::Text(name)) if name.starts_with("new-"))));
}

#[tokio::test]
async fn test_api_source_end_to_end() {
    let ws = Workspace::new();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": 1, "name": "a"}, {"id": 2, "name": "b"}],
            "page": 1,
            "total_pages": 2
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": 3, "name": "c"}],
            "page": 2,
            "total_pages": 2
        })))
        .mount(&server)
        .await;

    let mut config = ApiSourceConfig::new(server.uri(), "items");
    config.pagination = Pagination::Page;
    let source = SourceReader::Api(ApiSource::new("items", config, 2).unwrap());

    let report = ws
        .coordinator(source, items_table(), LoadStrategy::Upsert)
        .run("api-run", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.committed_chunk_count, 2);
    assert_eq!(report.rows_written, 3);
    assert_eq!(report.chunk(1).unwrap().extract_attempts, 1);
    assert_eq!(report.chunk(2).unwrap().extract_attempts, 2);
    assert_eq!(ws.warehouse.rows(&items_table()).len(), 3);
}

#[tokio::test]
async fn test_declared_and_detected_encodings_load_the_same_rows() {
    let ws = Workspace::new();
    let mut bom = vec![0xEF, 0xBB, 0xBF];
    bom.extend_from_slice("id,name\n1,Zoë\n2,Ångström\n".as_bytes());
    let detected = ws.write("bom.csv", bom);
    // "Zoë" and "Ångström" in ISO-8859-1
    let latin1 = ws.write("latin1.csv", b"id,name\n1,Zo\xEB\n2,\xC5ngstr\xF6m\n");

    ws.coordinator(ws.file_source(detected), items_table(), LoadStrategy::Upsert)
        .run("utf8", &CancellationToken::new())
        .await
        .unwrap();
    let from_bom = ws.warehouse.rows(&items_table());

    let other = Workspace::new();
    let mut config = FileSourceConfig::new([latin1]);
    config.encoding = Some("latin1".into());
    other
        .coordinator(other.file_source_with(config), items_table(), LoadStrategy::Upsert)
        .run("latin1", &CancellationToken::new())
        .await
        .unwrap();
    let from_latin1 = other.warehouse.rows(&items_table());

    let names = |rows: &[wharf_pipeline::record::CleanRecord]| {
        rows.iter().map(|r| r.get("name").cloned()).collect::<Vec<_>>()
    };
    assert_eq!(names(&from_bom), names(&from_latin1));
    assert_eq!(from_bom[0].get("name"), Some(&Value::Text("Zoë".into())));
}

#[tokio::test]
async fn test_concurrent_run_with_same_id_is_refused() {
    let ws = Workspace::new();
    let input = ws.write_items(1..=5, "item");
    let held = ws.store().lease("nightly").await.unwrap();

    let err = ws
        .coordinator(ws.file_source(input), items_table(), LoadStrategy::Append)
        .run("nightly", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::State(StateError::Locked { .. })));
    assert!(ws.warehouse.commit_log().is_empty());
    drop(held);
}

#[test]
fn test_unknown_config_option_is_rejected() {
    let text = r#"
        [source]
        kind = "file"

        [source.file]
        paths = ["input.csv"]
        recursive = true

        [target]
        name = "items"
        columns = [{ name = "id", type = "integer" }]
    "#;
    let err = PipelineConfig::from_toml_str(text).unwrap_err();
    assert!(err.to_string().contains("recursive"), "unexpected error: {err}");

    let typo = r#"
        [source]
        kind = "file"

        [source.file]
        paths = ["input.csv"]

        [lod]
        strategy = "append"

        [target]
        name = "items"
        columns = [{ name = "id", type = "integer" }]
    "#;
    assert!(PipelineConfig::from_toml_str(typo).is_err());
}
