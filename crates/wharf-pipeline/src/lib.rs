//! Wharf Pipeline Library
//!
//! Moves tabular records from a REST API, delimited files or an operational
//! database into a Postgres warehouse, one chunk at a time, so that a run
//! interrupted at any point can be resumed without losing or duplicating rows.
//!
//! # Components
//!
//! - **extract**: source readers turning a cursor into the next chunk
//! - **retry**: bounded exponential backoff with jitter for any classified error
//! - **staging**: raw chunks persisted between extraction and load
//! - **transform**: raw records to schema-typed rows
//! - **load**: append / replace / upsert / incremental writes, one transaction per chunk
//! - **state**: resumable run progress with an exclusive writer per run
//! - **coordinator**: the per-run loop tying everything together
//! - **task**: the entry point a scheduler calls
//!
//! # Example
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use wharf_pipeline::{config::PipelineConfig, task::run_task};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load("pipeline.toml")?;
//!     let report = run_task(&config, "2024-06-01", CancellationToken::new()).await?;
//!     println!("{}", report.status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod extract;
pub mod load;
pub mod record;
pub mod retry;
pub mod staging;
pub mod state;
pub mod task;
pub mod transform;

pub use coordinator::{BatchCoordinator, ChunkReport, RunReport};
pub use error::{ErrorClass, PipelineError};
pub use load::LoadStrategy;
pub use state::{RunState, RunStatus};
pub use task::{run_task, TaskOutcome};
