//! Persisted run progress
//!
//! A [`RunState`] is the only record of how far a logical run got: the cursor
//! of every source, the chunks the warehouse has committed and the chunks that
//! failed. Exactly one writer may hold a run at a time, enforced through a
//! [`RunLease`] handed out by the store.

pub mod file;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{ErrorClass, StateError};
use crate::extract::Cursor;
use crate::record::ChunkKey;

pub use file::FileRunStateStore;
pub use postgres::PgRunStateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    PartiallyFailed,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::PartiallyFailed => "partially_failed",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Furthest stage a chunk reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkPhase {
    Pending,
    Extracting,
    Staged,
    Transforming,
    Loading,
    Committed,
    Failed,
}

impl ChunkPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkPhase::Pending => "pending",
            ChunkPhase::Extracting => "extracting",
            ChunkPhase::Staged => "staged",
            ChunkPhase::Transforming => "transforming",
            ChunkPhase::Loading => "loading",
            ChunkPhase::Committed => "committed",
            ChunkPhase::Failed => "failed",
        }
    }
}

/// Resume point of one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceProgress {
    /// Cursor after the last contiguous committed chunk
    pub cursor: Cursor,
    /// Sequence number the chunk at `cursor` will carry
    pub next_sequence: u64,
}

impl Default for SourceProgress {
    fn default() -> Self {
        Self {
            cursor: Cursor::Origin,
            next_sequence: 1,
        }
    }
}

/// A chunk that did not reach the warehouse, with enough context to diagnose it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub key: ChunkKey,
    /// Stage the chunk was in when it failed
    pub phase: ChunkPhase,
    pub class: ErrorClass,
    pub attempts: u32,
    pub cause: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceProgress>,
    /// Only grows, except through a full reset
    #[serde(default)]
    pub committed: BTreeSet<ChunkKey>,
    /// Failures of the latest attempt
    #[serde(default)]
    pub failures: Vec<ChunkFailure>,
    /// Number of times the run was started
    #[serde(default)]
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            status: RunStatus::Pending,
            sources: BTreeMap::new(),
            committed: BTreeSet::new(),
            failures: Vec::new(),
            attempt: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn progress(&self, source_id: &str) -> SourceProgress {
        self.sources.get(source_id).cloned().unwrap_or_default()
    }

    pub fn progress_mut(&mut self, source_id: &str) -> &mut SourceProgress {
        self.sources.entry(source_id.to_string()).or_default()
    }

    pub fn is_committed(&self, key: &ChunkKey) -> bool {
        self.committed.contains(key)
    }

    /// Add a committed chunk; returns false when it was already recorded
    pub fn record_commit(&mut self, key: ChunkKey) -> bool {
        self.failures.retain(|f| f.key != key);
        self.committed.insert(key)
    }

    /// Record a failure, replacing an earlier one for the same chunk
    pub fn record_failure(&mut self, failure: ChunkFailure) {
        self.failures.retain(|f| f.key != failure.key);
        self.failures.push(failure);
    }

    pub fn committed_for<'a>(&'a self, source_id: &'a str) -> impl Iterator<Item = &'a ChunkKey> + 'a {
        self.committed.iter().filter(move |k| k.source_id == source_id)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Keeps a run leased while alive; dropping it releases the run
pub trait LeaseGuard: Send + Sync + fmt::Debug {}

/// Exclusive right to write one run's state
#[derive(Debug)]
pub struct RunLease {
    run_id: String,
    holder: String,
    _guard: Box<dyn LeaseGuard>,
}

impl RunLease {
    pub fn new(run_id: impl Into<String>, holder: impl Into<String>, guard: Box<dyn LeaseGuard>) -> Self {
        Self {
            run_id: run_id.into(),
            holder: holder.into(),
            _guard: guard,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Fail unless this lease covers `state`
    pub fn check(&self, state: &RunState) -> Result<(), StateError> {
        if self.run_id != state.run_id {
            return Err(StateError::LeaseMismatch {
                lease_run_id: self.run_id.clone(),
                state_run_id: state.run_id.clone(),
            });
        }
        Ok(())
    }
}

/// `hostname:pid` of this process
pub fn holder_id() -> String {
    let host = hostname::get()
        .unwrap_or_else(|_| "unknown".into())
        .to_string_lossy()
        .to_string();
    format!("{host}:{}", std::process::id())
}

/// Durable store of run states.
///
/// Reads are always allowed; writes require the run's lease.
#[async_trait]
pub trait RunStateStore: Send + Sync {
    async fn load(&self, run_id: &str) -> Result<Option<RunState>, StateError>;

    /// Take the exclusive writer lease, failing with `Locked` when held elsewhere
    async fn lease(&self, run_id: &str) -> Result<RunLease, StateError>;

    async fn save(&self, lease: &RunLease, state: &RunState) -> Result<(), StateError>;

    /// Delete the run's state
    async fn reset(&self, lease: &RunLease) -> Result<(), StateError>;

    /// Break a lease left behind by a dead process; returns whether one existed
    async fn force_unlock(&self, run_id: &str) -> Result<bool, StateError>;
}
