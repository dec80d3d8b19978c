//! Run state as JSON files
//!
//! `<dir>/<run>.json` holds the state, replaced atomically through a temp file
//! and rename. `<dir>/<run>.lock` marks the lease; it is created with
//! `create_new` so only one process can hold it, and removed when the lease
//! drops. A process that dies keeps its lock file until `force_unlock`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{holder_id, LeaseGuard, RunLease, RunState, RunStateStore};
use crate::error::StateError;
use crate::staging::path_segment;

#[derive(Debug, Clone)]
pub struct FileRunStateStore {
    dir: PathBuf,
}

#[derive(Debug)]
struct LockFile {
    path: PathBuf,
}

impl LeaseGuard for LockFile {}

impl Drop for LockFile {
    fn drop(&mut self) {
        // Synchronous so the run id is free again as soon as the lease is gone.
        // A single unlink; a lease is dropped once per run.
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove run lock");
            }
        }
    }
}

impl FileRunStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", path_segment(run_id)))
    }

    fn lock_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", path_segment(run_id)))
    }

    async fn ensure_dir(&self) -> Result<(), StateError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StateError::io(&self.dir, e))
    }
}

#[async_trait]
impl RunStateStore for FileRunStateStore {
    async fn load(&self, run_id: &str) -> Result<Option<RunState>, StateError> {
        let path = self.state_path(run_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::io(&path, e)),
        }
    }

    async fn lease(&self, run_id: &str) -> Result<RunLease, StateError> {
        self.ensure_dir().await?;
        let path = self.lock_path(run_id);
        let holder = holder_id();

        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        let mut file = match opened {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let current = tokio::fs::read_to_string(&path).await.unwrap_or_default();
                return Err(StateError::Locked {
                    run_id: run_id.to_string(),
                    holder: current.trim().to_string(),
                });
            },
            Err(e) => return Err(StateError::io(&path, e)),
        };

        let guard = LockFile { path: path.clone() };
        file.write_all(holder.as_bytes())
            .await
            .map_err(|e| StateError::io(&path, e))?;
        file.sync_all().await.map_err(|e| StateError::io(&path, e))?;

        debug!(run_id, holder = %holder, "Leased run");
        Ok(RunLease::new(run_id, holder, Box::new(guard)))
    }

    async fn save(&self, lease: &RunLease, state: &RunState) -> Result<(), StateError> {
        lease.check(state)?;
        self.ensure_dir().await?;

        let target = self.state_path(&state.run_id);
        let temp = self.dir.join(format!(
            "{}.{}.tmp",
            path_segment(&state.run_id),
            uuid::Uuid::new_v4().simple()
        ));
        let contents = serde_json::to_vec_pretty(state)?;

        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| StateError::io(&temp, e))?;
        file.write_all(&contents).await.map_err(|e| StateError::io(&temp, e))?;
        file.sync_all().await.map_err(|e| StateError::io(&temp, e))?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StateError::io(&target, e));
        }
        Ok(())
    }

    async fn reset(&self, lease: &RunLease) -> Result<(), StateError> {
        let path = self.state_path(lease.run_id());
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::io(&path, e)),
        }
    }

    async fn force_unlock(&self, run_id: &str) -> Result<bool, StateError> {
        let path = self.lock_path(run_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                warn!(run_id, "Removed run lock");
                Ok(true)
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateError::io(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Cursor;
    use crate::record::ChunkKey;
    use crate::state::RunStatus;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_state_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FileRunStateStore::new(dir.path());
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = FileRunStateStore::new(dir.path());
        let lease = store.lease("run-1").await.unwrap();

        let mut state = RunState::new("run-1");
        state.status = RunStatus::PartiallyFailed;
        state.progress_mut("api").cursor = Cursor::Page { page: 3 };
        state.record_commit(ChunkKey::new("run-1", "api", 1));
        store.save(&lease, &state).await.unwrap();

        let loaded = store.load("run-1").await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_dropped() {
        let dir = TempDir::new().unwrap();
        let store = FileRunStateStore::new(dir.path());

        let lease = store.lease("run-1").await.unwrap();
        match store.lease("run-1").await {
            Err(StateError::Locked { holder, .. }) => assert_eq!(holder, lease.holder()),
            other => panic!("expected Locked, got {other:?}"),
        }
        // Other runs are unaffected
        assert!(store.lease("run-2").await.is_ok());

        // Released on drop, with no await in between
        drop(lease);
        assert!(!dir.path().join("run-1.lock").exists());
        assert!(store.lease("run-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_force_unlock_breaks_stale_lock() {
        let dir = TempDir::new().unwrap();
        let store = FileRunStateStore::new(dir.path());
        std::fs::write(dir.path().join("run-1.lock"), "deadhost:1").unwrap();

        assert!(store.lease("run-1").await.is_err());
        assert!(store.force_unlock("run-1").await.unwrap());
        assert!(!store.force_unlock("run-1").await.unwrap());
        assert!(store.lease("run-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_save_requires_matching_lease() {
        let dir = TempDir::new().unwrap();
        let store = FileRunStateStore::new(dir.path());
        let lease = store.lease("run-1").await.unwrap();
        assert!(store.save(&lease, &RunState::new("run-2")).await.is_err());
        assert!(store.load("run-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_removes_state() {
        let dir = TempDir::new().unwrap();
        let store = FileRunStateStore::new(dir.path());
        let lease = store.lease("run-1").await.unwrap();
        store.save(&lease, &RunState::new("run-1")).await.unwrap();
        store.reset(&lease).await.unwrap();
        assert!(store.load("run-1").await.unwrap().is_none());
        store.reset(&lease).await.unwrap();
    }
}
