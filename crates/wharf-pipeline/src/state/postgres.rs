//! Run state in `wharf_run_state`
//!
//! The lease is a session-level advisory lock taken on a connection that is
//! pulled out of the pool for the lifetime of the lease. Dropping the lease
//! closes that connection, which releases the lock even if the process never
//! gets to say goodbye.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use tracing::{debug, warn};

use super::{holder_id, LeaseGuard, RunLease, RunState, RunStateStore};
use crate::error::StateError;

/// Advisory lock namespace, so run leases never collide with table locks
fn lock_key(run_id: &str) -> String {
    format!("wharf-run:{run_id}")
}

#[derive(Debug, Clone)]
pub struct PgRunStateStore {
    pool: PgPool,
}

#[derive(Debug)]
struct SessionLock {
    conn: Option<PoolConnection<Postgres>>,
}

impl LeaseGuard for SessionLock {}

impl Drop for SessionLock {
    fn drop(&mut self) {
        // Detached connections close on drop instead of returning to the pool
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

impl PgRunStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStateStore for PgRunStateStore {
    async fn load(&self, run_id: &str) -> Result<Option<RunState>, StateError> {
        let state: Option<Json<RunState>> = sqlx::query_scalar("SELECT state FROM wharf_run_state WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(state.map(|Json(s)| s))
    }

    async fn lease(&self, run_id: &str) -> Result<RunLease, StateError> {
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(lock_key(run_id))
            .fetch_one(&mut *conn)
            .await?;

        if !acquired {
            return Err(StateError::Locked {
                run_id: run_id.to_string(),
                holder: "another database session".into(),
            });
        }

        let holder = holder_id();
        debug!(run_id, holder = %holder, "Leased run");
        Ok(RunLease::new(run_id, holder, Box::new(SessionLock { conn: Some(conn) })))
    }

    async fn save(&self, lease: &RunLease, state: &RunState) -> Result<(), StateError> {
        lease.check(state)?;
        sqlx::query(
            r#"
            INSERT INTO wharf_run_state (run_id, status, state, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (run_id) DO UPDATE
            SET status = EXCLUDED.status, state = EXCLUDED.state, updated_at = NOW()
            "#,
        )
        .bind(&state.run_id)
        .bind(state.status.as_str())
        .bind(Json(state))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset(&self, lease: &RunLease) -> Result<(), StateError> {
        sqlx::query("DELETE FROM wharf_run_state WHERE run_id = $1")
            .bind(lease.run_id())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn force_unlock(&self, run_id: &str) -> Result<bool, StateError> {
        // A bigint advisory key shows up in pg_locks split into classid/objid
        let terminated: Option<bool> = sqlx::query_scalar(
            r#"
            SELECT bool_or(pg_terminate_backend(l.pid))
            FROM pg_locks l
            WHERE l.locktype = 'advisory'
              AND l.objsubid = 1
              AND l.objid = (hashtext($1)::bigint & 4294967295)::oid
              AND l.pid <> pg_backend_pid()
            "#,
        )
        .bind(lock_key(run_id))
        .fetch_one(&self.pool)
        .await?;

        let terminated = terminated.unwrap_or(false);
        if terminated {
            warn!(run_id, "Terminated session holding run lease");
        }
        Ok(terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_keys_are_namespaced() {
        assert_eq!(lock_key("nightly"), "wharf-run:nightly");
        assert_ne!(lock_key("a"), lock_key("b"));
    }
}
