//! PostgreSQL lease table.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use std::time::Duration;

use super::DistributedLock;
use crate::error::{MigrateError, Result};
use crate::state::STATE_SCHEMA;

/// Lease lock shared by every instance pointed at the same database.
///
/// Acquisition is a single upsert that only overwrites a row whose lease has
/// expired or that already belongs to the caller. Expiry uses the database
/// clock, so instance clock skew does not matter.
pub struct PgLeaseLock {
    pool: Pool,
}

impl PgLeaseLock {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get().await.map_err(lock_err)?;
        conn.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", STATE_SCHEMA), &[])
            .await
            .map_err(lock_err)?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.locks (
                    lock_key TEXT PRIMARY KEY,
                    holder TEXT NOT NULL,
                    acquired_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    expires_at TIMESTAMPTZ NOT NULL
                )",
                STATE_SCHEMA
            ),
            &[],
        )
        .await
        .map_err(lock_err)?;
        Ok(())
    }
}

fn lock_err(e: impl std::fmt::Display) -> MigrateError {
    MigrateError::Lock(e.to_string())
}

#[async_trait]
impl DistributedLock for PgLeaseLock {
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> Result<bool> {
        let conn = self.pool.get().await.map_err(lock_err)?;
        let seconds = lease.as_secs_f64();
        let n = conn
            .execute(
                &format!(
                    "INSERT INTO {schema}.locks (lock_key, holder, acquired_at, expires_at)
                     VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3))
                     ON CONFLICT (lock_key) DO UPDATE SET
                        holder = EXCLUDED.holder,
                        acquired_at = CASE
                            WHEN {schema}.locks.holder = EXCLUDED.holder
                            THEN {schema}.locks.acquired_at
                            ELSE EXCLUDED.acquired_at
                        END,
                        expires_at = EXCLUDED.expires_at
                     WHERE {schema}.locks.holder = EXCLUDED.holder
                        OR {schema}.locks.expires_at <= NOW()",
                    schema = STATE_SCHEMA
                ),
                &[&key, &holder, &seconds],
            )
            .await
            .map_err(lock_err)?;
        Ok(n == 1)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<()> {
        let conn = self.pool.get().await.map_err(lock_err)?;
        conn.execute(
            &format!(
                "DELETE FROM {}.locks WHERE lock_key = $1 AND holder = $2",
                STATE_SCHEMA
            ),
            &[&key, &holder],
        )
        .await
        .map_err(lock_err)?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
