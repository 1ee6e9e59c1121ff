//! PostgreSQL-backed migration store.
//!
//! Migrations live in `_data_migrate.migrations` as a JSONB document next to
//! indexed status and phase columns. Conditional updates lock the row with
//! `SELECT ... FOR UPDATE`, so concurrent instances serialize on it.

use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::Pool;
use tracing::debug;
use uuid::Uuid;

use super::backend::{apply_mutation, MigrationStore, Mutation, Transition};
use crate::error::{MigrateError, Result};
use crate::migration::{Migration, MigrationStatus};

/// Schema holding engine bookkeeping tables.
pub const STATE_SCHEMA: &str = "_data_migrate";

pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn status_check() -> String {
        [
            MigrationStatus::Initialized,
            MigrationStatus::InProgress,
            MigrationStatus::Paused,
            MigrationStatus::Completed,
            MigrationStatus::Failed,
            MigrationStatus::Cancelled,
            MigrationStatus::RolledBack,
        ]
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
    }
}

fn decode(document: serde_json::Value) -> Result<Migration> {
    serde_json::from_value(document)
        .map_err(|e| MigrateError::State(format!("Corrupt migration document: {}", e)))
}

#[async_trait]
impl MigrationStore for PgStore {
    async fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get().await?;

        conn.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", STATE_SCHEMA), &[])
            .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.migrations (
                    id UUID PRIMARY KEY,
                    project_code TEXT NOT NULL UNIQUE,
                    status TEXT NOT NULL CHECK (status IN ({})),
                    current_phase TEXT NOT NULL,
                    document JSONB NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                STATE_SCHEMA,
                Self::status_check()
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_migrations_status
                    ON {}.migrations(status, updated_at DESC)",
                STATE_SCHEMA
            ),
            &[],
        )
        .await?;

        debug!("Initialized migration state tables in {}", STATE_SCHEMA);
        Ok(())
    }

    async fn save(&self, migration: &Migration) -> Result<()> {
        let conn = self.pool.get().await?;
        let document = serde_json::to_value(migration)?;
        conn.execute(
            &format!(
                "INSERT INTO {}.migrations
                    (id, project_code, status, current_phase, document, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (id) DO UPDATE SET
                    status = EXCLUDED.status,
                    current_phase = EXCLUDED.current_phase,
                    document = EXCLUDED.document,
                    updated_at = EXCLUDED.updated_at",
                STATE_SCHEMA
            ),
            &[
                &migration.id,
                &migration.project_code,
                &migration.status.as_str(),
                &migration.current_phase.as_str(),
                &document,
                &migration.created_at,
                &migration.updated_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Migration>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!("SELECT document FROM {}.migrations WHERE id = $1", STATE_SCHEMA),
                &[&id],
            )
            .await?;
        row.map(|r| decode(r.get(0))).transpose()
    }

    async fn project_code_exists(&self, code: &str) -> Result<bool> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT 1 FROM {}.migrations WHERE project_code = $1",
                    STATE_SCHEMA
                ),
                &[&code],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let conn = self.pool.get().await?;
        let n = conn
            .execute(
                &format!("DELETE FROM {}.migrations WHERE id = $1", STATE_SCHEMA),
                &[&id],
            )
            .await?;
        Ok(n > 0)
    }

    async fn update_if_status(
        &self,
        id: Uuid,
        expected: &[MigrationStatus],
        apply: Mutation<'_>,
    ) -> Result<Transition> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        let row = tx
            .query_opt(
                &format!(
                    "SELECT document FROM {}.migrations WHERE id = $1 FOR UPDATE",
                    STATE_SCHEMA
                ),
                &[&id],
            )
            .await?
            .ok_or(MigrateError::NotFound(id))?;
        let mut migration = decode(row.get(0))?;

        if let Some(actual) = apply_mutation(&mut migration, expected, apply) {
            tx.rollback().await?;
            return Ok(Transition::Rejected(actual));
        }

        let document = serde_json::to_value(&migration)?;
        tx.execute(
            &format!(
                "UPDATE {}.migrations
                 SET status = $2, current_phase = $3, document = $4, updated_at = $5
                 WHERE id = $1",
                STATE_SCHEMA
            ),
            &[
                &id,
                &migration.status.as_str(),
                &migration.current_phase.as_str(),
                &document,
                &Utc::now(),
            ],
        )
        .await?;
        tx.commit().await?;

        Ok(Transition::Applied(Box::new(migration)))
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_check_lists_every_status() {
        let check = PgStore::status_check();
        assert!(check.contains("'IN_PROGRESS'"));
        assert!(check.contains("'ROLLED_BACK'"));
        assert_eq!(check.matches('\'').count(), 14);
    }
}
