//! Compensating actions for failed and cancelled migrations.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::Shared;
use crate::audit::{self, AuditEvent, AuditEventType};
use crate::error::{MigrateError, Result};
use crate::load::sql::delete_by_key_sql;
use crate::load::TargetWriter;
use crate::migration::{Migration, MigrationStatus, RollbackPoint};
use crate::state::Transition;

/// What a rollback pass did, applied to the stored migration in one update.
struct RollbackOutcome {
    /// Points that could not be undone, oldest first.
    kept: Vec<RollbackPoint>,
    warnings: Vec<String>,
    error: Option<String>,
    at: DateTime<Utc>,
}

impl RollbackOutcome {
    fn apply(&self, m: &mut Migration) {
        m.rollback_points = self.kept.clone();
        m.rollback_warnings.extend(self.warnings.iter().cloned());
        match &self.error {
            Some(error) => {
                m.rollback_failed = true;
                m.rollback_error = Some(error.clone());
            }
            None => {
                m.rollback_failed = false;
                m.rollback_error = None;
                m.rolled_back_at = Some(self.at);
                if m.status == MigrationStatus::Failed {
                    m.status = MigrationStatus::RolledBack;
                }
            }
        }
    }
}

impl Shared {
    /// Undo rollback points newest first and persist the outcome.
    ///
    /// A FAILED migration becomes ROLLED_BACK; a CANCELLED one stays
    /// CANCELLED with `rolled_back_at` set. Points that could not be undone
    /// are kept and `rollback_failed` is set. Returns the migration as stored.
    pub(super) async fn rollback(&self, migration: Migration) -> Migration {
        info!(
            "Rolling back migration {} ({} points)",
            migration.project_code,
            migration.rollback_points.len()
        );

        let needs_writer = migration
            .rollback_points
            .iter()
            .any(|p| matches!(p, RollbackPoint::RowsLoaded { .. }));
        let writer = if needs_writer {
            match self.writer(&migration.target_system).await {
                Ok(writer) => Some(writer),
                Err(e) => {
                    error!(
                        "No writer for {} during rollback: {}",
                        migration.target_system, e
                    );
                    None
                }
            }
        } else {
            None
        };

        let mut kept = Vec::new();
        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        for point in migration.rollback_points.iter().rev() {
            match self.undo(point, writer.as_ref()).await {
                Ok(None) => debug!("Undid {}", point.describe()),
                Ok(Some(warning)) => {
                    warn!("{}", warning);
                    warnings.push(warning);
                }
                Err(e) => {
                    error!("Could not undo {}: {}", point.describe(), e);
                    errors.push(format!("{}: {}", point.describe(), e));
                    kept.push(point.clone());
                }
            }
        }
        kept.reverse();

        let outcome = RollbackOutcome {
            kept,
            warnings,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            at: Utc::now(),
        };
        let failed = outcome.error.is_some();
        let apply = move |m: &mut Migration| outcome.apply(m);

        let id = migration.id;
        let mut result = migration;
        match self
            .store
            .update_if_status(
                id,
                &[MigrationStatus::Failed, MigrationStatus::Cancelled],
                &apply,
            )
            .await
        {
            Ok(Transition::Applied(stored)) => result = *stored,
            Ok(Transition::Rejected(status)) => {
                warn!(
                    "Rollback of {} not recorded: migration is now {}",
                    result.project_code, status
                );
                apply(&mut result);
            }
            Err(e) => {
                error!("Failed to record rollback of {}: {}", result.project_code, e);
                apply(&mut result);
            }
        }

        let event = if failed {
            AuditEvent::for_migration(
                AuditEventType::RollbackFailed,
                &result,
                format!("Rollback of migration {} failed", result.project_code),
            )
            .with_metadata("error", result.rollback_error.clone().unwrap_or_default())
        } else {
            AuditEvent::for_migration(
                AuditEventType::MigrationRolledBack,
                &result,
                format!("Migration {} rolled back", result.project_code),
            )
            .with_metadata("warnings", result.rollback_warnings.len().to_string())
        };
        audit::emit(self.audit.as_ref(), event).await;
        result
    }

    /// Undo one point. `Ok(Some(_))` carries a warning for work that cannot
    /// be undone.
    pub(super) async fn undo(
        &self,
        point: &RollbackPoint,
        writer: Option<&Arc<dyn TargetWriter>>,
    ) -> Result<Option<String>> {
        match point {
            RollbackPoint::StagingWritten { key } => {
                self.staging.clear(key).await?;
                Ok(None)
            }
            RollbackPoint::RowsLoaded {
                schema,
                table,
                key_columns,
                keys,
            } => {
                if keys.is_empty() {
                    return Ok(None);
                }
                let writer = writer
                    .ok_or_else(|| MigrateError::load(table.as_str(), "no target writer available"))?;
                let sql = delete_by_key_sql(writer.dialect(), schema.as_deref(), table, key_columns)?;
                let removed = writer.execute_batch(&sql, keys).await?;
                debug!("Deleted {} rows from {}", removed, table);
                Ok(None)
            }
            RollbackPoint::TableLoadedWithoutKeys { table, rows } => Ok(Some(format!(
                "{} rows loaded into {} cannot be removed: the table has no key columns",
                rows, table
            ))),
            RollbackPoint::RowsUpserted { table, rows } => Ok(Some(format!(
                "{} rows upserted into {} cannot be reverted",
                rows, table
            ))),
            RollbackPoint::PartiallyLoaded { table, rows } => Ok(Some(format!(
                "{} rows from partially failed batches in {} cannot be identified for removal",
                rows, table
            ))),
        }
    }
}
