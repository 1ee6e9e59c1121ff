//! Phase runner for one execution of a migration.
//!
//! Phases run in order from the migration's current phase. Between phases
//! and between batches the runner renews its lease, checks the persisted
//! status and honours local pause/cancel signals. Progress writes are fenced
//! on the lease holder recorded when the run started, so a run that lost its
//! lease to a newer one stops with `Lock` instead of writing. A phase's
//! counters are folded into the migration only once the phase finishes, so a
//! phase that restarts after a pause never counts its rows twice.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::Shared;
use crate::audit::{self, AuditEvent, AuditEventType, CompletionNotice};
use crate::core::{record_to_row, ControlSignal, SqlValue};
use crate::error::{MigrateError, Result};
use crate::extract::{Connector, ConnectorImpl, ExtractRequest};
use crate::load::sql::count_sql;
use crate::load::{LoadContext, LoadEngine, LoadResult, LoadStrategy, TargetWriter};
use crate::lock::ExecutionLease;
use crate::migration::{
    LoadTask, Migration, MigrationMetrics, MigrationPhase, MigrationPlan, MigrationStatus,
    PhaseProgress, RollbackPoint, TableLoadStats, VerificationResult,
};
use crate::state::{Mutation, Transition};
use crate::transform::run_transformation;
use crate::validation::{self, EntitySample, RuleSpec, ValidationContext};

/// Statuses under which a new rollback point is still persisted.
const RECORDABLE: [MigrationStatus; 4] = [
    MigrationStatus::InProgress,
    MigrationStatus::Paused,
    MigrationStatus::Cancelled,
    MigrationStatus::Failed,
];

/// The error a runner stops with when it finds the migration in `status`.
fn interruption_for(id: Uuid, status: MigrationStatus) -> MigrateError {
    match status {
        MigrationStatus::Paused => MigrateError::Paused,
        MigrationStatus::Cancelled => MigrateError::Cancelled,
        other => MigrateError::invalid_state(id, other, "continue"),
    }
}

/// Errors that another attempt cannot fix.
fn is_retryable(err: &MigrateError) -> bool {
    !matches!(
        err,
        MigrateError::InvalidIdentifier { .. }
            | MigrateError::InvalidRequest(_)
            | MigrateError::Config(_)
            | MigrateError::Paused
            | MigrateError::Cancelled
    )
}

/// Exponential backoff: `base * 2^attempt`.
pub(super) fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.checked_mul(1u32 << attempt.min(16))
        .unwrap_or(Duration::MAX)
}

/// Add `point`, merging repeats: a staging key is recorded once and the
/// irreversible kinds keep one running row count per table.
pub(super) fn merge_point(points: &mut Vec<RollbackPoint>, point: RollbackPoint) {
    match point {
        RollbackPoint::StagingWritten { .. } if points.contains(&point) => {}
        RollbackPoint::TableLoadedWithoutKeys { table, rows } => {
            let existing = points.iter_mut().find_map(|p| match p {
                RollbackPoint::TableLoadedWithoutKeys { table: t, rows: r } if *t == table => Some(r),
                _ => None,
            });
            match existing {
                Some(r) => *r += rows,
                None => points.push(RollbackPoint::TableLoadedWithoutKeys { table, rows }),
            }
        }
        RollbackPoint::RowsUpserted { table, rows } => {
            let existing = points.iter_mut().find_map(|p| match p {
                RollbackPoint::RowsUpserted { table: t, rows: r } if *t == table => Some(r),
                _ => None,
            });
            match existing {
                Some(r) => *r += rows,
                None => points.push(RollbackPoint::RowsUpserted { table, rows }),
            }
        }
        RollbackPoint::PartiallyLoaded { table, rows } => {
            let existing = points.iter_mut().find_map(|p| match p {
                RollbackPoint::PartiallyLoaded { table: t, rows: r } if *t == table => Some(r),
                _ => None,
            });
            match existing {
                Some(r) => *r += rows,
                None => points.push(RollbackPoint::PartiallyLoaded { table, rows }),
            }
        }
        other => points.push(other),
    }
}

fn superseded(id: Uuid) -> MigrateError {
    MigrateError::Lock(format!("migration {} was taken over by a newer run", id))
}

fn current_plan(migration: &Migration, phase: MigrationPhase) -> Result<MigrationPlan> {
    migration.plan.clone().ok_or_else(|| MigrateError::Phase {
        phase,
        message: "no execution plan; the planning phase has not run".into(),
    })
}

impl Shared {
    /// Run the remaining phases and settle the final status.
    ///
    /// Returns the migration as persisted: COMPLETED, PAUSED or CANCELLED
    /// come back as `Ok`, a failure as the error that caused it.
    pub(super) async fn run(
        self: Arc<Self>,
        mut migration: Migration,
        lease: ExecutionLease,
        control: ControlSignal,
    ) -> Result<Migration> {
        let id = migration.id;
        let started = Instant::now();
        let outcome = self.run_phases(&mut migration, &lease, &control).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let holder = lease.holder();

        let result = match outcome {
            Ok(()) => self.complete(migration, holder, elapsed_ms).await,
            Err(e) if e.is_interruption() => self.interrupted(id, holder, e, elapsed_ms).await,
            Err(e @ MigrateError::Lock(_)) => {
                error!(
                    "Migration {} lost its execution lease; leaving its state to the new holder: {}",
                    migration.project_code, e
                );
                Err(e)
            }
            Err(e) => self.fail(migration, holder, e, elapsed_ms).await,
        };

        self.remove_control(id, lease.holder());
        lease.release().await;
        result
    }

    async fn run_phases(
        &self,
        m: &mut Migration,
        lease: &ExecutionLease,
        control: &ControlSignal,
    ) -> Result<()> {
        for phase in m.current_phase.remaining() {
            lease.renew().await?;
            self.ensure_in_progress(m.id).await?;
            control.checkpoint()?;
            m.advance_phase(phase);
            self.save_progress(m, lease).await?;

            info!("Migration {}: {} phase", m.project_code, phase);
            let started = Instant::now();
            let delta = match phase {
                MigrationPhase::Planning => self.plan(m),
                MigrationPhase::Extraction => {
                    let plan = current_plan(m, phase)?;
                    self.extract(m, &plan, lease, control).await?
                }
                MigrationPhase::Transformation => {
                    let plan = current_plan(m, phase)?;
                    self.transform(m, &plan, lease, control).await?
                }
                MigrationPhase::Validation => {
                    let plan = current_plan(m, phase)?;
                    self.validate(m, &plan).await?
                }
                MigrationPhase::Loading => {
                    let plan = current_plan(m, phase)?;
                    self.load_phase(m, &plan, lease, control).await?
                }
                MigrationPhase::Verification => self.verify(m, control).await?,
                MigrationPhase::Cleanup => self.cleanup(m).await?,
            };

            m.metrics.absorb(&delta);
            match phase.next() {
                Some(next) => m.advance_phase(next),
                None => m.in_flight = None,
            }
            self.save_progress(m, lease).await?;
            debug!(
                "Migration {}: {} phase done in {:.1}s",
                m.project_code,
                phase,
                started.elapsed().as_secs_f64()
            );
        }
        Ok(())
    }

    async fn complete(&self, mut m: Migration, holder: &str, elapsed_ms: u64) -> Result<Migration> {
        let id = m.id;
        m.status = MigrationStatus::Completed;
        m.completed_at = Some(Utc::now());
        m.in_flight = None;
        m.metrics.duration_ms += elapsed_ms;

        if let Transition::Rejected(status) = self.save_owned(&m, holder).await? {
            // Paused or cancelled after the last checkpoint.
            return self
                .interrupted(id, holder, interruption_for(id, status), elapsed_ms)
                .await;
        }

        info!(
            "Migration {} completed: {} extracted, {} loaded, {} failed in {:.1}s",
            m.project_code,
            m.metrics.extracted_records,
            m.metrics.loaded_records,
            m.metrics.failed_records,
            m.metrics.duration_ms as f64 / 1000.0
        );
        self.audit(
            AuditEventType::MigrationCompleted,
            &m,
            format!("Migration {} completed", m.project_code),
        )
        .await;
        audit::notify(self.notifier.as_ref(), CompletionNotice::from_migration(&m)).await;
        Ok(m)
    }

    /// Settle a run that stopped because of a pause or cancel.
    async fn interrupted(
        &self,
        id: Uuid,
        holder: &str,
        reason: MigrateError,
        elapsed_ms: u64,
    ) -> Result<Migration> {
        let transition = self
            .update_owned(
                id,
                holder,
                &[MigrationStatus::Paused, MigrationStatus::Cancelled],
                &move |m: &mut Migration| {
                    m.in_flight = None;
                    m.metrics.duration_ms += elapsed_ms;
                },
            )
            .await?;
        let migration = match transition {
            Transition::Applied(m) => *m,
            Transition::Rejected(status) => {
                warn!("Migration {} stopped ({}) but is {}", id, reason, status);
                self.load(id).await?
            }
        };

        match migration.status {
            MigrationStatus::Paused => {
                info!(
                    "Migration {} paused at {}",
                    migration.project_code, migration.current_phase
                );
                Ok(migration)
            }
            MigrationStatus::Cancelled => {
                let migration = if migration.rollback_enabled && migration.has_work_to_undo() {
                    self.rollback(migration).await
                } else {
                    migration
                };
                audit::notify(
                    self.notifier.as_ref(),
                    CompletionNotice::from_migration(&migration),
                )
                .await;
                Ok(migration)
            }
            _ => Ok(migration),
        }
    }

    /// Record a failure, then roll back when enabled.
    async fn fail(
        &self,
        mut m: Migration,
        holder: &str,
        err: MigrateError,
        elapsed_ms: u64,
    ) -> Result<Migration> {
        error!(
            "Migration {} failed during {}: {}",
            m.project_code, m.current_phase, err
        );
        m.record_failure(&err);
        m.metrics.duration_ms += elapsed_ms;

        match self.save_owned(&m, holder).await {
            Ok(Transition::Applied(_)) => {}
            Ok(Transition::Rejected(status)) => {
                warn!(
                    "Migration {} was {} when its failure was recorded",
                    m.project_code, status
                );
                if let Err(e) = self
                    .interrupted(m.id, holder, interruption_for(m.id, status), elapsed_ms)
                    .await
                {
                    warn!("Could not settle migration {}: {}", m.id, e);
                }
                return Err(err);
            }
            Err(e) => {
                error!("Failed to persist failure of migration {}: {}", m.id, e);
                return Err(err);
            }
        }

        audit::emit(
            self.audit.as_ref(),
            AuditEvent::for_migration(
                AuditEventType::MigrationFailed,
                &m,
                format!("Migration {} failed", m.project_code),
            )
            .with_metadata("error", err.to_string()),
        )
        .await;

        if m.rollback_enabled && m.has_work_to_undo() {
            m = self.rollback(m).await;
        }
        audit::notify(self.notifier.as_ref(), CompletionNotice::from_migration(&m)).await;
        Err(err)
    }

    async fn ensure_in_progress(&self, id: Uuid) -> Result<()> {
        match self.load(id).await?.status {
            MigrationStatus::InProgress => Ok(()),
            status => Err(interruption_for(id, status)),
        }
    }

    /// Conditional update that applies only while `holder` still owns the
    /// migration. A superseded run gets `Lock` and writes nothing.
    async fn update_owned(
        &self,
        id: Uuid,
        holder: &str,
        expected: &[MigrationStatus],
        apply: Mutation<'_>,
    ) -> Result<Transition> {
        let owner = holder.to_string();
        let transition = self
            .store
            .update_if_status(id, expected, &move |stored: &mut Migration| {
                if stored.execution_holder.as_deref() == Some(owner.as_str()) {
                    apply(stored);
                }
            })
            .await?;
        match transition {
            Transition::Applied(stored) if stored.execution_holder.as_deref() != Some(holder) => {
                Err(superseded(id))
            }
            other => Ok(other),
        }
    }

    /// Overwrite the whole stored document while this run owns it and it is
    /// still IN_PROGRESS.
    async fn save_owned(&self, m: &Migration, holder: &str) -> Result<Transition> {
        let replacement = m.clone();
        self.update_owned(
            m.id,
            holder,
            &[MigrationStatus::InProgress],
            &move |stored: &mut Migration| *stored = replacement.clone(),
        )
        .await
    }

    async fn save_progress(&self, m: &Migration, lease: &ExecutionLease) -> Result<()> {
        match self.save_owned(m, lease.holder()).await? {
            Transition::Applied(_) => Ok(()),
            Transition::Rejected(status) => Err(interruption_for(m.id, status)),
        }
    }

    /// Renew the lease and persist in-flight progress for the current phase.
    async fn report_progress(
        &self,
        m: &mut Migration,
        lease: &ExecutionLease,
        processed: u64,
    ) -> Result<()> {
        lease.renew().await?;
        let progress = PhaseProgress {
            phase: m.current_phase,
            processed_records: processed,
            updated_at: Some(Utc::now()),
        };
        m.in_flight = Some(progress.clone());
        let transition = self
            .update_owned(
                m.id,
                lease.holder(),
                &[MigrationStatus::InProgress],
                &move |stored: &mut Migration| stored.in_flight = Some(progress.clone()),
            )
            .await?;
        match transition {
            Transition::Applied(_) => Ok(()),
            Transition::Rejected(status) => Err(interruption_for(m.id, status)),
        }
    }

    /// Persist a rollback point as soon as the work it describes is done.
    async fn record_point(&self, m: &mut Migration, point: RollbackPoint) -> Result<()> {
        merge_point(&mut m.rollback_points, point.clone());
        let transition = self
            .store
            .update_if_status(m.id, &RECORDABLE, &move |stored: &mut Migration| {
                merge_point(&mut stored.rollback_points, point.clone())
            })
            .await?;
        if let Transition::Rejected(status) = transition {
            warn!(
                "Rollback point for migration {} not persisted: status is {}",
                m.project_code, status
            );
        }
        Ok(())
    }

    fn plan(&self, m: &mut Migration) -> MigrationMetrics {
        let plan = MigrationPlan::build(m.id, &m.entities, m.load_strategy, &m.validation_rules);
        info!(
            "Planned migration {}: {} extraction, {} transformation, {} load tasks, {} rules",
            m.project_code,
            plan.extraction_tasks.len(),
            plan.transformation_tasks.len(),
            plan.load_tasks.len(),
            plan.validation_rules.len()
        );
        m.plan = Some(plan);
        MigrationMetrics::default()
    }

    async fn extract(
        &self,
        m: &mut Migration,
        plan: &MigrationPlan,
        lease: &ExecutionLease,
        control: &ControlSignal,
    ) -> Result<MigrationMetrics> {
        let connector = self.connectors.for_source(&m.source_system)?;
        let outcome = self.extract_entities(m, plan, &connector, lease, control).await;
        connector.close().await;
        outcome
    }

    async fn extract_entities(
        &self,
        m: &mut Migration,
        plan: &MigrationPlan,
        connector: &ConnectorImpl,
        lease: &ExecutionLease,
        control: &ControlSignal,
    ) -> Result<MigrationMetrics> {
        let mut delta = MigrationMetrics::default();
        for task in &plan.extraction_tasks {
            control.checkpoint()?;
            self.staging.clear(&task.staging_key).await?;
            self.record_point(
                m,
                RollbackPoint::StagingWritten {
                    key: task.staging_key.clone(),
                },
            )
            .await?;

            let request = ExtractRequest::from_task(task, m.batch_size, &self.config.migration);
            let summary = connector
                .extract(&request, self.staging.clone(), control)
                .await?;
            if summary.is_total_failure() {
                return Err(MigrateError::extraction(
                    &task.entity,
                    summary.errors.join("; "),
                ));
            }
            for e in &summary.errors {
                warn!("Extraction of {}: {}", task.entity, e);
            }
            info!(
                "Extracted {} records of {} from {} ({} failed, {} bytes)",
                summary.records_extracted,
                task.entity,
                connector.kind(),
                summary.records_failed,
                summary.bytes_processed
            );

            delta.total_records += summary.records_extracted + summary.records_failed;
            delta.extracted_records += summary.records_extracted;
            delta.failed_records += summary.records_failed;
            delta.processed_records += summary.records_failed;
            delta.bytes_processed += summary.bytes_processed;
            self.report_progress(m, lease, delta.processed_records).await?;
        }
        Ok(delta)
    }

    async fn transform(
        &self,
        m: &mut Migration,
        plan: &MigrationPlan,
        lease: &ExecutionLease,
        control: &ControlSignal,
    ) -> Result<MigrationMetrics> {
        let mut delta = MigrationMetrics::default();
        for task in &plan.transformation_tasks {
            control.checkpoint()?;
            self.record_point(
                m,
                RollbackPoint::StagingWritten {
                    key: task.output_key.clone(),
                },
            )
            .await?;

            let summary = run_transformation(
                task,
                &self.transforms,
                self.staging.as_ref(),
                m.batch_size,
                control,
            )
            .await?;
            if summary.rejected > 0 {
                warn!(
                    "{} records of {} rejected by transformation (first: {})",
                    summary.rejected,
                    task.entity,
                    summary.errors.first().map(String::as_str).unwrap_or("-")
                );
            }

            delta.transformed_records += summary.transformed;
            delta.failed_records += summary.rejected;
            delta.processed_records += summary.rejected;
            self.report_progress(m, lease, delta.processed_records).await?;
        }
        Ok(delta)
    }

    async fn validate(&self, m: &mut Migration, plan: &MigrationPlan) -> Result<MigrationMetrics> {
        let defaults = &self.config.migration;
        let mut context = ValidationContext::new(plan.validation_rules.clone())
            .with_business(self.business.clone())
            .with_completeness_threshold(defaults.get_completeness_threshold());
        for task in &plan.load_tasks {
            let fields = m
                .entities
                .iter()
                .find(|e| e.name == task.entity)
                .map(|e| e.fields.clone())
                .unwrap_or_default();
            let records = self
                .staging
                .sample(&task.input_key, defaults.get_sample_size())
                .await?;
            context = context.with_entity(task.entity.clone(), EntitySample::from_records(records, fields));
        }
        context.reference_sets = self.reference_sets_for(plan).await?;

        let result = validation::validate(&context);
        info!("Validation of {}: {}", m.project_code, result.summary);
        let delta = MigrationMetrics {
            validation_score: Some(result.score as f64),
            validation_errors: result.errors.len() as u64,
            ..Default::default()
        };
        let passed = result.passed;
        let summary = result.summary.clone();
        m.validation = Some(result);

        if !passed {
            if m.strict_validation {
                m.metrics.absorb(&delta);
                return Err(MigrateError::ValidationFailed(summary));
            }
            warn!(
                "Validation of {} failed; continuing because strict validation is off",
                m.project_code
            );
        }
        Ok(delta)
    }

    /// Reference sets for REFERENTIAL rules: the registered ones, plus
    /// `entity.column` sets read from this migration's own transformed data.
    async fn reference_sets_for(&self, plan: &MigrationPlan) -> Result<HashMap<String, HashSet<String>>> {
        let mut sets = self.reference_sets.clone();
        for rule in &plan.validation_rules {
            let RuleSpec::Referential { checks } = &rule.spec else {
                continue;
            };
            for check in checks {
                if sets.contains_key(&check.reference) {
                    continue;
                }
                let Some((entity, column)) = check.reference.split_once('.') else {
                    continue;
                };
                let Some(task) = plan.load_tasks.iter().find(|t| t.entity == entity) else {
                    continue;
                };
                let values: HashSet<String> = self
                    .staging
                    .read_all(&task.input_key)
                    .await?
                    .iter()
                    .filter_map(|r| r.get(column).and_then(SqlValue::as_text))
                    .collect();
                debug!("Reference set {} has {} values", check.reference, values.len());
                sets.insert(check.reference.clone(), values);
            }
        }
        Ok(sets)
    }

    async fn load_phase(
        &self,
        m: &mut Migration,
        plan: &MigrationPlan,
        lease: &ExecutionLease,
        control: &ControlSignal,
    ) -> Result<MigrationMetrics> {
        let writer = self.writer(&m.target_system).await?;
        self.undo_stale_loads(m, &writer, lease).await?;
        m.load_stats.clear();

        let engine = LoadEngine::new(writer)
            .with_progress_interval(self.config.migration.get_progress_log_interval());
        let mut delta = MigrationMetrics::default();
        for task in &plan.load_tasks {
            control.checkpoint()?;
            let stats = self
                .load_table(m, task, &engine, lease, control, &mut delta)
                .await?;
            info!(
                "Loaded {} rows into {} ({} failed, {})",
                stats.loaded,
                stats.table,
                stats.failed,
                stats.strategy.as_str()
            );
            m.load_stats.push(stats);
            self.save_progress(m, lease).await?;
        }
        Ok(delta)
    }

    /// Remove keyed rows an interrupted earlier attempt loaded, so the
    /// reload starts from the original baseline.
    async fn undo_stale_loads(
        &self,
        m: &mut Migration,
        writer: &Arc<dyn TargetWriter>,
        lease: &ExecutionLease,
    ) -> Result<()> {
        let stale: Vec<RollbackPoint> = m
            .rollback_points
            .iter()
            .filter(|p| matches!(p, RollbackPoint::RowsLoaded { .. }))
            .cloned()
            .collect();
        for point in m.rollback_points.iter().filter(|p| {
            matches!(
                p,
                RollbackPoint::TableLoadedWithoutKeys { .. }
                    | RollbackPoint::RowsUpserted { .. }
                    | RollbackPoint::PartiallyLoaded { .. }
            )
        }) {
            warn!(
                "{} from an earlier attempt cannot be removed; reloading may duplicate them",
                point.describe()
            );
        }
        if stale.is_empty() {
            return Ok(());
        }

        info!(
            "Removing {} row sets loaded by an earlier attempt of {}",
            stale.len(),
            m.project_code
        );
        for point in stale.iter().rev() {
            self.undo(point, Some(writer)).await?;
        }
        m.rollback_points
            .retain(|p| !matches!(p, RollbackPoint::RowsLoaded { .. }));
        self.save_progress(m, lease).await
    }

    async fn load_table(
        &self,
        m: &mut Migration,
        task: &LoadTask,
        engine: &LoadEngine,
        lease: &ExecutionLease,
        control: &ControlSignal,
        delta: &mut MigrationMetrics,
    ) -> Result<TableLoadStats> {
        let writer = engine.writer();
        let count_query = count_sql(writer.dialect(), task.schema.as_deref(), &task.table)?;
        let mut stats = TableLoadStats {
            schema: task.schema.clone(),
            table: task.table.clone(),
            baseline_rows: writer.query_count(&count_query).await?,
            loaded: 0,
            failed: 0,
            strategy: task.strategy,
        };

        let batch_size = m.batch_size.max(1);
        let mut columns = task.columns.clone();
        let mut offset = 0;
        loop {
            let records = self
                .staging
                .read_range(&task.input_key, offset, batch_size)
                .await?;
            let Some(first) = records.first() else {
                break;
            };
            if columns.is_empty() {
                columns = first.keys().cloned().collect();
            }

            let ctx = LoadContext {
                batch_id: format!("{}#{}", task.entity, offset / batch_size + 1),
                schema: task.schema.clone(),
                table: task.table.clone(),
                columns: columns.clone(),
                key_columns: task.key_columns.clone(),
                strategy: task.strategy,
                rows: records.iter().map(|r| record_to_row(r, &columns)).collect(),
                fail_fast: m.fail_fast,
                parallelism: m.parallelism,
            };
            let result = self
                .load_with_retry(engine, &ctx, m.retry_attempts, control)
                .await?;

            if result.loaded > 0 {
                let point = if task.strategy == LoadStrategy::Upsert {
                    RollbackPoint::RowsUpserted {
                        table: task.table.clone(),
                        rows: result.loaded,
                    }
                } else if task.key_columns.is_empty() {
                    RollbackPoint::TableLoadedWithoutKeys {
                        table: task.table.clone(),
                        rows: result.loaded,
                    }
                } else if result.failed > 0 {
                    RollbackPoint::PartiallyLoaded {
                        table: task.table.clone(),
                        rows: result.loaded,
                    }
                } else {
                    RollbackPoint::RowsLoaded {
                        schema: task.schema.clone(),
                        table: task.table.clone(),
                        key_columns: task.key_columns.clone(),
                        keys: records
                            .iter()
                            .map(|r| {
                                task.key_columns
                                    .iter()
                                    .map(|k| r.get(k).cloned().unwrap_or(SqlValue::Null))
                                    .collect()
                            })
                            .collect(),
                    }
                };
                self.record_point(m, point).await?;
            }
            if let Some(error) = &result.error {
                warn!(
                    "Batch {} into {}: {} rows failed: {}",
                    ctx.batch_id, task.table, result.failed, error
                );
            }

            stats.loaded += result.loaded;
            stats.failed += result.failed;
            delta.loaded_records += result.loaded;
            delta.successful_records += result.loaded;
            delta.failed_records += result.failed;
            delta.processed_records += result.loaded + result.failed;
            offset += records.len();

            self.report_progress(m, lease, delta.processed_records).await?;
            control.checkpoint()?;
        }
        Ok(stats)
    }

    /// Load one batch, retrying whole-batch failures with exponential backoff.
    async fn load_with_retry(
        &self,
        engine: &LoadEngine,
        ctx: &LoadContext,
        retries: u32,
        control: &ControlSignal,
    ) -> Result<LoadResult> {
        let backoff = self.config.migration.get_retry_backoff();
        let mut attempt: u32 = 0;
        loop {
            let failure = match engine.load_batch(ctx).await {
                Ok(result) if result.loaded > 0 || result.failed == 0 => return Ok(result),
                Ok(result) => result
                    .error
                    .unwrap_or_else(|| format!("{} rows failed", result.failed)),
                Err(e) if !is_retryable(&e) => return Err(e),
                Err(e) => e.to_string(),
            };

            if attempt >= retries {
                return Err(MigrateError::load(
                    &ctx.table,
                    format!(
                        "batch {} failed after {} attempts: {}",
                        ctx.batch_id,
                        attempt + 1,
                        failure
                    ),
                ));
            }
            let delay = retry_delay(backoff, attempt);
            warn!(
                "Batch {} into {} failed (attempt {}/{}): {}; retrying in {:?}",
                ctx.batch_id,
                ctx.table,
                attempt + 1,
                retries + 1,
                failure,
                delay
            );
            tokio::time::sleep(delay).await;
            control.checkpoint()?;
            attempt += 1;
        }
    }

    /// Compare target row counts with what was loaded.
    async fn verify(&self, m: &mut Migration, control: &ControlSignal) -> Result<MigrationMetrics> {
        let writer = self.writer(&m.target_system).await?;
        let mut results = Vec::with_capacity(m.load_stats.len());
        let mut mismatches = Vec::new();
        for stats in &m.load_stats {
            control.checkpoint()?;
            let sql = count_sql(writer.dialect(), stats.schema.as_deref(), &stats.table)?;
            let actual = writer.query_count(&sql).await?;
            let loaded = stats.loaded as i64;
            let (expected_min, expected_max) = match stats.strategy {
                // Upserts may update existing rows instead of adding new ones.
                LoadStrategy::Upsert => (stats.baseline_rows, stats.baseline_rows + loaded),
                _ => (stats.baseline_rows + loaded, stats.baseline_rows + loaded),
            };
            let matched = (expected_min..=expected_max).contains(&actual);
            if !matched {
                mismatches.push(format!(
                    "{}: expected {}..={} rows, found {}",
                    stats.table, expected_min, expected_max, actual
                ));
            }
            results.push(VerificationResult {
                table: stats.table.clone(),
                expected_min,
                expected_max,
                actual,
                matched,
            });
        }
        m.verification = results;

        if !mismatches.is_empty() {
            let message = mismatches.join("; ");
            if m.strict_validation {
                return Err(MigrateError::Verification(message));
            }
            warn!("Row count verification for {}: {}", m.project_code, message);
        }
        Ok(MigrationMetrics::default())
    }

    async fn cleanup(&self, m: &mut Migration) -> Result<MigrationMetrics> {
        let removed = self.staging.remove_prefix(&format!("{}/", m.id)).await?;
        m.rollback_points
            .retain(|p| !matches!(p, RollbackPoint::StagingWritten { .. }));
        debug!("Removed {} staging sets of {}", removed, m.project_code);
        Ok(MigrationMetrics::default())
    }
}
