//! The migration aggregate and its lifecycle vocabulary.

mod metrics;
mod plan;
mod request;

pub use metrics::{
    estimate_remaining_seconds, progress_percentage, MigrationMetrics, PhaseProgress, Progress,
};
pub use plan::{ExtractionTask, LoadTask, MigrationPlan, TransformationTask};
pub use request::{ColumnMapping, EntitySpec, FieldDefinition, MigrationRequest};

use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::config::MigrationDefaults;
use crate::core::SqlValue;
use crate::error::{MigrateError, Result};
use crate::load::LoadStrategy;
use crate::validation::{ValidationResult, ValidationRule};

/// Longest error detail persisted with a failed migration.
pub const MAX_ERROR_DETAIL_CHARS: usize = 4000;

/// Lifecycle status of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    Initialized,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl MigrationStatus {
    /// COMPLETED, CANCELLED and ROLLED_BACK accept no further transitions.
    /// FAILED can still be cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Completed | MigrationStatus::Cancelled | MigrationStatus::RolledBack
        )
    }

    pub const NON_TERMINAL: [MigrationStatus; 4] = [
        MigrationStatus::Initialized,
        MigrationStatus::InProgress,
        MigrationStatus::Paused,
        MigrationStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Initialized => "INITIALIZED",
            MigrationStatus::InProgress => "IN_PROGRESS",
            MigrationStatus::Paused => "PAUSED",
            MigrationStatus::Completed => "COMPLETED",
            MigrationStatus::Failed => "FAILED",
            MigrationStatus::Cancelled => "CANCELLED",
            MigrationStatus::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "INITIALIZED" => Ok(MigrationStatus::Initialized),
            "IN_PROGRESS" => Ok(MigrationStatus::InProgress),
            "PAUSED" => Ok(MigrationStatus::Paused),
            "COMPLETED" => Ok(MigrationStatus::Completed),
            "FAILED" => Ok(MigrationStatus::Failed),
            "CANCELLED" => Ok(MigrationStatus::Cancelled),
            "ROLLED_BACK" => Ok(MigrationStatus::RolledBack),
            _ => Err(MigrateError::State(format!("Invalid migration status: {}", s))),
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationPhase {
    #[default]
    Planning,
    Extraction,
    Transformation,
    Validation,
    Loading,
    Verification,
    Cleanup,
}

impl MigrationPhase {
    pub const ALL: [MigrationPhase; 7] = [
        MigrationPhase::Planning,
        MigrationPhase::Extraction,
        MigrationPhase::Transformation,
        MigrationPhase::Validation,
        MigrationPhase::Loading,
        MigrationPhase::Verification,
        MigrationPhase::Cleanup,
    ];

    pub fn next(&self) -> Option<MigrationPhase> {
        let idx = Self::ALL.iter().position(|p| p == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    /// Phases from `self` (inclusive) to the end.
    pub fn remaining(self) -> impl Iterator<Item = MigrationPhase> {
        Self::ALL.into_iter().filter(move |p| *p >= self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::Planning => "PLANNING",
            MigrationPhase::Extraction => "EXTRACTION",
            MigrationPhase::Transformation => "TRANSFORMATION",
            MigrationPhase::Validation => "VALIDATION",
            MigrationPhase::Loading => "LOADING",
            MigrationPhase::Verification => "VERIFICATION",
            MigrationPhase::Cleanup => "CLEANUP",
        }
    }

    /// Lower-case segment used in staging keys.
    pub fn slug(&self) -> &'static str {
        match self {
            MigrationPhase::Planning => "planning",
            MigrationPhase::Extraction => "extraction",
            MigrationPhase::Transformation => "transformation",
            MigrationPhase::Validation => "validation",
            MigrationPhase::Loading => "loading",
            MigrationPhase::Verification => "verification",
            MigrationPhase::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something done by a phase that rollback knows how to undo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollbackPoint {
    /// A staging set was written; undo removes it.
    StagingWritten { key: String },
    /// Rows were inserted into a keyed table; undo deletes them by key.
    RowsLoaded {
        schema: Option<String>,
        table: String,
        key_columns: Vec<String>,
        keys: Vec<Vec<SqlValue>>,
    },
    /// Rows were loaded into a table without key columns; cannot be undone.
    TableLoadedWithoutKeys { table: String, rows: u64 },
    /// Rows were upserted; prior values are not kept, so this cannot be undone.
    RowsUpserted { table: String, rows: u64 },
    /// Rows from batches that partly failed; which rows landed is unknown.
    PartiallyLoaded { table: String, rows: u64 },
}

impl RollbackPoint {
    pub fn describe(&self) -> String {
        match self {
            RollbackPoint::StagingWritten { key } => format!("staging {}", key),
            RollbackPoint::RowsLoaded { table, keys, .. } => {
                format!("{} rows in {}", keys.len(), table)
            }
            RollbackPoint::TableLoadedWithoutKeys { table, rows } => {
                format!("{} unkeyed rows in {}", rows, table)
            }
            RollbackPoint::RowsUpserted { table, rows } => {
                format!("{} upserted rows in {}", rows, table)
            }
            RollbackPoint::PartiallyLoaded { table, rows } => {
                format!("{} rows of partial batches in {}", rows, table)
            }
        }
    }
}

/// Load outcome for one target table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableLoadStats {
    pub schema: Option<String>,
    pub table: String,
    /// Target row count before this execution loaded anything.
    pub baseline_rows: i64,
    pub loaded: u64,
    pub failed: u64,
    /// Strategy used; UPSERT may update rather than add rows.
    pub strategy: LoadStrategy,
}

/// Row count comparison for one target table after loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub table: String,
    pub expected_min: i64,
    pub expected_max: i64,
    pub actual: i64,
    pub matched: bool,
}

/// The root aggregate. Owned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub project_code: String,
    pub source_system: String,
    pub target_system: String,
    pub status: MigrationStatus,
    pub current_phase: MigrationPhase,

    pub batch_size: usize,
    pub parallelism: usize,
    pub retry_attempts: u32,
    pub rollback_enabled: bool,
    pub strict_validation: bool,
    pub fail_fast: bool,
    pub load_strategy: LoadStrategy,
    pub entities: Vec<EntitySpec>,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub metrics: MigrationMetrics,
    /// Progress of the phase currently running, folded into `metrics` when it finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<PhaseProgress>,
    /// Lease holder of the run allowed to write progress. A run whose holder
    /// no longer matches has been superseded and must stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_holder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<MigrationPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
    #[serde(default)]
    pub load_stats: Vec<TableLoadStats>,
    #[serde(default)]
    pub verification: Vec<VerificationResult>,
    #[serde(default)]
    pub rollback_points: Vec<RollbackPoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default)]
    pub rollback_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_error: Option<String>,
    /// Loads rollback could not undo.
    #[serde(default)]
    pub rollback_warnings: Vec<String>,
}

impl Migration {
    /// Build a fresh INITIALIZED migration at the PLANNING phase.
    pub fn new(request: &MigrationRequest, project_code: String, defaults: &MigrationDefaults) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: request.name.clone(),
            description: request.description.clone(),
            project_code,
            source_system: request.source_system.clone(),
            target_system: request.target_system.clone(),
            status: MigrationStatus::Initialized,
            current_phase: MigrationPhase::Planning,
            batch_size: request.resolved_batch_size(defaults),
            parallelism: request.resolved_parallelism(defaults),
            retry_attempts: request.resolved_retry_attempts(defaults),
            rollback_enabled: request.rollback_enabled,
            strict_validation: request.strict_validation,
            fail_fast: request.fail_fast,
            load_strategy: request.load_strategy,
            entities: request.entities.clone(),
            validation_rules: request.validation_rules.clone(),
            created_at: now,
            started_at: None,
            paused_at: None,
            resumed_at: None,
            cancelled_at: None,
            completed_at: None,
            rolled_back_at: None,
            updated_at: now,
            metrics: MigrationMetrics::default(),
            in_flight: None,
            execution_holder: None,
            plan: None,
            validation: None,
            load_stats: Vec::new(),
            verification: Vec::new(),
            rollback_points: Vec::new(),
            error_message: None,
            error_detail: None,
            rollback_failed: false,
            rollback_error: None,
            rollback_warnings: Vec::new(),
        }
    }

    /// Record a failure. The detail is truncated to [`MAX_ERROR_DETAIL_CHARS`].
    pub fn record_failure(&mut self, err: &MigrateError) {
        self.status = MigrationStatus::Failed;
        self.error_message = Some(err.to_string());
        self.error_detail = Some(truncate_chars(&err.format_detailed(), MAX_ERROR_DETAIL_CHARS));
        self.in_flight = None;
    }

    /// True when any phase left something rollback can act on.
    pub fn has_work_to_undo(&self) -> bool {
        !self.rollback_points.is_empty()
    }

    /// Move to the next phase, folding the finished phase's progress away.
    pub fn advance_phase(&mut self, next: MigrationPhase) {
        if next > self.current_phase {
            self.current_phase = next;
        }
        self.in_flight = None;
    }
}

/// Generate a project code `MIG-<yyyymmdd>-<5 digits>`.
pub fn generate_project_code<R: Rng + ?Sized>(date: NaiveDate, rng: &mut R) -> String {
    format!("MIG-{}-{:05}", date.format("%Y%m%d"), rng.gen_range(0..100_000u32))
}

/// Truncate on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            MigrationStatus::Initialized,
            MigrationStatus::InProgress,
            MigrationStatus::Paused,
            MigrationStatus::Completed,
            MigrationStatus::Failed,
            MigrationStatus::Cancelled,
            MigrationStatus::RolledBack,
        ] {
            assert_eq!(MigrationStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(MigrationStatus::parse("running").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(MigrationStatus::Completed.is_terminal());
        assert!(MigrationStatus::Cancelled.is_terminal());
        assert!(MigrationStatus::RolledBack.is_terminal());
        assert!(!MigrationStatus::Failed.is_terminal());
        assert!(!MigrationStatus::Paused.is_terminal());
        for s in MigrationStatus::NON_TERMINAL {
            assert!(!s.is_terminal());
        }
    }

    #[test]
    fn test_status_serializes_screaming_snake() {
        let json = serde_json::to_string(&MigrationStatus::RolledBack).unwrap();
        assert_eq!(json, "\"ROLLED_BACK\"");
    }

    #[test]
    fn test_phase_order() {
        assert_eq!(MigrationPhase::Planning.next(), Some(MigrationPhase::Extraction));
        assert_eq!(MigrationPhase::Verification.next(), Some(MigrationPhase::Cleanup));
        assert_eq!(MigrationPhase::Cleanup.next(), None);
        let remaining: Vec<_> = MigrationPhase::Loading.remaining().collect();
        assert_eq!(
            remaining,
            vec![
                MigrationPhase::Loading,
                MigrationPhase::Verification,
                MigrationPhase::Cleanup
            ]
        );
    }

    #[test]
    fn test_advance_never_regresses() {
        let mut m = fixtures::migration();
        m.advance_phase(MigrationPhase::Loading);
        m.advance_phase(MigrationPhase::Extraction);
        assert_eq!(m.current_phase, MigrationPhase::Loading);
    }

    #[test]
    fn test_project_code_format() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let date = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        let code = generate_project_code(date, &mut rng);
        assert!(code.starts_with("MIG-20260309-"));
        assert_eq!(code.len(), "MIG-20260309-00000".len());
        assert!(code[13..].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_new_migration_is_initialized_planning() {
        let m = fixtures::migration();
        assert_eq!(m.status, MigrationStatus::Initialized);
        assert_eq!(m.current_phase, MigrationPhase::Planning);
        assert_eq!(m.batch_size, 2);
        assert!(m.started_at.is_none());
    }

    #[test]
    fn test_record_failure_truncates_detail() {
        let mut m = fixtures::migration();
        let err = MigrateError::State("x".repeat(10_000));
        m.record_failure(&err);
        assert_eq!(m.status, MigrationStatus::Failed);
        assert!(m.error_message.is_some());
        assert_eq!(
            m.error_detail.as_ref().unwrap().chars().count(),
            MAX_ERROR_DETAIL_CHARS
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn test_progress_clamps_processed_to_total() {
        let mut m = fixtures::migration();
        m.metrics.total_records = 100;
        m.metrics.processed_records = 80;
        m.in_flight = Some(PhaseProgress {
            phase: MigrationPhase::Loading,
            processed_records: 50,
            updated_at: None,
        });
        let progress = Progress::from_migration(&m, Utc::now());
        assert_eq!(progress.processed_records, 100);
        assert_eq!(progress.percentage, 100.0);
    }
}
