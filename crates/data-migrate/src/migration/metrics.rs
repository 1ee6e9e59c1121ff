//! Migration counters and progress reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Migration, MigrationPhase, MigrationStatus};

/// Counters accumulated across phases. Updates are additive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationMetrics {
    pub total_records: u64,
    pub processed_records: u64,
    pub successful_records: u64,
    pub failed_records: u64,
    pub extracted_records: u64,
    pub transformed_records: u64,
    pub loaded_records: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_score: Option<f64>,
    pub validation_errors: u64,
    pub bytes_processed: u64,
    pub duration_ms: u64,
}

impl MigrationMetrics {
    /// Fold a phase's delta into the running totals. Counters only grow; the
    /// latest validation score wins.
    pub fn absorb(&mut self, delta: &MigrationMetrics) {
        self.total_records += delta.total_records;
        self.processed_records += delta.processed_records;
        self.successful_records += delta.successful_records;
        self.failed_records += delta.failed_records;
        self.extracted_records += delta.extracted_records;
        self.transformed_records += delta.transformed_records;
        self.loaded_records += delta.loaded_records;
        self.validation_errors += delta.validation_errors;
        self.bytes_processed += delta.bytes_processed;
        self.duration_ms += delta.duration_ms;
        if delta.validation_score.is_some() {
            self.validation_score = delta.validation_score;
        }
    }
}

/// Rows handled so far by the phase currently running. Discarded when that
/// phase restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub phase: MigrationPhase,
    pub processed_records: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Percentage of `processed` over `total`, clamped to [0, 100]; 0 when total is 0.
pub fn progress_percentage(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (processed as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// Remaining seconds from current throughput; 0 when the rate is not positive.
pub fn estimate_remaining_seconds(processed: u64, total: u64, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds <= 0.0 {
        return 0.0;
    }
    let rate = processed as f64 / elapsed_seconds;
    if rate <= 0.0 {
        return 0.0;
    }
    total.saturating_sub(processed) as f64 / rate
}

/// Point-in-time progress report built from persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub id: Uuid,
    pub project_code: String,
    pub status: MigrationStatus,
    pub current_phase: MigrationPhase,
    pub total_records: u64,
    pub processed_records: u64,
    pub percentage: f64,
    pub elapsed_seconds: f64,
    pub records_per_second: f64,
    pub estimated_remaining_seconds: f64,
}

impl Progress {
    pub fn from_migration(migration: &Migration, now: DateTime<Utc>) -> Self {
        let total = migration.metrics.total_records;
        let in_flight = migration
            .in_flight
            .as_ref()
            .map(|p| p.processed_records)
            .unwrap_or(0);
        // Never report more processed than total.
        let processed = (migration.metrics.processed_records + in_flight).min(total);

        let end = migration
            .completed_at
            .or(migration.cancelled_at)
            .unwrap_or(now);
        let elapsed_seconds = migration
            .started_at
            .map(|s| (end - s).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        let records_per_second = if elapsed_seconds > 0.0 {
            processed as f64 / elapsed_seconds
        } else {
            0.0
        };

        Self {
            id: migration.id,
            project_code: migration.project_code.clone(),
            status: migration.status,
            current_phase: migration.current_phase,
            total_records: total,
            processed_records: processed,
            percentage: progress_percentage(processed, total),
            elapsed_seconds,
            records_per_second,
            estimated_remaining_seconds: estimate_remaining_seconds(
                processed,
                total,
                elapsed_seconds,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_half_way() {
        assert_eq!(progress_percentage(5_000, 10_000), 50.0);
    }

    #[test]
    fn test_percentage_zero_total() {
        assert_eq!(progress_percentage(10, 0), 0.0);
    }

    #[test]
    fn test_percentage_clamped() {
        assert_eq!(progress_percentage(15_000, 10_000), 100.0);
    }

    #[test]
    fn test_eta_uses_processed_over_elapsed() {
        // 5000 records in 50s = 100 rec/s; 5000 remaining => 50s
        let eta = estimate_remaining_seconds(5_000, 10_000, 50.0);
        assert!((eta - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_eta_zero_when_no_throughput() {
        assert_eq!(estimate_remaining_seconds(0, 10_000, 30.0), 0.0);
        assert_eq!(estimate_remaining_seconds(100, 10_000, 0.0), 0.0);
    }

    #[test]
    fn test_absorb_is_additive() {
        let mut total = MigrationMetrics::default();
        total.absorb(&MigrationMetrics {
            extracted_records: 10,
            bytes_processed: 100,
            ..Default::default()
        });
        total.absorb(&MigrationMetrics {
            extracted_records: 5,
            failed_records: 1,
            validation_score: Some(90.0),
            ..Default::default()
        });
        assert_eq!(total.extracted_records, 15);
        assert_eq!(total.failed_records, 1);
        assert_eq!(total.bytes_processed, 100);
        assert_eq!(total.validation_score, Some(90.0));
    }
}
