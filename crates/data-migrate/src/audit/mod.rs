//! Audit events and completion notifications.
//!
//! Both are best effort: a sink or notifier that fails is logged and
//! otherwise ignored, so recording never fails the migration itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{MigrateError, Result};
use crate::migration::{Migration, MigrationStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditSeverity {
    Info,
    Warn,
    Error,
}

/// Lifecycle transitions worth an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    MigrationStarted,
    MigrationResumed,
    MigrationPaused,
    MigrationCompleted,
    MigrationCancelled,
    MigrationFailed,
    MigrationRolledBack,
    RollbackFailed,
}

impl AuditEventType {
    pub fn severity(&self) -> AuditSeverity {
        match self {
            AuditEventType::MigrationStarted
            | AuditEventType::MigrationResumed
            | AuditEventType::MigrationPaused
            | AuditEventType::MigrationCompleted => AuditSeverity::Info,
            AuditEventType::MigrationCancelled | AuditEventType::MigrationRolledBack => {
                AuditSeverity::Warn
            }
            AuditEventType::MigrationFailed | AuditEventType::RollbackFailed => {
                AuditSeverity::Error
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::MigrationStarted => "MIGRATION_STARTED",
            AuditEventType::MigrationResumed => "MIGRATION_RESUMED",
            AuditEventType::MigrationPaused => "MIGRATION_PAUSED",
            AuditEventType::MigrationCompleted => "MIGRATION_COMPLETED",
            AuditEventType::MigrationCancelled => "MIGRATION_CANCELLED",
            AuditEventType::MigrationFailed => "MIGRATION_FAILED",
            AuditEventType::MigrationRolledBack => "MIGRATION_ROLLED_BACK",
            AuditEventType::RollbackFailed => "ROLLBACK_FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub entity_id: String,
    pub description: String,
    pub severity: AuditSeverity,
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Event about `migration` with its identity and phase as metadata.
    pub fn for_migration(
        event_type: AuditEventType,
        migration: &Migration,
        description: impl Into<String>,
    ) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("project_code".to_string(), migration.project_code.clone());
        metadata.insert("name".to_string(), migration.name.clone());
        metadata.insert("status".to_string(), migration.status.to_string());
        metadata.insert("phase".to_string(), migration.current_phase.to_string());
        Self {
            event_type,
            entity_id: migration.id.to_string(),
            description: description.into(),
            severity: event_type.severity(),
            metadata,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// Writes each event as a structured tracing event under the `audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        let metadata = serde_json::to_string(&event.metadata)?;
        match event.severity {
            AuditSeverity::Info => info!(
                target: "audit",
                event_type = event.event_type.as_str(),
                entity_id = %event.entity_id,
                metadata = %metadata,
                "{}", event.description
            ),
            AuditSeverity::Warn => warn!(
                target: "audit",
                event_type = event.event_type.as_str(),
                entity_id = %event.entity_id,
                metadata = %metadata,
                "{}", event.description
            ),
            AuditSeverity::Error => error!(
                target: "audit",
                event_type = event.event_type.as_str(),
                entity_id = %event.entity_id,
                metadata = %metadata,
                "{}", event.description
            ),
        }
        Ok(())
    }
}

/// Keeps events in memory, for embedders that ship them elsewhere and for tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn event_types(&self) -> Vec<AuditEventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| MigrateError::State("audit buffer poisoned".into()))?
            .push(event.clone());
        Ok(())
    }
}

/// Record an event, logging and swallowing any failure.
pub async fn emit(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.record(&event).await {
        warn!(
            "Failed to record audit event {} for {}: {}",
            event.event_type.as_str(),
            event.entity_id,
            e
        );
    }
}

/// Sent once a migration stops running, whatever the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionNotice {
    pub job_id: Uuid,
    pub project_code: String,
    pub status: MigrationStatus,
    pub data_source: String,
    pub records_extracted: u64,
    pub records_loaded: u64,
    pub records_failed: u64,
}

impl CompletionNotice {
    pub fn from_migration(migration: &Migration) -> Self {
        Self {
            job_id: migration.id,
            project_code: migration.project_code.clone(),
            status: migration.status,
            data_source: migration.source_system.clone(),
            records_extracted: migration.metrics.extracted_records,
            records_loaded: migration.metrics.loaded_records,
            records_failed: migration.metrics.failed_records,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &CompletionNotice) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notice: &CompletionNotice) -> Result<()> {
        info!(
            target: "notification",
            job_id = %notice.job_id,
            status = notice.status.as_str(),
            data_source = %notice.data_source,
            "Migration {} finished {}: {} extracted, {} loaded, {} failed",
            notice.project_code,
            notice.status,
            notice.records_extracted,
            notice.records_loaded,
            notice.records_failed
        );
        Ok(())
    }
}

/// Forwards notices to a bounded channel; a full or closed channel drops them.
#[derive(Debug)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<CompletionNotice>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<CompletionNotice>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, notice: &CompletionNotice) -> Result<()> {
        self.tx
            .try_send(notice.clone())
            .map_err(|e| MigrateError::State(format!("notification dropped: {}", e)))
    }
}

/// Deliver a notice, logging and swallowing any failure.
pub async fn notify(notifier: &dyn Notifier, notice: CompletionNotice) {
    if let Err(e) = notifier.notify(&notice).await {
        warn!("Completion notification for {} not delivered: {}", notice.job_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::fixtures;

    #[test]
    fn test_severity_mapping() {
        use AuditEventType::*;
        for t in [MigrationStarted, MigrationCompleted, MigrationPaused, MigrationResumed] {
            assert_eq!(t.severity(), AuditSeverity::Info);
        }
        for t in [MigrationCancelled, MigrationRolledBack] {
            assert_eq!(t.severity(), AuditSeverity::Warn);
        }
        for t in [MigrationFailed, RollbackFailed] {
            assert_eq!(t.severity(), AuditSeverity::Error);
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn record(&self, _event: &AuditEvent) -> Result<()> {
            Err(MigrateError::State("sink down".into()))
        }
    }

    #[tokio::test]
    async fn test_emit_swallows_sink_failures() {
        let m = fixtures::migration();
        emit(
            &BrokenSink,
            AuditEvent::for_migration(AuditEventType::MigrationStarted, &m, "started"),
        )
        .await;

        let sink = MemoryAuditSink::new();
        emit(
            &sink,
            AuditEvent::for_migration(AuditEventType::MigrationFailed, &m, "boom")
                .with_metadata("error", "boom"),
        )
        .await;
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, AuditSeverity::Error);
        assert_eq!(events[0].metadata["project_code"], m.project_code);
        assert_eq!(events[0].metadata["error"], "boom");
    }

    #[tokio::test]
    async fn test_channel_notifier_is_best_effort() {
        let m = fixtures::migration();
        let (notifier, mut rx) = ChannelNotifier::new(1);
        notify(&notifier, CompletionNotice::from_migration(&m)).await;
        // channel full: dropped without error
        notify(&notifier, CompletionNotice::from_migration(&m)).await;
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.job_id, m.id);
        assert_eq!(notice.data_source, "erp");
        assert!(rx.try_recv().is_err());
    }
}
