//! Migration lifecycle: initiate, execute, pause, resume and cancel.
//!
//! The [`Orchestrator`] owns the shared services (state store, execution
//! lock, staging area, pools) and runs each migration's phases on a bounded
//! task pool. Every status change goes through a compare-and-set on the
//! store, so a pause or cancel issued by another process is observed at the
//! next phase or batch boundary.

mod executor;
mod rollback;
mod runner;

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{self, AuditEvent, AuditEventType, AuditSink, TracingAuditSink};
use crate::audit::{Notifier, TracingNotifier};
use crate::config::{BackendKind, Config};
use crate::core::{Control, ControlSignal};
use crate::error::{MigrateError, Result};
use crate::extract::{Connector, ConnectorFactory};
use crate::load::{self, TargetWriter};
use crate::lock::{DistributedLock, ExecutionLease, InMemoryLeaseLock, PgLeaseLock};
use crate::migration::{
    generate_project_code, Migration, MigrationRequest, MigrationStatus, Progress,
};
use crate::pool::{PoolHealth, PoolRegistry, PoolRole};
use crate::staging::{FileStaging, MemoryStaging, StagingArea};
use crate::state::{FileStore, MemoryStore, MigrationStore, PgStore, Transition};
use crate::transform::{TransformRegistry, Transformer};
use crate::validation::{BusinessPredicate, BusinessRegistry};

use executor::{Slot, TaskPool};

/// Attempts at drawing an unused project code before giving up.
const PROJECT_CODE_ATTEMPTS: usize = 10;

/// Handle to a migration running in the background. Resolves to the
/// migration as persisted when the run stopped.
pub type MigrationHandle = JoinHandle<Result<Migration>>;

/// Connectivity of one configured data source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub data_source: String,
    pub kind: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartMode {
    Fresh,
    Resume,
}

impl StartMode {
    fn expected(&self) -> &'static [MigrationStatus] {
        match self {
            StartMode::Fresh => &[MigrationStatus::Initialized],
            // A migration left IN_PROGRESS by a run whose lease lapsed is
            // adopted once the lease is acquired.
            StartMode::Resume => &[MigrationStatus::Paused, MigrationStatus::InProgress],
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            StartMode::Fresh => "execute",
            StartMode::Resume => "resume",
        }
    }
}

/// Services shared by the public handle and every running migration.
pub(crate) struct Shared {
    config: Config,
    store: Arc<dyn MigrationStore>,
    lock: Arc<dyn DistributedLock>,
    staging: Arc<dyn StagingArea>,
    pools: Arc<PoolRegistry>,
    connectors: ConnectorFactory,
    writers: HashMap<String, Arc<dyn TargetWriter>>,
    transforms: TransformRegistry,
    business: BusinessRegistry,
    reference_sets: HashMap<String, HashSet<String>>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
    tasks: TaskPool,
    /// Control channel of each run in this process, with its lease holder.
    controls: Mutex<HashMap<Uuid, (String, watch::Sender<Control>)>>,
}

impl Shared {
    async fn load(&self, id: Uuid) -> Result<Migration> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or(MigrateError::NotFound(id))
    }

    /// Writer for a target data source: a registered override, else the pool's.
    async fn writer(&self, data_source: &str) -> Result<Arc<dyn TargetWriter>> {
        if let Some(writer) = self.writers.get(data_source) {
            return Ok(writer.clone());
        }
        load::writer_for(&self.pools, data_source).await
    }

    async fn acquire_lease(&self, id: Uuid, timeout: Duration) -> Result<ExecutionLease> {
        ExecutionLease::acquire(self.lock.clone(), id, self.config.lock.get_lease(), timeout).await
    }

    fn register_control(&self, id: Uuid, holder: &str) -> ControlSignal {
        let (tx, signal) = ControlSignal::channel();
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, (holder.to_string(), tx));
        signal
    }

    /// Drop the control channel of the run holding `holder`. A newer run's
    /// channel for the same migration is left alone.
    fn remove_control(&self, id: Uuid, holder: &str) {
        let mut controls = self.controls.lock().unwrap_or_else(|e| e.into_inner());
        if controls.get(&id).is_some_and(|(owner, _)| owner == holder) {
            controls.remove(&id);
        }
    }

    /// Tell a run in this process to stop at its next checkpoint.
    fn signal(&self, id: Uuid, control: Control) {
        if let Some((_, tx)) = self
            .controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
        {
            let _ = tx.send(control);
        }
    }

    fn running_ids(&self) -> Vec<Uuid> {
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    async fn audit(&self, event_type: AuditEventType, migration: &Migration, description: String) {
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::for_migration(event_type, migration, description),
        )
        .await;
    }
}

/// Builds an [`Orchestrator`]. Services not supplied are created from the
/// configuration.
pub struct OrchestratorBuilder {
    config: Config,
    store: Option<Arc<dyn MigrationStore>>,
    lock: Option<Arc<dyn DistributedLock>>,
    staging: Option<Arc<dyn StagingArea>>,
    pools: Option<Arc<PoolRegistry>>,
    writers: HashMap<String, Arc<dyn TargetWriter>>,
    transforms: TransformRegistry,
    business: BusinessRegistry,
    reference_sets: HashMap<String, HashSet<String>>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
}

impl OrchestratorBuilder {
    pub fn store(mut self, store: Arc<dyn MigrationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn staging(mut self, staging: Arc<dyn StagingArea>) -> Self {
        self.staging = Some(staging);
        self
    }

    pub fn pools(mut self, pools: Arc<PoolRegistry>) -> Self {
        self.pools = Some(pools);
        self
    }

    /// Load into `data_source` through `writer` instead of its pool.
    pub fn target_writer(mut self, data_source: impl Into<String>, writer: Arc<dyn TargetWriter>) -> Self {
        self.writers.insert(data_source.into(), writer);
        self
    }

    pub fn transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transforms.register(transformer);
        self
    }

    pub fn business_predicate(mut self, predicate: Arc<dyn BusinessPredicate>) -> Self {
        self.business.register(predicate);
        self
    }

    /// Known values for REFERENTIAL rules naming `name`.
    pub fn reference_set(mut self, name: impl Into<String>, values: HashSet<String>) -> Self {
        self.reference_sets.insert(name.into(), values);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub async fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        let pools = match self.pools {
            Some(pools) => pools,
            None => Arc::new(PoolRegistry::from_config(&config)),
        };

        let store: Arc<dyn MigrationStore> = match self.store {
            Some(store) => store,
            None => match config.state.backend {
                BackendKind::Memory => Arc::new(MemoryStore::new()),
                BackendKind::File => {
                    let path = config.state.path.clone().ok_or_else(|| {
                        MigrateError::Config("state.path is required for the file backend".into())
                    })?;
                    Arc::new(FileStore::new(path, config.state_key()))
                }
                BackendKind::Postgres => {
                    let id = backend_source(&config.state.data_source, "state")?;
                    Arc::new(PgStore::new(pools.postgres(id, PoolRole::Load).await?))
                }
            },
        };
        store.init_schema().await?;

        let lock: Arc<dyn DistributedLock> = match self.lock {
            Some(lock) => lock,
            None => match config.lock.backend {
                BackendKind::Postgres => {
                    let id = backend_source(&config.lock.data_source, "lock")?;
                    let lock = PgLeaseLock::new(pools.postgres(id, PoolRole::Load).await?);
                    lock.init_schema().await?;
                    Arc::new(lock)
                }
                _ => Arc::new(InMemoryLeaseLock::new()),
            },
        };

        let staging: Arc<dyn StagingArea> = match self.staging {
            Some(staging) => staging,
            None => match config.staging.backend {
                BackendKind::File => {
                    let path = config.staging.path.clone().ok_or_else(|| {
                        MigrateError::Config("staging.path is required for the file backend".into())
                    })?;
                    Arc::new(FileStaging::new(path))
                }
                _ => Arc::new(MemoryStaging::new()),
            },
        };

        info!(
            "Orchestrator ready: {} state, {} lock, {} data sources",
            store.backend_type(),
            lock.backend_type(),
            config.data_sources.len()
        );

        let tasks = TaskPool::new(&config.executor);
        Ok(Orchestrator {
            inner: Arc::new(Shared {
                connectors: ConnectorFactory::new(pools.clone()),
                config,
                store,
                lock,
                staging,
                pools,
                writers: self.writers,
                transforms: self.transforms,
                business: self.business,
                reference_sets: self.reference_sets,
                audit: self.audit,
                notifier: self.notifier,
                tasks,
                controls: Mutex::new(HashMap::new()),
            }),
        })
    }
}

fn backend_source<'a>(data_source: &'a Option<String>, section: &str) -> Result<&'a str> {
    data_source.as_deref().ok_or_else(|| {
        MigrateError::Config(format!(
            "{}.data_source is required for the postgres backend",
            section
        ))
    })
}

/// Entry point for running migrations. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Shared>,
}

impl Orchestrator {
    pub fn builder(config: Config) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            store: None,
            lock: None,
            staging: None,
            pools: None,
            writers: HashMap::new(),
            transforms: TransformRegistry::new(),
            business: BusinessRegistry::new(),
            reference_sets: HashMap::new(),
            audit: Arc::new(TracingAuditSink),
            notifier: Arc::new(TracingNotifier),
        }
    }

    /// Orchestrator with every service taken from the configuration.
    pub async fn from_config(config: Config) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn MigrationStore> {
        self.inner.store.clone()
    }

    /// Validate and persist a new migration, then start it.
    ///
    /// Returns the INITIALIZED migration and a handle to its run.
    pub async fn initiate(&self, request: MigrationRequest) -> Result<(Migration, MigrationHandle)> {
        let inner = &self.inner;
        request.validate()?;
        for id in [&request.source_system, &request.target_system] {
            inner.pools.data_source(id).map_err(|_| {
                MigrateError::InvalidRequest(format!("unknown data source '{}'", id))
            })?;
        }
        for entity in &request.entities {
            for name in &entity.transformations {
                if !inner.transforms.contains(name) {
                    return Err(MigrateError::InvalidRequest(format!(
                        "entity '{}' uses unknown transformer '{}'",
                        entity.name, name
                    )));
                }
            }
        }

        let code = self.allocate_project_code().await?;
        // Reserved before the record is written: a full queue stores nothing.
        let slot = inner.tasks.reserve()?;
        let migration = Migration::new(&request, code, &inner.config.migration);
        inner.store.save(&migration).await?;
        info!(
            "Initiated migration {} ({}): {} -> {}, {} entities",
            migration.project_code,
            migration.id,
            migration.source_system,
            migration.target_system,
            migration.entities.len()
        );

        match self.start(migration.id, StartMode::Fresh, Some(slot)).await {
            Ok(handle) => Ok((migration, handle)),
            Err(e) => {
                if let Err(cleanup) = inner.store.delete(migration.id).await {
                    warn!(
                        "Could not remove unstarted migration {}: {}",
                        migration.id, cleanup
                    );
                }
                Err(e)
            }
        }
    }

    async fn allocate_project_code(&self) -> Result<String> {
        for _ in 0..PROJECT_CODE_ATTEMPTS {
            let code = generate_project_code(Utc::now().date_naive(), &mut rand::thread_rng());
            if !self.inner.store.project_code_exists(&code).await? {
                return Ok(code);
            }
            debug!("Project code {} taken, drawing another", code);
        }
        Err(MigrateError::State(format!(
            "no unused project code after {} attempts",
            PROJECT_CODE_ATTEMPTS
        )))
    }

    /// Start an INITIALIZED migration.
    pub async fn execute(&self, id: Uuid) -> Result<MigrationHandle> {
        self.start(id, StartMode::Fresh, None).await
    }

    /// Continue a migration from its current phase.
    ///
    /// Accepts a PAUSED migration, or an IN_PROGRESS one whose run is gone
    /// (crashed or lost its lease). A run that is still alive holds the lease,
    /// so resuming it fails with `AlreadyExecuting`.
    pub async fn resume(&self, id: Uuid) -> Result<MigrationHandle> {
        self.start(id, StartMode::Resume, None).await
    }

    async fn start(&self, id: Uuid, mode: StartMode, reserved: Option<Slot>) -> Result<MigrationHandle> {
        let inner = &self.inner;
        let current = inner.load(id).await?;
        if current.status.is_terminal() {
            return Err(MigrateError::invalid_state(id, current.status, mode.operation()));
        }

        // A migration running elsewhere holds the lease, so concurrent starts
        // fail here with AlreadyExecuting; the status is settled by the CAS below.
        let lease = inner
            .acquire_lease(id, inner.config.lock.get_acquire_timeout())
            .await?;
        let slot = match reserved.map_or_else(|| inner.tasks.reserve(), Ok) {
            Ok(slot) => slot,
            Err(e) => {
                lease.release().await;
                return Err(e);
            }
        };

        let now = Utc::now();
        let holder = lease.holder().to_string();
        let transition = inner
            .store
            .update_if_status(id, mode.expected(), &move |m: &mut Migration| {
                m.status = MigrationStatus::InProgress;
                m.execution_holder = Some(holder.clone());
                m.in_flight = None;
                match mode {
                    StartMode::Fresh => {
                        if m.started_at.is_none() {
                            m.started_at = Some(now);
                        }
                    }
                    StartMode::Resume => m.resumed_at = Some(now),
                }
            })
            .await;
        let migration = match transition {
            Ok(Transition::Applied(m)) => *m,
            Ok(Transition::Rejected(status)) => {
                lease.release().await;
                return Err(MigrateError::invalid_state(id, status, mode.operation()));
            }
            Err(e) => {
                lease.release().await;
                return Err(e);
            }
        };

        let (event, verb) = match mode {
            StartMode::Fresh => (AuditEventType::MigrationStarted, "started"),
            StartMode::Resume => (AuditEventType::MigrationResumed, "resumed"),
        };
        info!(
            "Migration {} {} at {} (lease holder {})",
            migration.project_code,
            verb,
            migration.current_phase,
            lease.holder()
        );
        inner
            .audit(
                event,
                &migration,
                format!("Migration {} {}", migration.project_code, verb),
            )
            .await;

        let control = inner.register_control(id, lease.holder());
        let runner = inner.clone();
        Ok(inner
            .tasks
            .spawn(slot, async move { runner.run(migration, lease, control).await }))
    }

    /// Request a soft pause. The run stops at its next checkpoint.
    pub async fn pause(&self, id: Uuid) -> Result<Migration> {
        let inner = &self.inner;
        let now = Utc::now();
        let transition = inner
            .store
            .update_if_status(id, &[MigrationStatus::InProgress], &move |m: &mut Migration| {
                m.status = MigrationStatus::Paused;
                m.paused_at = Some(now);
            })
            .await?;
        match transition {
            Transition::Applied(m) => {
                inner.signal(id, Control::Pause);
                info!("Migration {} paused at {}", m.project_code, m.current_phase);
                inner
                    .audit(
                        AuditEventType::MigrationPaused,
                        &m,
                        format!("Migration {} paused", m.project_code),
                    )
                    .await;
                Ok(*m)
            }
            Transition::Rejected(status) => Err(MigrateError::invalid_state(id, status, "pause")),
        }
    }

    /// Cancel a migration that has not reached a terminal status.
    ///
    /// When rollback is enabled and no run holds the lease, rollback happens
    /// here; otherwise the run performs it when it stops.
    pub async fn cancel(&self, id: Uuid) -> Result<Migration> {
        let inner = &self.inner;
        let now = Utc::now();
        let transition = inner
            .store
            .update_if_status(id, &MigrationStatus::NON_TERMINAL, &move |m: &mut Migration| {
                m.status = MigrationStatus::Cancelled;
                m.cancelled_at = Some(now);
                m.in_flight = None;
            })
            .await?;
        let migration = match transition {
            Transition::Applied(m) => *m,
            Transition::Rejected(status) => {
                return Err(MigrateError::invalid_state(id, status, "cancel"))
            }
        };

        inner.signal(id, Control::Cancel);
        warn!("Migration {} cancelled", migration.project_code);
        inner
            .audit(
                AuditEventType::MigrationCancelled,
                &migration,
                format!("Migration {} cancelled", migration.project_code),
            )
            .await;

        if !(migration.rollback_enabled && migration.has_work_to_undo()) {
            return Ok(migration);
        }
        match inner.acquire_lease(id, Duration::ZERO).await {
            Ok(lease) => {
                let migration = inner.rollback(migration).await;
                lease.release().await;
                Ok(migration)
            }
            Err(e) if e.is_lock_contention() => {
                debug!("Migration {} is running; its runner will roll back", id);
                Ok(migration)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Migration> {
        self.inner.load(id).await
    }

    /// Progress computed from persisted state.
    pub async fn progress(&self, id: Uuid) -> Result<Progress> {
        let migration = self.inner.load(id).await?;
        Ok(Progress::from_migration(&migration, Utc::now()))
    }

    /// Check connectivity to every configured data source.
    pub async fn health_check(&self) -> Vec<SourceHealth> {
        let mut report = Vec::with_capacity(self.inner.config.data_sources.len());
        for source in &self.inner.config.data_sources {
            let outcome = match self.inner.writers.get(&source.id) {
                Some(writer) => writer.test_connection().await,
                None => match self.inner.connectors.for_source(&source.id) {
                    Ok(connector) => {
                        let outcome = connector.test_connection().await;
                        connector.close().await;
                        outcome
                    }
                    Err(e) => Err(e),
                },
            };
            report.push(SourceHealth {
                data_source: source.id.clone(),
                kind: source.kind.as_str(),
                healthy: outcome.is_ok(),
                error: outcome.err().map(|e| e.to_string()),
            });
        }
        report
    }

    pub async fn pool_health(&self) -> Vec<PoolHealth> {
        self.inner.pools.health().await
    }

    /// Migrations running or waiting for a slot in this process.
    pub fn active(&self) -> (usize, usize) {
        (self.inner.tasks.running(), self.inner.tasks.queued())
    }

    /// Stop accepting work and wait for running migrations.
    ///
    /// Runs still going after the termination timeout are paused and given
    /// the same time again to reach a checkpoint. Pools close last. Returns
    /// false if anything was still running at the end.
    pub async fn shutdown(&self) -> bool {
        let inner = &self.inner;
        let timeout = inner.config.executor.get_await_termination();
        info!("Shutting down orchestrator (waiting up to {:?})", timeout);

        let mut clean = inner.tasks.shutdown(timeout).await;
        if !clean {
            for id in inner.running_ids() {
                match self.pause(id).await {
                    Ok(m) => info!("Paused {} for shutdown", m.project_code),
                    Err(e) => warn!("Could not pause {} for shutdown: {}", id, e),
                }
            }
            clean = inner.tasks.shutdown(timeout).await;
        }
        inner.pools.shutdown().await;
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{ChannelNotifier, CompletionNotice, MemoryAuditSink};
    use crate::core::SqlValue;
    use crate::load::test_support::RecordingWriter;
    use crate::load::Dialect;
    use crate::migration::{fixtures, MigrationPhase, RollbackPoint};
    use crate::validation::{Constraint, FieldConstraint, RuleSpec, ValidationRule};
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::sync::{mpsc, Notify, Semaphore};
    use AuditEventType::*;

    const ROWS: &str = concat!(
        "{\"id\": 1, \"email\": \"a@x.io\"}\n",
        "{\"id\": 2, \"email\": \"b@x.io\"}\n",
        "{\"id\": 3, \"email\": null}\n",
        "{\"id\": 4, \"email\": \"d@x.io\"}\n",
        "{\"id\": 5, \"email\": \"e@x.io\"}\n",
    );

    /// Target that parks every write until the test lets it through.
    struct GatedWriter {
        inner: RecordingWriter,
        entered: Notify,
        gate: Semaphore,
    }

    impl GatedWriter {
        fn new() -> Self {
            Self {
                inner: RecordingWriter::new(),
                entered: Notify::new(),
                gate: Semaphore::new(0),
            }
        }

        fn release(&self, writes: usize) {
            self.gate.add_permits(writes);
        }

        async fn pass(&self) {
            self.entered.notify_one();
            self.gate.acquire().await.unwrap().forget();
        }
    }

    #[async_trait]
    impl TargetWriter for GatedWriter {
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }

        fn supports_bulk(&self) -> bool {
            false
        }

        async fn execute_batch(&self, sql: &str, rows: &[Vec<SqlValue>]) -> Result<u64> {
            self.pass().await;
            self.inner.execute_batch(sql, rows).await
        }

        async fn execute_row(&self, sql: &str, row: &[SqlValue]) -> Result<u64> {
            self.pass().await;
            self.inner.execute_row(sql, row).await
        }

        async fn copy_rows(&self, copy_sql: &str, rows: &[Vec<SqlValue>]) -> Result<u64> {
            self.pass().await;
            self.inner.copy_rows(copy_sql, rows).await
        }

        async fn query_count(&self, sql: &str) -> Result<i64> {
            self.inner.query_count(sql).await
        }

        async fn test_connection(&self) -> Result<()> {
            Ok(())
        }
    }

    struct Harness<W> {
        orchestrator: Orchestrator,
        writer: Arc<W>,
        audit: Arc<MemoryAuditSink>,
        store: Arc<MemoryStore>,
        staging: Arc<MemoryStaging>,
        notices: mpsc::Receiver<CompletionNotice>,
        dir: TempDir,
    }

    fn config(dir: &Path, extra: &str) -> Config {
        Config::from_yaml(&format!(
            "data_sources:
  - id: erp
    kind: file
    path: {}
  - id: warehouse
    kind: postgres
    host: localhost
    database: warehouse
    user: loader
migration:
  retry_backoff_ms: 1
{}",
            dir.display(),
            extra
        ))
        .unwrap()
    }

    async fn harness<W: TargetWriter + 'static>(writer: W, extra: &str) -> Harness<W> {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("customers.jsonl"), ROWS).unwrap();
        let writer = Arc::new(writer);
        let audit = Arc::new(MemoryAuditSink::new());
        let store = Arc::new(MemoryStore::new());
        let staging = Arc::new(MemoryStaging::new());
        let (notifier, notices) = ChannelNotifier::new(16);
        let orchestrator = Orchestrator::builder(config(dir.path(), extra))
            .store(store.clone())
            .staging(staging.clone())
            .target_writer("warehouse", writer.clone())
            .audit_sink(audit.clone())
            .notifier(Arc::new(notifier))
            .build()
            .await
            .unwrap();
        Harness {
            orchestrator,
            writer,
            audit,
            store,
            staging,
            notices,
            dir,
        }
    }

    fn email_required() -> ValidationRule {
        ValidationRule {
            name: "email-required".into(),
            entity: None,
            spec: RuleSpec::Constraints {
                constraints: vec![FieldConstraint {
                    field: "email".into(),
                    constraint: Constraint::NotNull,
                }],
            },
        }
    }

    /// Start a migration on a gated writer and pause it after its first batch.
    async fn paused_after_first_batch(h: &Harness<GatedWriter>) -> Migration {
        let (m, handle) = h.orchestrator.initiate(fixtures::request()).await.unwrap();
        h.writer.entered.notified().await;
        let paused = h.orchestrator.pause(m.id).await.unwrap();
        assert_eq!(paused.status, MigrationStatus::Paused);
        h.writer.release(1);
        let stopped = handle.await.unwrap().unwrap();
        assert_eq!(stopped.status, MigrationStatus::Paused);
        assert_eq!(stopped.current_phase, MigrationPhase::Loading);
        assert_eq!(h.writer.inner.count("customers"), 2);
        stopped
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let mut h = harness(RecordingWriter::new(), "").await;
        let (m, handle) = h.orchestrator.initiate(fixtures::request()).await.unwrap();
        assert_eq!(m.status, MigrationStatus::Initialized);
        assert!(m.project_code.starts_with("MIG-"));

        let done = handle.await.unwrap().unwrap();
        assert_eq!(done.status, MigrationStatus::Completed);
        assert_eq!(done.current_phase, MigrationPhase::Cleanup);
        assert!(done.started_at.is_some() && done.completed_at.is_some());
        assert_eq!(done.metrics.total_records, 5);
        assert_eq!(done.metrics.extracted_records, 5);
        assert_eq!(done.metrics.transformed_records, 5);
        assert_eq!(done.metrics.loaded_records, 5);
        assert_eq!(done.metrics.processed_records, 5);
        assert_eq!(done.metrics.failed_records, 0);
        assert_eq!(done.metrics.validation_score, Some(100.0));
        assert_eq!(h.writer.count("customers"), 5);
        assert!(done.verification.iter().all(|v| v.matched));
        assert!(done
            .rollback_points
            .iter()
            .all(|p| matches!(p, RollbackPoint::RowsLoaded { .. })));

        let extracted = format!("{}/extraction/customers", m.id);
        assert_eq!(h.staging.count(&extracted).await.unwrap(), 0);
        assert_eq!(h.audit.event_types(), vec![MigrationStarted, MigrationCompleted]);

        let progress = h.orchestrator.progress(m.id).await.unwrap();
        assert_eq!(progress.percentage, 100.0);
        let notice = h.notices.recv().await.unwrap();
        assert_eq!(notice.job_id, m.id);
        assert_eq!(notice.records_loaded, 5);
    }

    #[tokio::test]
    async fn test_strict_validation_failure_rolls_back() {
        let h = harness(RecordingWriter::new(), "").await;
        let mut request = fixtures::request();
        request.strict_validation = true;
        request.validation_rules = vec![email_required()];

        let (m, handle) = h.orchestrator.initiate(request).await.unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, MigrateError::ValidationFailed(_)));

        let stored = h.orchestrator.get(m.id).await.unwrap();
        assert_eq!(stored.status, MigrationStatus::RolledBack);
        assert!(stored.rolled_back_at.is_some());
        assert!(stored.rollback_points.is_empty());
        assert!(stored.error_message.unwrap().contains("Validation failed"));
        assert!(!stored.validation.unwrap().passed);
        assert_eq!(h.writer.count("customers"), 0);
        let transformed = format!("{}/transformation/customers", m.id);
        assert_eq!(h.staging.count(&transformed).await.unwrap(), 0);
        assert_eq!(
            h.audit.event_types(),
            vec![MigrationStarted, MigrationFailed, MigrationRolledBack]
        );
    }

    #[tokio::test]
    async fn test_lenient_validation_failure_continues() {
        let h = harness(RecordingWriter::new(), "").await;
        let mut request = fixtures::request();
        request.validation_rules = vec![email_required()];

        let (_, handle) = h.orchestrator.initiate(request).await.unwrap();
        let done = handle.await.unwrap().unwrap();
        assert_eq!(done.status, MigrationStatus::Completed);
        assert_eq!(done.metrics.validation_errors, 1);
        assert!(done.metrics.validation_score.unwrap() < 100.0);
        assert_eq!(h.writer.count("customers"), 5);
    }

    #[tokio::test]
    async fn test_load_failure_removes_loaded_rows() {
        let h = harness(RecordingWriter::new(), "").await;
        h.writer.poison("5");

        let (m, handle) = h.orchestrator.initiate(fixtures::request()).await.unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, MigrateError::Load { .. }));

        let stored = h.orchestrator.get(m.id).await.unwrap();
        assert_eq!(stored.status, MigrationStatus::RolledBack);
        assert_eq!(stored.current_phase, MigrationPhase::Loading);
        assert!(!stored.rollback_failed);
        assert_eq!(h.writer.count("customers"), 0);
        assert!(h
            .writer
            .statements
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.starts_with("DELETE")));
    }

    #[tokio::test]
    async fn test_extraction_failure_is_recorded() {
        let h = harness(RecordingWriter::new(), "").await;
        std::fs::remove_file(h.dir.path().join("customers.jsonl")).unwrap();

        let (m, handle) = h.orchestrator.initiate(fixtures::request()).await.unwrap();
        assert!(handle.await.unwrap().is_err());
        let stored = h.orchestrator.get(m.id).await.unwrap();
        assert_eq!(stored.status, MigrationStatus::RolledBack);
        assert_eq!(stored.current_phase, MigrationPhase::Extraction);
        assert!(stored.error_message.is_some());
        assert!(stored.error_detail.is_some());
    }

    #[tokio::test]
    async fn test_pause_and_resume_reloads_from_baseline() {
        let h = harness(GatedWriter::new(), "").await;
        let paused = paused_after_first_batch(&h).await;
        assert_eq!(paused.metrics.extracted_records, 5);

        h.writer.release(1_000);
        let done = h.orchestrator.resume(paused.id).await.unwrap().await.unwrap().unwrap();
        assert_eq!(done.status, MigrationStatus::Completed);
        assert!(done.resumed_at.is_some());
        assert_eq!(done.metrics.extracted_records, 5);
        assert_eq!(done.metrics.loaded_records, 5);
        assert_eq!(h.writer.inner.count("customers"), 5);
        assert_eq!(
            h.audit.event_types(),
            vec![
                MigrationStarted,
                MigrationPaused,
                MigrationResumed,
                MigrationCompleted
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_resumes_have_one_winner() {
        let h = harness(GatedWriter::new(), "").await;
        let paused = paused_after_first_batch(&h).await;

        // The winner parks on its first write until the gate opens again.
        let attempts =
            futures::future::join_all((0..5).map(|_| h.orchestrator.resume(paused.id))).await;
        let (won, lost): (Vec<_>, Vec<_>) = attempts.into_iter().partition(|r| r.is_ok());
        assert_eq!(won.len(), 1);
        assert_eq!(lost.len(), 4);
        assert!(lost
            .iter()
            .all(|r| matches!(r, Err(MigrateError::AlreadyExecuting(_)))));

        h.writer.release(1_000);
        let handle = won.into_iter().next().unwrap().unwrap();
        let done = handle.await.unwrap().unwrap();
        assert_eq!(done.status, MigrationStatus::Completed);
        assert_eq!(h.writer.inner.count("customers"), 5);
    }

    #[tokio::test]
    async fn test_cancel_paused_migration_rolls_back_inline() {
        let h = harness(GatedWriter::new(), "").await;
        let paused = paused_after_first_batch(&h).await;
        h.writer.release(1_000);

        let cancelled = h.orchestrator.cancel(paused.id).await.unwrap();
        assert_eq!(cancelled.status, MigrationStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());
        assert!(cancelled.rolled_back_at.is_some());
        assert!(cancelled.rollback_points.is_empty());
        assert_eq!(h.writer.inner.count("customers"), 0);
        assert_eq!(
            h.audit.event_types(),
            vec![
                MigrationStarted,
                MigrationPaused,
                MigrationCancelled,
                MigrationRolledBack
            ]
        );

        assert!(matches!(
            h.orchestrator.resume(paused.id).await,
            Err(MigrateError::InvalidState { .. })
        ));
        assert!(matches!(
            h.orchestrator.cancel(paused.id).await,
            Err(MigrateError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_migration_rolls_back_in_runner() {
        let h = harness(GatedWriter::new(), "").await;
        let (m, handle) = h.orchestrator.initiate(fixtures::request()).await.unwrap();
        h.writer.entered.notified().await;

        let cancelled = h.orchestrator.cancel(m.id).await.unwrap();
        assert_eq!(cancelled.status, MigrationStatus::Cancelled);
        assert!(cancelled.rolled_back_at.is_none());

        h.writer.release(1_000);
        let stopped = handle.await.unwrap().unwrap();
        assert_eq!(stopped.status, MigrationStatus::Cancelled);
        assert!(stopped.rolled_back_at.is_some());
        assert_eq!(h.writer.inner.count("customers"), 0);
    }

    #[tokio::test]
    async fn test_queue_full_rejects_new_migration() {
        let h = harness(
            GatedWriter::new(),
            "executor:\n  core_pool_size: 1\n  max_pool_size: 1\n  queue_capacity: 0\n",
        )
        .await;
        let (running, first) = h.orchestrator.initiate(fixtures::request()).await.unwrap();
        h.writer.entered.notified().await;
        assert_eq!(h.orchestrator.active(), (1, 0));

        let second = h.orchestrator.initiate(fixtures::request()).await;
        assert!(matches!(second, Err(MigrateError::QueueFull { capacity: 0 })));
        assert_eq!(h.store.ids().await, vec![running.id]);

        h.writer.release(1_000);
        assert_eq!(first.await.unwrap().unwrap().status, MigrationStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_adopts_orphaned_run() {
        let h = harness(RecordingWriter::new(), "").await;
        let mut orphan = Migration::new(
            &fixtures::request(),
            "MIG-20260101-00001".into(),
            &h.orchestrator.config().migration,
        );
        orphan.status = MigrationStatus::InProgress;
        orphan.started_at = Some(Utc::now());
        orphan.execution_holder = Some("crashed-run".into());
        h.store.save(&orphan).await.unwrap();

        let done = h.orchestrator.resume(orphan.id).await.unwrap().await.unwrap().unwrap();
        assert_eq!(done.status, MigrationStatus::Completed);
        assert!(done.resumed_at.is_some());
        assert_ne!(done.execution_holder.as_deref(), Some("crashed-run"));
        assert_eq!(h.writer.count("customers"), 5);
    }

    #[tokio::test]
    async fn test_resume_refuses_live_run() {
        let h = harness(GatedWriter::new(), "").await;
        let (m, handle) = h.orchestrator.initiate(fixtures::request()).await.unwrap();
        h.writer.entered.notified().await;

        assert!(matches!(
            h.orchestrator.resume(m.id).await,
            Err(MigrateError::AlreadyExecuting(id)) if id == m.id
        ));

        h.writer.release(1_000);
        assert_eq!(handle.await.unwrap().unwrap().status, MigrationStatus::Completed);
        assert_eq!(h.writer.inner.count("customers"), 5);
    }

    #[tokio::test]
    async fn test_superseded_run_stops_at_next_batch() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("customers.jsonl"), ROWS).unwrap();
        let store = Arc::new(MemoryStore::new());
        let lock = Arc::new(InMemoryLeaseLock::new());
        let staging = Arc::new(MemoryStaging::new());
        let instance = |writer: Arc<GatedWriter>| {
            Orchestrator::builder(config(dir.path(), "lock:\n  lease_seconds: 1\n"))
                .store(store.clone())
                .lock(lock.clone())
                .staging(staging.clone())
                .target_writer("warehouse", writer)
                .build()
        };
        let first_writer = Arc::new(GatedWriter::new());
        let second_writer = Arc::new(GatedWriter::new());
        let first = instance(first_writer.clone()).await.unwrap();
        let second = instance(second_writer.clone()).await.unwrap();

        // The first run stalls inside its first batch until its lease lapses.
        let (m, first_run) = first.initiate(fixtures::request()).await.unwrap();
        first_writer.entered.notified().await;
        tokio::time::sleep(Duration::from_millis(1_300)).await;

        second.pause(m.id).await.unwrap();
        let second_run = second.resume(m.id).await.unwrap();
        second_writer.entered.notified().await;

        first_writer.release(1_000);
        let err = first_run.await.unwrap().unwrap_err();
        assert!(matches!(err, MigrateError::Lock(_)), "{}", err);
        assert_eq!(first_writer.inner.count("customers"), 2);

        second_writer.release(1_000);
        let done = second_run.await.unwrap().unwrap();
        assert_eq!(done.status, MigrationStatus::Completed);
        assert_eq!(second_writer.inner.count("customers"), 5);
        assert_eq!(second.get(m.id).await.unwrap().status, MigrationStatus::Completed);
    }

    #[tokio::test]
    async fn test_invalid_requests_and_transitions() {
        let h = harness(RecordingWriter::new(), "").await;
        assert!(matches!(
            h.orchestrator.get(Uuid::new_v4()).await,
            Err(MigrateError::NotFound(_))
        ));

        let mut unknown_target = fixtures::request();
        unknown_target.target_system = "nowhere".into();
        assert!(matches!(
            h.orchestrator.initiate(unknown_target).await,
            Err(MigrateError::InvalidRequest(_))
        ));

        let mut unknown_transformer = fixtures::request();
        unknown_transformer.entities[0].transformations = vec!["missing".into()];
        assert!(matches!(
            h.orchestrator.initiate(unknown_transformer).await,
            Err(MigrateError::InvalidRequest(_))
        ));

        let (m, handle) = h.orchestrator.initiate(fixtures::request()).await.unwrap();
        handle.await.unwrap().unwrap();
        for outcome in [
            h.orchestrator.pause(m.id).await.err(),
            h.orchestrator.cancel(m.id).await.err(),
        ] {
            assert!(matches!(outcome, Some(MigrateError::InvalidState { .. })));
        }
        assert!(matches!(
            h.orchestrator.execute(m.id).await,
            Err(MigrateError::InvalidState { .. })
        ));
        assert!(matches!(
            h.orchestrator.resume(m.id).await,
            Err(MigrateError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_health_check_covers_every_source() {
        let h = harness(RecordingWriter::new(), "").await;
        let report = h.orchestrator.health_check().await;
        assert_eq!(report.len(), 2);
        assert!(report.iter().all(|s| s.healthy), "{:?}", report);
        assert_eq!(report[0].kind, "file");
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_migrations() {
        let h = harness(RecordingWriter::new(), "").await;
        let (m, handle) = h.orchestrator.initiate(fixtures::request()).await.unwrap();
        assert!(h.orchestrator.shutdown().await);
        assert_eq!(handle.await.unwrap().unwrap().status, MigrationStatus::Completed);
        assert!(matches!(
            h.orchestrator.initiate(fixtures::request()).await,
            Err(MigrateError::State(_))
        ));
        assert_eq!(h.orchestrator.get(m.id).await.unwrap().status, MigrationStatus::Completed);
    }
}
