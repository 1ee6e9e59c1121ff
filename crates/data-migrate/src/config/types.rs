//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len(),
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Registered data sources and targets, addressed by id.
    pub data_sources: Vec<DataSourceConfig>,

    /// Connection pool sizing shared by all relational sources.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Orchestration pool sizing.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Batch sizing and pipeline defaults.
    #[serde(default)]
    pub migration: MigrationDefaults,

    /// Distributed execution lock.
    #[serde(default)]
    pub lock: LockConfig,

    /// Migration state persistence.
    #[serde(default)]
    pub state: StateConfig,

    /// Staging area for extracted and transformed batches.
    #[serde(default)]
    pub staging: StagingConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.executor = self.executor.with_auto_tuning(&resources);
        self.pool = self.pool.with_auto_tuning(&resources);
        self
    }

    /// Look up a data source by id.
    pub fn data_source(&self, id: &str) -> Option<&DataSourceConfig> {
        self.data_sources.iter().find(|d| d.id == id)
    }
}

/// Kind of system behind a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Postgres,
    Mssql,
    File,
    Api,
    Sap,
}

impl SourceKind {
    /// Relational kinds are served through the connection pool manager.
    pub fn is_relational(&self) -> bool {
        matches!(self, SourceKind::Postgres | SourceKind::Mssql)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Postgres => "postgres",
            SourceKind::Mssql => "mssql",
            SourceKind::File => "file",
            SourceKind::Api => "api",
            SourceKind::Sap => "sap",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-disk layout of a file source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    /// One JSON object per line (`<entity>.jsonl`).
    #[default]
    JsonLines,
    /// A single JSON array of objects (`<entity>.json`).
    Json,
}

/// A registered data source or target.
///
/// Credentials arrive already decrypted. Secrets are skipped when the config
/// is serialized and redacted in `Debug` output.
#[derive(Clone, Serialize, Deserialize)]
pub struct DataSourceConfig {
    /// Unique id referenced by migration requests.
    pub id: String,

    /// System kind.
    pub kind: SourceKind,

    /// Use a single dedicated connection instead of the pool (relational only).
    #[serde(default)]
    pub legacy: bool,

    #[serde(default)]
    pub host: String,

    /// Port (default: 5432 for postgres, 1433 for mssql).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default)]
    pub database: String,

    #[serde(default)]
    pub user: String,

    #[serde(default, skip_serializing)]
    pub password: String,

    /// Default schema for entities that don't name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// PostgreSQL ssl mode (default: "disable").
    #[serde(default = "default_disable")]
    pub ssl_mode: String,

    /// SQL Server encryption (default: false).
    #[serde(default)]
    pub encrypt: bool,

    /// SQL Server: trust the server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,

    /// File sources: directory holding one file per entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// File sources: file layout.
    #[serde(default)]
    pub format: FileFormat,

    /// API and SAP sources: service root URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// API sources: bearer token.
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,

    /// API and SAP sources: records per page (default: 500).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
}

impl fmt::Debug for DataSourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceConfig")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("legacy", &self.legacy)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("path", &self.path)
            .field("base_url", &self.base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl DataSourceConfig {
    pub fn get_port(&self) -> u16 {
        self.port.unwrap_or(match self.kind {
            SourceKind::Mssql => 1433,
            _ => 5432,
        })
    }

    pub fn get_page_size(&self) -> usize {
        self.page_size.unwrap_or(500)
    }
}

/// Connection pool options applied to every relational pool.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolConfig {
    /// Maximum connections per pool. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pool_size: Option<usize>,

    /// Idle connections kept warm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_idle: Option<usize>,

    /// Wait for a connection before failing, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_timeout_ms: Option<u64>,

    /// Close connections idle longer than this, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,

    /// Recycle connections older than this, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lifetime_ms: Option<u64>,
}

impl PoolConfig {
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        if self.max_pool_size.is_none() {
            let size = (resources.cpu_cores * 2).clamp(4, 64);
            self.max_pool_size = Some(size);
            info!("Auto-tuned pool: max_pool_size={}", size);
        }
        self
    }

    pub fn get_max_pool_size(&self) -> usize {
        self.max_pool_size.unwrap_or(10)
    }

    pub fn get_min_idle(&self) -> usize {
        self.min_idle.unwrap_or(1)
    }

    pub fn get_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms.unwrap_or(30_000))
    }

    pub fn get_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.unwrap_or(600_000))
    }

    pub fn get_max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms.unwrap_or(1_800_000))
    }
}

/// Bounded orchestration pool.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutorConfig {
    /// Migrations kept running concurrently under steady load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_pool_size: Option<usize>,

    /// Upper bound on concurrently running migrations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pool_size: Option<usize>,

    /// Submissions allowed to wait for a slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,

    /// Grace period for running migrations on shutdown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub await_termination_seconds: Option<u64>,
}

impl ExecutorConfig {
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        if self.max_pool_size.is_none() {
            let size = (resources.cpu_cores / 2).clamp(2, 16);
            self.max_pool_size = Some(size);
            info!("Auto-tuned executor: max_pool_size={}", size);
        }
        self
    }

    pub fn get_core_pool_size(&self) -> usize {
        self.core_pool_size.unwrap_or(2)
    }

    pub fn get_max_pool_size(&self) -> usize {
        self.max_pool_size
            .unwrap_or(4)
            .max(self.get_core_pool_size())
    }

    pub fn get_queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(100)
    }

    pub fn get_await_termination(&self) -> Duration {
        Duration::from_secs(self.await_termination_seconds.unwrap_or(60))
    }
}

/// Pipeline defaults applied when a migration request leaves them unset.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MigrationDefaults {
    /// Rows per batch (default: 1000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Concurrent load sub-batches (default: 4).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,

    /// Retries per failed batch load (default: 3).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,

    /// Extraction worker tasks per invocation (default: 4).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_workers: Option<usize>,

    /// Rows fetched per round trip from relational sources (default: 1000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_size: Option<usize>,

    /// Bounded wait for extraction workers to drain (default: 300s).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_timeout_seconds: Option<u64>,

    /// Records sampled per entity for validation (default: 1000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<usize>,

    /// Default COMPLETENESS threshold (default: 0.95).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completeness_threshold: Option<f64>,

    /// Rows between STREAMING progress log lines (default: 10000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_log_interval: Option<usize>,

    /// Base delay for batch retry backoff, in milliseconds (default: 200).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_backoff_ms: Option<u64>,
}

impl MigrationDefaults {
    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(1_000)
    }

    pub fn get_parallelism(&self) -> usize {
        self.parallelism.unwrap_or(4)
    }

    pub fn get_retry_attempts(&self) -> u32 {
        self.retry_attempts.unwrap_or(3)
    }

    pub fn get_extraction_workers(&self) -> usize {
        self.extraction_workers.unwrap_or(4)
    }

    pub fn get_fetch_size(&self) -> usize {
        self.fetch_size.unwrap_or(1_000)
    }

    pub fn get_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds.unwrap_or(300))
    }

    pub fn get_sample_size(&self) -> usize {
        self.sample_size.unwrap_or(1_000)
    }

    pub fn get_completeness_threshold(&self) -> f64 {
        self.completeness_threshold.unwrap_or(0.95)
    }

    pub fn get_progress_log_interval(&self) -> usize {
        self.progress_log_interval.unwrap_or(10_000)
    }

    pub fn get_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.unwrap_or(200))
    }
}

/// Which store backs a coordination concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Process-local; state is lost on restart.
    #[default]
    Memory,
    /// JSON files in a directory.
    File,
    /// Tables in a PostgreSQL data source.
    Postgres,
}

/// Distributed execution lock.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LockConfig {
    /// memory or postgres.
    #[serde(default)]
    pub backend: BackendKind,

    /// Data source id holding the lock table (postgres backend).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<String>,

    /// Lease duration; renewed at every phase and batch boundary (default: 300s).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_seconds: Option<u64>,

    /// How long `execute`/`resume` wait for the lock (default: 0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_ms: Option<u64>,
}

impl LockConfig {
    pub fn get_lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds.unwrap_or(300))
    }

    pub fn get_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms.unwrap_or(0))
    }
}

/// Migration state persistence.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateConfig {
    /// memory, file or postgres.
    #[serde(default)]
    pub backend: BackendKind,

    /// Directory for the file backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Data source id holding the state tables (postgres backend).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<String>,
}

/// Staging area for batches between phases.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StagingConfig {
    /// memory or file.
    #[serde(default)]
    pub backend: BackendKind,

    /// Directory for the file backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_disable() -> String {
    "disable".to_string()
}
