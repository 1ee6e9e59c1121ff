//! Connection pool manager.
//!
//! One pool per (data source, role), created lazily on first use and kept for
//! the life of the registry. Extraction pools hand out read-only connections;
//! load pools are read-write and also back the state store and lock table.

mod mssql;
mod tls;

pub use mssql::{MssqlClient, MssqlPool, TiberiusConnectionManager};
pub use tls::{make_tls_connect, SslMode};

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use crate::config::{Config, DataSourceConfig, PoolConfig, SourceKind};
use crate::error::{MigrateError, Result};

/// How often idle and over-age PostgreSQL connections are pruned.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// What a pool's connections are used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolRole {
    /// Read-only, auto-commit connections for extraction.
    Extraction,
    /// Read-write connections for loading and bookkeeping.
    Load,
}

impl PoolRole {
    pub fn is_read_only(&self) -> bool {
        matches!(self, PoolRole::Extraction)
    }
}

impl fmt::Display for PoolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolRole::Extraction => f.write_str("extraction"),
            PoolRole::Load => f.write_str("load"),
        }
    }
}

/// Connection settings for a PostgreSQL data source.
///
/// Read-only sessions default every transaction to READ ONLY.
pub(crate) fn pg_config(
    source: &DataSourceConfig,
    connect_timeout: Duration,
    read_only: bool,
) -> PgConfig {
    let mut pg_config = PgConfig::new();
    pg_config.host(&source.host);
    pg_config.port(source.get_port());
    pg_config.dbname(&source.database);
    pg_config.user(&source.user);
    pg_config.password(&source.password);
    pg_config.application_name("data-migrate");
    pg_config.connect_timeout(connect_timeout);
    if read_only {
        pg_config.options("-c default_transaction_read_only=on");
    }
    pg_config
}

/// A pool for one relational data source.
#[derive(Clone)]
pub enum PoolHandle {
    Postgres(Pool),
    Mssql(MssqlPool),
}

impl PoolHandle {
    pub fn backend(&self) -> &'static str {
        match self {
            PoolHandle::Postgres(_) => "postgres",
            PoolHandle::Mssql(_) => "mssql",
        }
    }

    /// Check out a connection and run a trivial query.
    pub async fn ping(&self) -> Result<()> {
        match self {
            PoolHandle::Postgres(pool) => {
                let client = pool.get().await?;
                client.simple_query("SELECT 1").await?;
            }
            PoolHandle::Mssql(pool) => {
                let mut client = pool.get().await?;
                client.simple_query("SELECT 1").await?.into_row().await?;
            }
        }
        Ok(())
    }

    fn health(&self, data_source: &str, role: PoolRole, configured_max: usize) -> PoolHealth {
        match self {
            PoolHandle::Postgres(pool) => {
                let status = pool.status();
                PoolHealth {
                    data_source: data_source.to_string(),
                    role,
                    backend: "postgres",
                    size: status.size,
                    idle: status.available,
                    max_size: status.max_size,
                    waiting: status.waiting,
                }
            }
            PoolHandle::Mssql(pool) => {
                let state = pool.state();
                PoolHealth {
                    data_source: data_source.to_string(),
                    role,
                    backend: "mssql",
                    size: state.connections as usize,
                    idle: state.idle_connections as usize,
                    max_size: configured_max,
                    waiting: 0,
                }
            }
        }
    }

    fn close(&self) {
        match self {
            PoolHandle::Postgres(pool) => pool.close(),
            // bb8 closes connections when the last pool handle drops.
            PoolHandle::Mssql(_) => {}
        }
    }
}

/// Pool metrics for one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub data_source: String,
    pub role: PoolRole,
    pub backend: &'static str,
    /// Open connections.
    pub size: usize,
    /// Connections available for checkout.
    pub idle: usize,
    pub max_size: usize,
    /// Callers waiting for a connection.
    pub waiting: usize,
}

/// Registry of relational pools, shared by `Arc`.
pub struct PoolRegistry {
    sources: HashMap<String, DataSourceConfig>,
    options: PoolConfig,
    pools: Mutex<HashMap<(String, PoolRole), PoolHandle>>,
    reapers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PoolRegistry {
    pub fn new(sources: &[DataSourceConfig], options: PoolConfig) -> Self {
        Self {
            sources: sources
                .iter()
                .map(|s| (s.id.clone(), s.clone()))
                .collect(),
            options,
            pools: Mutex::new(HashMap::new()),
            reapers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.data_sources, config.pool.clone())
    }

    pub fn data_source(&self, id: &str) -> Result<&DataSourceConfig> {
        self.sources
            .get(id)
            .ok_or_else(|| MigrateError::Config(format!("Unknown data source '{}'", id)))
    }

    /// Get (creating on first use) the pool for a relational data source.
    pub async fn get(&self, id: &str, role: PoolRole) -> Result<PoolHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MigrateError::pool(
                "pool registry is shut down",
                format!("requesting {} pool for '{}'", role, id),
            ));
        }
        let source = self.data_source(id)?;

        let mut pools = self.pools.lock().await;
        if let Some(handle) = pools.get(&(id.to_string(), role)) {
            return Ok(handle.clone());
        }

        let handle = match source.kind {
            SourceKind::Postgres => PoolHandle::Postgres(self.create_postgres(source, role).await?),
            SourceKind::Mssql => PoolHandle::Mssql(self.create_mssql(source, role).await?),
            other => {
                return Err(MigrateError::Config(format!(
                    "Data source '{}' is a {} source and has no connection pool",
                    id, other
                )))
            }
        };
        info!(
            "Created {} {} pool for '{}' (max {})",
            handle.backend(),
            role,
            id,
            self.options.get_max_pool_size()
        );
        pools.insert((id.to_string(), role), handle.clone());
        Ok(handle)
    }

    /// Get the PostgreSQL pool for `id`.
    pub async fn postgres(&self, id: &str, role: PoolRole) -> Result<Pool> {
        match self.get(id, role).await? {
            PoolHandle::Postgres(pool) => Ok(pool),
            PoolHandle::Mssql(_) => Err(MigrateError::Config(format!(
                "Data source '{}' is not a postgres data source",
                id
            ))),
        }
    }

    async fn create_postgres(&self, source: &DataSourceConfig, role: PoolRole) -> Result<Pool> {
        let pg_config = pg_config(
            source,
            self.options.get_connection_timeout(),
            role.is_read_only(),
        );

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = match make_tls_connect(SslMode::parse(&source.ssl_mode)?, &source.id)? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config),
        };

        let timeout = self.options.get_connection_timeout();
        let pool = Pool::builder(mgr)
            .max_size(self.options.get_max_pool_size())
            .wait_timeout(Some(timeout))
            .create_timeout(Some(timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| {
                MigrateError::pool(e.to_string(), format!("creating postgres pool for '{}'", source.id))
            })?;

        self.warm_up(&pool, &source.id).await;
        self.spawn_reaper(pool.clone(), source.id.clone()).await;
        Ok(pool)
    }

    /// Open `min_idle` connections up front. Failures only log; the first
    /// checkout reports the real error.
    async fn warm_up(&self, pool: &Pool, id: &str) {
        let wanted = self.options.get_min_idle().min(self.options.get_max_pool_size());
        let checkouts = (0..wanted).map(|_| pool.get());
        let results = futures::future::join_all(checkouts).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!("Could not pre-open {} connection(s) for '{}'", failed, id);
        }
    }

    async fn spawn_reaper(&self, pool: Pool, id: String) {
        let idle_timeout = self.options.get_idle_timeout();
        let max_lifetime = self.options.get_max_lifetime();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            loop {
                ticker.tick().await;
                if pool.is_closed() {
                    break;
                }
                let result = pool.retain(|_, metrics| {
                    metrics.last_used() < idle_timeout && metrics.age() < max_lifetime
                });
                if !result.removed.is_empty() {
                    debug!("Pruned {} connection(s) from '{}'", result.removed.len(), id);
                }
            }
        });
        self.reapers.lock().await.push(handle);
    }

    async fn create_mssql(&self, source: &DataSourceConfig, role: PoolRole) -> Result<MssqlPool> {
        let manager = TiberiusConnectionManager::new(source.clone(), role.is_read_only());
        let max = self.options.get_max_pool_size() as u32;
        let min_idle = (self.options.get_min_idle() as u32).min(max);
        bb8::Pool::builder()
            .max_size(max)
            .min_idle(Some(min_idle))
            .connection_timeout(self.options.get_connection_timeout())
            .idle_timeout(Some(self.options.get_idle_timeout()))
            .max_lifetime(Some(self.options.get_max_lifetime()))
            .build(manager)
            .await
            .map_err(MigrateError::Source)
    }

    /// Metrics for every pool created so far.
    pub async fn health(&self) -> Vec<PoolHealth> {
        let pools = self.pools.lock().await;
        let mut health: Vec<PoolHealth> = pools
            .iter()
            .map(|((id, role), handle)| {
                handle.health(id, *role, self.options.get_max_pool_size())
            })
            .collect();
        health.sort_by(|a, b| a.data_source.cmp(&b.data_source));
        health
    }

    /// Check connectivity to a relational data source through its extraction pool.
    pub async fn test_connection(&self, id: &str) -> Result<()> {
        self.get(id, PoolRole::Extraction).await?.ping().await
    }

    /// Close every pool. Further `get` calls fail.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for handle in self.reapers.lock().await.drain(..) {
            handle.abort();
        }
        let mut pools = self.pools.lock().await;
        for ((id, role), handle) in pools.drain() {
            handle.close();
            debug!("Closed {} pool for '{}'", role, id);
        }
        info!("Connection pools closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileFormat;

    fn file_source(id: &str) -> DataSourceConfig {
        DataSourceConfig {
            id: id.to_string(),
            kind: SourceKind::File,
            legacy: false,
            host: String::new(),
            port: None,
            database: String::new(),
            user: String::new(),
            password: String::new(),
            schema: None,
            ssl_mode: "disable".into(),
            encrypt: false,
            trust_server_cert: false,
            path: Some("/tmp".into()),
            format: FileFormat::JsonLines,
            base_url: None,
            auth_token: None,
            page_size: None,
        }
    }

    #[tokio::test]
    async fn test_unknown_source_is_config_error() {
        let registry = PoolRegistry::new(&[], PoolConfig::default());
        let err = registry.get("nope", PoolRole::Load).await.err().unwrap();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[tokio::test]
    async fn test_non_relational_source_has_no_pool() {
        let registry = PoolRegistry::new(&[file_source("files")], PoolConfig::default());
        let err = registry.get("files", PoolRole::Extraction).await.err().unwrap();
        assert!(matches!(err, MigrateError::Config(_)));
        assert!(registry.health().await.is_empty());
    }

    #[tokio::test]
    async fn test_get_after_shutdown_fails() {
        let registry = PoolRegistry::new(&[file_source("files")], PoolConfig::default());
        registry.shutdown().await;
        let err = registry.get("files", PoolRole::Load).await.err().unwrap();
        assert!(matches!(err, MigrateError::Pool { .. }));
    }

    #[test]
    fn test_extraction_role_is_read_only() {
        assert!(PoolRole::Extraction.is_read_only());
        assert!(!PoolRole::Load.is_read_only());
    }
}
