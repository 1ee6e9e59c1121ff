//! Source connectors and parallel batch extraction.
//!
//! A connector reads one entity from its source in fixed-size batches and
//! hands them to a bounded worker pool that writes to staging. Relational
//! sources are read through the pool manager's read-only extraction pools
//! (or a dedicated connection for legacy sources); files and HTTP services
//! are read directly.

mod file;
mod http;
mod pipeline;
mod relational;
mod result;

pub use file::FileConnector;
pub use http::{ApiConnector, SapConnector};
pub use pipeline::{BatchPipeline, RowSink};
pub use relational::{LegacyConnector, PooledConnector};
pub use result::{ExtractionResult, ExtractionSummary};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DataSourceConfig, MigrationDefaults, SourceKind};
use crate::core::{validate_all, validate_sql_identifier, ControlSignal, IdentifierRole};
use crate::error::Result;
use crate::migration::ExtractionTask;
use crate::pool::PoolRegistry;
use crate::staging::StagingArea;

/// What to read and how to batch it.
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub entity: String,
    pub schema: Option<String>,
    pub table: String,
    /// Empty means every column the source returns.
    pub columns: Vec<String>,
    pub staging_key: String,
    pub batch_size: usize,
    /// Rows per round trip for relational cursors.
    pub fetch_size: usize,
    pub workers: usize,
    pub drain_timeout: Duration,
}

impl ExtractRequest {
    pub fn from_task(task: &ExtractionTask, batch_size: usize, defaults: &MigrationDefaults) -> Self {
        Self {
            entity: task.entity.clone(),
            schema: task.source_schema.clone(),
            table: task.source_table.clone(),
            columns: task.columns.clone(),
            staging_key: task.staging_key.clone(),
            batch_size,
            fetch_size: defaults.get_fetch_size(),
            workers: defaults.get_extraction_workers(),
            drain_timeout: defaults.get_drain_timeout(),
        }
    }

    /// Check every name that will be spliced into a query.
    pub fn validate(&self) -> Result<()> {
        if let Some(schema) = &self.schema {
            validate_sql_identifier(schema, IdentifierRole::Schema)?;
        }
        validate_sql_identifier(&self.table, IdentifierRole::Table)?;
        validate_all(&self.columns, IdentifierRole::Column)
    }
}

/// A readable source system.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Cheap reachability check.
    async fn test_connection(&self) -> Result<()>;

    /// Read one entity into `staging` under `request.staging_key`.
    ///
    /// Source errors are reported through the summary's error list; only
    /// identifier errors and pause/cancel come back as `Err`.
    async fn extract(
        &self,
        request: &ExtractRequest,
        staging: Arc<dyn StagingArea>,
        control: &ControlSignal,
    ) -> Result<ExtractionSummary>;

    /// Release any connection held outside the pool manager.
    async fn close(&self) {}

    fn kind(&self) -> SourceKind;
}

/// Closed set of connectors, dispatched statically.
pub enum ConnectorImpl {
    Pooled(PooledConnector),
    Legacy(LegacyConnector),
    File(FileConnector),
    Api(ApiConnector),
    Sap(SapConnector),
}

#[async_trait]
impl Connector for ConnectorImpl {
    async fn test_connection(&self) -> Result<()> {
        match self {
            Self::Pooled(c) => c.test_connection().await,
            Self::Legacy(c) => c.test_connection().await,
            Self::File(c) => c.test_connection().await,
            Self::Api(c) => c.test_connection().await,
            Self::Sap(c) => c.test_connection().await,
        }
    }

    async fn extract(
        &self,
        request: &ExtractRequest,
        staging: Arc<dyn StagingArea>,
        control: &ControlSignal,
    ) -> Result<ExtractionSummary> {
        match self {
            Self::Pooled(c) => c.extract(request, staging, control).await,
            Self::Legacy(c) => c.extract(request, staging, control).await,
            Self::File(c) => c.extract(request, staging, control).await,
            Self::Api(c) => c.extract(request, staging, control).await,
            Self::Sap(c) => c.extract(request, staging, control).await,
        }
    }

    async fn close(&self) {
        match self {
            Self::Pooled(c) => c.close().await,
            Self::Legacy(c) => c.close().await,
            Self::File(c) => c.close().await,
            Self::Api(c) => c.close().await,
            Self::Sap(c) => c.close().await,
        }
    }

    fn kind(&self) -> SourceKind {
        match self {
            Self::Pooled(c) => c.kind(),
            Self::Legacy(c) => c.kind(),
            Self::File(c) => c.kind(),
            Self::Api(c) => c.kind(),
            Self::Sap(c) => c.kind(),
        }
    }
}

/// Picks a connector for a data source.
pub struct ConnectorFactory {
    pools: Arc<PoolRegistry>,
    http: reqwest::Client,
}

impl ConnectorFactory {
    pub fn new(pools: Arc<PoolRegistry>) -> Self {
        Self {
            pools,
            http: reqwest::Client::new(),
        }
    }

    /// Connector for the registered data source `id`.
    pub fn for_source(&self, id: &str) -> Result<ConnectorImpl> {
        let source = self.pools.data_source(id)?.clone();
        Ok(Self::build(source, self.pools.clone(), self.http.clone()))
    }

    fn build(source: DataSourceConfig, pools: Arc<PoolRegistry>, http: reqwest::Client) -> ConnectorImpl {
        match source.kind {
            SourceKind::Postgres | SourceKind::Mssql if source.legacy => {
                ConnectorImpl::Legacy(LegacyConnector::new(source))
            }
            SourceKind::Postgres | SourceKind::Mssql => {
                ConnectorImpl::Pooled(PooledConnector::new(source, pools))
            }
            SourceKind::File => ConnectorImpl::File(FileConnector::new(source)),
            SourceKind::Api => ConnectorImpl::Api(ApiConnector::new(source, http)),
            SourceKind::Sap => ConnectorImpl::Sap(SapConnector::new(source, http)),
        }
    }
}
