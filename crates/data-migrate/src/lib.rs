//! # data-migrate
//!
//! Enterprise data migration engine.
//!
//! Moves entities from a registered source system into a target database
//! through a fixed sequence of phases, with support for:
//!
//! - **Pooled extraction** from PostgreSQL, SQL Server, REST, SAP OData and files
//! - **Load strategies** BATCH, BULK (COPY), UPSERT and STREAMING
//! - **Rule-based validation** with quality scoring before anything is loaded
//! - **Pause, resume and cancel** at batch boundaries, guarded by an execution lease
//! - **Rollback** of loaded rows and staged batches when a run fails
//!
//! ## Example
//!
//! ```rust,no_run
//! use data_migrate::{Config, MigrateError, MigrationRequest, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> data_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let orchestrator = Orchestrator::from_config(config).await?;
//!     let request = MigrationRequest::load("customers.yaml")?;
//!     let (migration, handle) = orchestrator.initiate(request).await?;
//!     println!("Started {}", migration.project_code);
//!     let finished = handle
//!         .await
//!         .map_err(|e| MigrateError::State(e.to_string()))??;
//!     println!("{}: {} rows loaded", finished.status, finished.metrics.loaded_records);
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod config;
pub mod core;
pub mod error;
pub mod extract;
pub mod load;
pub mod lock;
pub mod migration;
pub mod orchestrator;
pub mod pool;
pub mod staging;
pub mod state;
pub mod transform;
pub mod validation;

// Re-exports for convenient access
pub use audit::{AuditEvent, AuditEventType, AuditSeverity, AuditSink, CompletionNotice, Notifier};
pub use config::{Config, DataSourceConfig, ExecutorConfig, MigrationDefaults, PoolConfig, SourceKind};
pub use crate::core::{Record, SqlValue};
pub use error::{MigrateError, Result};
pub use extract::{Connector, ConnectorFactory, ExtractionResult};
pub use load::{LoadEngine, LoadResult, LoadStrategy, TargetWriter};
pub use migration::{
    Migration, MigrationMetrics, MigrationPhase, MigrationRequest, MigrationStatus, Progress,
    RollbackPoint,
};
pub use orchestrator::{MigrationHandle, Orchestrator, OrchestratorBuilder, SourceHealth};
pub use pool::{PoolHealth, PoolRegistry};
pub use staging::StagingArea;
pub use state::MigrationStore;
pub use transform::Transformer;
pub use validation::{BusinessPredicate, ValidationResult};
