//! Configuration validation.

use super::{BackendKind, Config, DataSourceConfig, SourceKind};
use crate::error::{MigrateError, Result};
use crate::pool::SslMode;
use std::collections::HashSet;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.data_sources.is_empty() {
        return Err(MigrateError::Config(
            "at least one entry in data_sources is required".into(),
        ));
    }

    let mut seen = HashSet::new();
    for ds in &config.data_sources {
        if !seen.insert(ds.id.as_str()) {
            return Err(MigrateError::Config(format!(
                "duplicate data source id '{}'",
                ds.id
            )));
        }
        validate_data_source(ds)?;
    }

    if let Some(0) = config.pool.max_pool_size {
        return Err(MigrateError::Config(
            "pool.max_pool_size must be at least 1".into(),
        ));
    }
    if let (Some(min), Some(max)) = (config.pool.min_idle, config.pool.max_pool_size) {
        if min > max {
            return Err(MigrateError::Config(format!(
                "pool.min_idle ({}) cannot exceed pool.max_pool_size ({})",
                min, max
            )));
        }
    }
    if let Some(0) = config.executor.max_pool_size {
        return Err(MigrateError::Config(
            "executor.max_pool_size must be at least 1".into(),
        ));
    }
    if let Some(0) = config.migration.batch_size {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if let Some(0) = config.migration.parallelism {
        return Err(MigrateError::Config(
            "migration.parallelism must be at least 1".into(),
        ));
    }
    if let Some(fetch) = config.migration.fetch_size {
        if fetch == 0 || i32::try_from(fetch).is_err() {
            return Err(MigrateError::Config(format!(
                "migration.fetch_size must be between 1 and {}, got {}",
                i32::MAX,
                fetch
            )));
        }
    }
    if let Some(0) = config.migration.extraction_workers {
        return Err(MigrateError::Config(
            "migration.extraction_workers must be at least 1".into(),
        ));
    }
    if let Some(t) = config.migration.completeness_threshold {
        if !(0.0..=1.0).contains(&t) {
            return Err(MigrateError::Config(format!(
                "migration.completeness_threshold must be within [0, 1], got {}",
                t
            )));
        }
    }
    if let Some(0) = config.lock.lease_seconds {
        return Err(MigrateError::Config(
            "lock.lease_seconds must be at least 1".into(),
        ));
    }

    match config.lock.backend {
        BackendKind::Memory => {}
        BackendKind::Postgres => {
            require_postgres_source(config, config.lock.data_source.as_deref(), "lock")?
        }
        BackendKind::File => {
            return Err(MigrateError::Config(
                "lock.backend must be 'memory' or 'postgres'".into(),
            ))
        }
    }

    match config.state.backend {
        BackendKind::Memory => {}
        BackendKind::File => {
            if config.state.path.is_none() {
                return Err(MigrateError::Config(
                    "state.path is required for the file backend".into(),
                ));
            }
        }
        BackendKind::Postgres => {
            require_postgres_source(config, config.state.data_source.as_deref(), "state")?
        }
    }

    match config.staging.backend {
        BackendKind::Memory => {}
        BackendKind::File => {
            if config.staging.path.is_none() {
                return Err(MigrateError::Config(
                    "staging.path is required for the file backend".into(),
                ));
            }
        }
        BackendKind::Postgres => {
            return Err(MigrateError::Config(
                "staging.backend must be 'memory' or 'file'".into(),
            ))
        }
    }

    Ok(())
}

fn validate_data_source(ds: &DataSourceConfig) -> Result<()> {
    if ds.id.trim().is_empty() {
        return Err(MigrateError::Config("data source id is required".into()));
    }
    match ds.kind {
        SourceKind::Postgres | SourceKind::Mssql => {
            if ds.host.is_empty() {
                return Err(MigrateError::Config(format!(
                    "data_sources[{}].host is required",
                    ds.id
                )));
            }
            if ds.database.is_empty() {
                return Err(MigrateError::Config(format!(
                    "data_sources[{}].database is required",
                    ds.id
                )));
            }
            if ds.user.is_empty() {
                return Err(MigrateError::Config(format!(
                    "data_sources[{}].user is required",
                    ds.id
                )));
            }
            if ds.kind == SourceKind::Postgres {
                SslMode::parse(&ds.ssl_mode)?;
            }
        }
        SourceKind::File => {
            if ds.path.is_none() {
                return Err(MigrateError::Config(format!(
                    "data_sources[{}].path is required for file sources",
                    ds.id
                )));
            }
        }
        SourceKind::Api | SourceKind::Sap => {
            match ds.base_url.as_deref() {
                Some(url) if url.starts_with("http://") || url.starts_with("https://") => {}
                _ => {
                    return Err(MigrateError::Config(format!(
                        "data_sources[{}].base_url must be an http(s) URL",
                        ds.id
                    )))
                }
            }
            if let Some(0) = ds.page_size {
                return Err(MigrateError::Config(format!(
                    "data_sources[{}].page_size must be at least 1",
                    ds.id
                )));
            }
        }
    }
    if ds.legacy && !ds.kind.is_relational() {
        return Err(MigrateError::Config(format!(
            "data_sources[{}].legacy only applies to relational sources",
            ds.id
        )));
    }
    Ok(())
}

fn require_postgres_source(config: &Config, id: Option<&str>, section: &str) -> Result<()> {
    let id = id.ok_or_else(|| {
        MigrateError::Config(format!(
            "{}.data_source is required for the postgres backend",
            section
        ))
    })?;
    match config.data_source(id) {
        Some(ds) if ds.kind == SourceKind::Postgres => Ok(()),
        Some(_) => Err(MigrateError::Config(format!(
            "{}.data_source '{}' must be a postgres data source",
            section, id
        ))),
        None => Err(MigrateError::Config(format!(
            "{}.data_source '{}' is not a registered data source",
            section, id
        ))),
    }
}
