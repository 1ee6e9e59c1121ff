//! PostgreSQL and SQL Server extraction.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tiberius::{ColumnData, FromSql};
use tokio::sync::Mutex;
use tokio_postgres::{Row as PgRow, Statement, Transaction};
use tracing::{debug, info, warn};

use super::pipeline::RowSink;
use super::{Connector, ExtractRequest, ExtractionSummary};
use crate::config::{DataSourceConfig, SourceKind};
use crate::core::{
    qualify_mssql, qualify_pg, quote_mssql, quote_pg, ControlSignal, IdentifierRole, Record,
    SqlValue,
};
use crate::error::{MigrateError, Result};
use crate::pool::{
    make_tls_connect, pg_config, MssqlClient, PoolHandle, PoolRegistry, PoolRole, SslMode,
    TiberiusConnectionManager,
};
use crate::staging::StagingArea;

/// Connect timeout for dedicated legacy connections.
const LEGACY_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the extraction query for a relational source.
pub(crate) fn select_sql(source: &DataSourceConfig, request: &ExtractRequest) -> Result<String> {
    let schema = request.schema.as_deref().or(source.schema.as_deref());
    match source.kind {
        SourceKind::Mssql => {
            let columns = column_list(&request.columns, quote_mssql)?;
            Ok(format!(
                "SELECT {} FROM {}",
                columns,
                qualify_mssql(schema, &request.table)?
            ))
        }
        _ => {
            let columns = column_list(&request.columns, quote_pg)?;
            Ok(format!(
                "SELECT {} FROM {}",
                columns,
                qualify_pg(schema, &request.table)?
            ))
        }
    }
}

fn column_list(columns: &[String], quote: fn(&str, IdentifierRole) -> Result<String>) -> Result<String> {
    if columns.is_empty() {
        return Ok("*".to_string());
    }
    let quoted = columns
        .iter()
        .map(|c| quote(c, IdentifierRole::Column))
        .collect::<Result<Vec<_>>>()?;
    Ok(quoted.join(", "))
}

/// Rows per portal fetch: at least one, at most what the protocol's `i32` holds.
fn portal_fetch_limit(fetch_size: usize) -> i32 {
    i32::try_from(fetch_size).unwrap_or(i32::MAX).max(1)
}

/// Read a bound portal `fetch_size` rows at a time.
async fn read_postgres(
    tx: &Transaction<'_>,
    stmt: &Statement,
    fetch_size: usize,
    sink: &mut RowSink,
) -> Result<()> {
    let max_rows = portal_fetch_limit(fetch_size);
    let fetch_size = max_rows as usize;
    let portal = tx.bind(stmt, &[]).await?;
    loop {
        let rows = tx.query_portal(&portal, max_rows).await?;
        let fetched = rows.len();
        for row in rows {
            match pg_row_to_record(&row) {
                Ok(record) => sink.push(record).await?,
                Err(e) => sink.reject(format!("row {}: {}", sink.rows_seen() + 1, e)),
            }
        }
        if fetched < fetch_size {
            return Ok(());
        }
    }
}

async fn read_postgres_client(
    client: &mut tokio_postgres::Client,
    sql: &str,
    fetch_size: usize,
    sink: &mut RowSink,
) -> Result<()> {
    let tx = client.transaction().await?;
    let stmt = tx.prepare(sql).await?;
    read_postgres(&tx, &stmt, fetch_size, sink).await?;
    tx.commit().await?;
    Ok(())
}

fn pg_row_to_record(row: &PgRow) -> std::result::Result<Record, String> {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = pg_value(row, idx)
            .map_err(|e| format!("column {} ({}): {}", column.name(), column.type_().name(), e))?;
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

fn pg_value(row: &PgRow, idx: usize) -> std::result::Result<SqlValue, tokio_postgres::Error> {
    let value = match row.columns()[idx].type_().name() {
        "bool" => row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool),
        "int2" => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| SqlValue::Int(v as i64)),
        "int4" => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| SqlValue::Int(v as i64)),
        "int8" => row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Int),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| SqlValue::Float(v as f64)),
        "float8" => row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::Float),
        "numeric" => row.try_get::<_, Option<Decimal>>(idx)?.map(SqlValue::Decimal),
        "uuid" => row.try_get::<_, Option<uuid::Uuid>>(idx)?.map(SqlValue::Uuid),
        "timestamp" => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(SqlValue::Timestamp),
        "timestamptz" => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(SqlValue::TimestampTz),
        "date" => row.try_get::<_, Option<NaiveDate>>(idx)?.map(SqlValue::Date),
        "time" => row.try_get::<_, Option<NaiveTime>>(idx)?.map(SqlValue::Time),
        "bytea" => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(SqlValue::Bytes),
        "json" | "jsonb" => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(SqlValue::Json),
        _ => row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

async fn read_mssql(client: &mut MssqlClient, sql: &str, sink: &mut RowSink) -> Result<()> {
    let stream = client.simple_query(sql).await?;
    let mut rows = stream.into_row_stream();
    while let Some(row) = rows.try_next().await? {
        let names: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
        let mut record = Record::new();
        let mut bad = None;
        for (name, data) in names.into_iter().zip(row.into_iter()) {
            match mssql_value(&data) {
                Ok(value) => {
                    record.insert(name, value);
                }
                Err(e) => {
                    bad = Some(format!("column {}: {}", name, e));
                    break;
                }
            }
        }
        match bad {
            None => sink.push(record).await?,
            Some(msg) => sink.reject(format!("row {}: {}", sink.rows_seen() + 1, msg)),
        }
    }
    Ok(())
}

fn mssql_value(data: &ColumnData<'static>) -> tiberius::Result<SqlValue> {
    let value = match data {
        ColumnData::U8(v) => v.map(|x| SqlValue::Int(x as i64)),
        ColumnData::I16(v) => v.map(|x| SqlValue::Int(x as i64)),
        ColumnData::I32(v) => v.map(|x| SqlValue::Int(x as i64)),
        ColumnData::I64(v) => v.map(SqlValue::Int),
        ColumnData::F32(v) => v.map(|x| SqlValue::Float(x as f64)),
        ColumnData::F64(v) => v.map(SqlValue::Float),
        ColumnData::Bit(v) => v.map(SqlValue::Bool),
        ColumnData::String(v) => v.as_ref().map(|s| SqlValue::Text(s.to_string())),
        ColumnData::Guid(v) => v.map(SqlValue::Uuid),
        ColumnData::Binary(v) => v.as_ref().map(|b| SqlValue::Bytes(b.to_vec())),
        ColumnData::Numeric(_) => Decimal::from_sql(data)?.map(SqlValue::Decimal),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data)?.map(SqlValue::Timestamp)
        }
        ColumnData::Date(_) => NaiveDate::from_sql(data)?.map(SqlValue::Date),
        ColumnData::Time(_) => NaiveTime::from_sql(data)?.map(SqlValue::Time),
        ColumnData::DateTimeOffset(_) => {
            DateTime::<Utc>::from_sql(data)?.map(SqlValue::TimestampTz)
        }
        _ => {
            return Err(tiberius::error::Error::Conversion(
                "unsupported SQL Server column type".into(),
            ))
        }
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

/// Reads through the pool manager's read-only extraction pools.
pub struct PooledConnector {
    source: DataSourceConfig,
    pools: Arc<PoolRegistry>,
}

impl PooledConnector {
    pub fn new(source: DataSourceConfig, pools: Arc<PoolRegistry>) -> Self {
        Self { source, pools }
    }

    async fn read(&self, sql: &str, fetch_size: usize, sink: &mut RowSink) -> Result<()> {
        match self.pools.get(&self.source.id, PoolRole::Extraction).await? {
            PoolHandle::Postgres(pool) => {
                let mut client = pool.get().await?;
                let tx = client.transaction().await?;
                let stmt = tx.prepare_cached(sql).await?;
                read_postgres(&tx, &stmt, fetch_size, sink).await?;
                tx.commit().await?;
                Ok(())
            }
            PoolHandle::Mssql(pool) => {
                let mut client = pool.get().await?;
                read_mssql(&mut client, sql, sink).await
            }
        }
    }
}

#[async_trait]
impl Connector for PooledConnector {
    async fn test_connection(&self) -> Result<()> {
        self.pools.test_connection(&self.source.id).await
    }

    async fn extract(
        &self,
        request: &ExtractRequest,
        staging: Arc<dyn StagingArea>,
        control: &ControlSignal,
    ) -> Result<ExtractionSummary> {
        request.validate()?;
        let sql = select_sql(&self.source, request)?;
        debug!("Extracting {} from '{}': {}", request.entity, self.source.id, sql);

        let mut sink = RowSink::new(request, staging, control.clone());
        let outcome = self.read(&sql, request.fetch_size, &mut sink).await;
        let summary = sink.complete(outcome).await?;
        info!(
            "Extracted {} rows of {} from '{}' ({} failed)",
            summary.records_extracted, request.entity, self.source.id, summary.records_failed
        );
        Ok(summary)
    }

    fn kind(&self) -> SourceKind {
        self.source.kind
    }
}

enum LegacyClient {
    Postgres(tokio_postgres::Client),
    Mssql(MssqlClient),
}

/// Reads over one dedicated connection, opened on first use and kept until
/// [`Connector::close`]. Extractions through it run one at a time.
pub struct LegacyConnector {
    source: DataSourceConfig,
    client: Mutex<Option<LegacyClient>>,
}

impl LegacyConnector {
    pub fn new(source: DataSourceConfig) -> Self {
        Self {
            source,
            client: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<LegacyClient> {
        info!("Opening dedicated {} connection to '{}'", self.source.kind, self.source.id);
        match self.source.kind {
            SourceKind::Mssql => {
                let manager = TiberiusConnectionManager::new(self.source.clone(), true);
                Ok(LegacyClient::Mssql(manager.connect_once().await?))
            }
            _ => {
                let config = pg_config(&self.source, LEGACY_CONNECT_TIMEOUT, true);
                let id = self.source.id.clone();
                let client = match make_tls_connect(SslMode::parse(&self.source.ssl_mode)?, &id)? {
                    Some(tls) => {
                        let (client, connection) = config.connect(tls).await?;
                        tokio::spawn(async move {
                            if let Err(e) = connection.await {
                                warn!("Dedicated connection to '{}' closed: {}", id, e);
                            }
                        });
                        client
                    }
                    None => {
                        let (client, connection) = config.connect(tokio_postgres::NoTls).await?;
                        tokio::spawn(async move {
                            if let Err(e) = connection.await {
                                warn!("Dedicated connection to '{}' closed: {}", id, e);
                            }
                        });
                        client
                    }
                };
                Ok(LegacyClient::Postgres(client))
            }
        }
    }

    async fn read(
        &self,
        slot: &mut Option<LegacyClient>,
        sql: &str,
        fetch_size: usize,
        sink: &mut RowSink,
    ) -> Result<()> {
        if slot.as_ref().map_or(true, |c| matches!(c, LegacyClient::Postgres(pg) if pg.is_closed())) {
            *slot = Some(self.connect().await?);
        }
        let outcome = match slot.as_mut() {
            Some(LegacyClient::Postgres(client)) => {
                read_postgres_client(client, sql, fetch_size, sink).await
            }
            Some(LegacyClient::Mssql(client)) => read_mssql(client, sql, sink).await,
            None => Err(MigrateError::pool("no dedicated connection", self.source.id.clone())),
        };
        // A connection that failed mid-query is reopened next time.
        if matches!(&outcome, Err(e) if !e.is_interruption()) {
            *slot = None;
        }
        outcome
    }
}

#[async_trait]
impl Connector for LegacyConnector {
    async fn test_connection(&self) -> Result<()> {
        let mut slot = self.client.lock().await;
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        let result = match slot.as_mut() {
            Some(LegacyClient::Postgres(client)) => client.simple_query("SELECT 1").await.map(|_| ()).map_err(MigrateError::from),
            Some(LegacyClient::Mssql(client)) => match client.simple_query("SELECT 1").await {
                Ok(stream) => stream.into_row().await.map(|_| ()).map_err(MigrateError::from),
                Err(e) => Err(e.into()),
            },
            None => Ok(()),
        };
        if result.is_err() {
            *slot = None;
        }
        result
    }

    async fn extract(
        &self,
        request: &ExtractRequest,
        staging: Arc<dyn StagingArea>,
        control: &ControlSignal,
    ) -> Result<ExtractionSummary> {
        request.validate()?;
        let sql = select_sql(&self.source, request)?;
        let mut slot = self.client.lock().await;

        let mut sink = RowSink::new(request, staging, control.clone());
        let outcome = self.read(&mut slot, &sql, request.fetch_size, &mut sink).await;
        let summary = sink.complete(outcome).await?;
        info!(
            "Extracted {} rows of {} from '{}' over a dedicated connection",
            summary.records_extracted, request.entity, self.source.id
        );
        Ok(summary)
    }

    async fn close(&self) {
        if self.client.lock().await.take().is_some() {
            debug!("Closed dedicated connection to '{}'", self.source.id);
        }
    }

    fn kind(&self) -> SourceKind {
        self.source.kind
    }
}
