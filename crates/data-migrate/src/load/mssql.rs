//! SQL Server target writer.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tiberius::numeric::Numeric;
use tiberius::Query;
use tracing::warn;

use super::sql::Dialect;
use super::TargetWriter;
use crate::core::SqlValue;
use crate::error::{MigrateError, Result};
use crate::pool::{MssqlClient, MssqlPool};

/// Writes through a bb8 load pool. No bulk path; BULK loads fall back to
/// BATCH.
pub struct MssqlWriter {
    pool: MssqlPool,
}

impl MssqlWriter {
    pub fn new(pool: MssqlPool) -> Self {
        Self { pool }
    }
}

/// tiberius binds decimals as `Numeric`: the same mantissa and scale.
fn to_numeric(d: &Decimal) -> Numeric {
    Numeric::new_with_scale(d.mantissa(), d.scale() as u8)
}

/// Bind one value. Dates and offsets travel as `datetime2`-compatible
/// naive timestamps; JSON as text.
fn bind_value(query: &mut Query<'_>, value: &SqlValue) {
    match value {
        SqlValue::Null => query.bind(Option::<String>::None),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Int(n) => query.bind(*n),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Decimal(d) => query.bind(to_numeric(d)),
        SqlValue::Text(s) => query.bind(s.clone()),
        SqlValue::Bytes(b) => query.bind(b.clone()),
        SqlValue::Uuid(u) => query.bind(*u),
        SqlValue::Timestamp(t) => query.bind(*t),
        SqlValue::TimestampTz(t) => query.bind(t.naive_utc()),
        SqlValue::Date(d) => query.bind(*d),
        SqlValue::Time(t) => query.bind(*t),
        SqlValue::Json(v) => query.bind(v.to_string()),
    }
}

async fn execute_one(client: &mut MssqlClient, sql: &str, row: &[SqlValue]) -> Result<u64> {
    let mut query = Query::new(sql.to_string());
    for value in row {
        bind_value(&mut query, value);
    }
    Ok(query.execute(client).await?.total())
}

async fn execute_all(client: &mut MssqlClient, sql: &str, rows: &[Vec<SqlValue>]) -> Result<u64> {
    let mut affected = 0;
    for row in rows {
        affected += execute_one(client, sql, row).await?;
    }
    Ok(affected)
}

#[async_trait]
impl TargetWriter for MssqlWriter {
    fn dialect(&self) -> Dialect {
        Dialect::Mssql
    }

    fn supports_bulk(&self) -> bool {
        false
    }

    async fn execute_batch(&self, sql: &str, rows: &[Vec<SqlValue>]) -> Result<u64> {
        let mut client = self.pool.get().await?;
        client.simple_query("BEGIN TRANSACTION").await?.into_results().await?;
        match execute_all(&mut client, sql, rows).await {
            Ok(affected) => {
                client.simple_query("COMMIT TRANSACTION").await?.into_results().await?;
                Ok(affected)
            }
            Err(e) => {
                if let Err(rb) = client.simple_query("ROLLBACK TRANSACTION").await {
                    warn!("Rollback after failed batch also failed: {}", rb);
                }
                Err(e)
            }
        }
    }

    async fn execute_row(&self, sql: &str, row: &[SqlValue]) -> Result<u64> {
        let mut client = self.pool.get().await?;
        execute_one(&mut client, sql, row).await
    }

    async fn copy_rows(&self, _copy_sql: &str, _rows: &[Vec<SqlValue>]) -> Result<u64> {
        Err(MigrateError::load("copy", "SQL Server targets have no COPY path"))
    }

    async fn query_count(&self, sql: &str) -> Result<i64> {
        let mut client = self.pool.get().await?;
        let row = client.simple_query(sql).await?.into_row().await?;
        row.and_then(|r| r.get::<i64, _>(0))
            .ok_or_else(|| MigrateError::load("count", "COUNT returned no row"))
    }

    async fn test_connection(&self) -> Result<()> {
        let mut client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }
}
