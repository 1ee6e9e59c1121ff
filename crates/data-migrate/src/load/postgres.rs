//! PostgreSQL target writer.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool_postgres::Pool;
use futures::SinkExt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::error::Error as StdError;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

use super::sql::{copy_text, Dialect};
use super::TargetWriter;
use crate::core::SqlValue;
use crate::error::{MigrateError, Result};

/// Rows per COPY buffer flush.
const COPY_FLUSH_ROWS: usize = 10_000;

type BoxError = Box<dyn StdError + Sync + Send>;

/// Binds a [`SqlValue`] as whatever type the prepared statement expects.
///
/// NULL binds to any column type. Text values are parsed into numeric,
/// temporal, uuid and boolean columns.
#[derive(Debug)]
pub(crate) struct PgParam<'a>(pub &'a SqlValue);

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        let name = ty.name();
        match (self.0, name) {
            (SqlValue::Null, _) => Ok(IsNull::Yes),
            (SqlValue::Bool(b), "bool") => b.to_sql(ty, out),
            (SqlValue::Int(n), "int2") => i16::try_from(*n)?.to_sql(ty, out),
            (SqlValue::Int(n), "int4") => i32::try_from(*n)?.to_sql(ty, out),
            (SqlValue::Int(n), "int8") => n.to_sql(ty, out),
            (SqlValue::Int(n), "float4") => (*n as f32).to_sql(ty, out),
            (SqlValue::Int(n), "float8") => (*n as f64).to_sql(ty, out),
            (SqlValue::Int(n), "numeric") => Decimal::from(*n).to_sql(ty, out),
            (SqlValue::Float(f), "float4") => (*f as f32).to_sql(ty, out),
            (SqlValue::Float(f), "float8") => f.to_sql(ty, out),
            (SqlValue::Float(f), "numeric") => Decimal::try_from(*f)?.to_sql(ty, out),
            (SqlValue::Decimal(d), "numeric") => d.to_sql(ty, out),
            (SqlValue::Decimal(d), "float8") => d
                .to_f64()
                .ok_or("decimal out of float8 range")?
                .to_sql(ty, out),
            (SqlValue::Decimal(d), "int8") => d
                .to_i64()
                .ok_or("decimal out of int8 range")?
                .to_sql(ty, out),
            (SqlValue::Uuid(u), "uuid") => u.to_sql(ty, out),
            (SqlValue::Timestamp(t), "timestamp") => t.to_sql(ty, out),
            (SqlValue::Timestamp(t), "timestamptz") => t.and_utc().to_sql(ty, out),
            (SqlValue::Timestamp(t), "date") => t.date().to_sql(ty, out),
            (SqlValue::TimestampTz(t), "timestamptz") => t.to_sql(ty, out),
            (SqlValue::TimestampTz(t), "timestamp") => t.naive_utc().to_sql(ty, out),
            (SqlValue::Date(d), "date") => d.to_sql(ty, out),
            (SqlValue::Time(t), "time") => t.to_sql(ty, out),
            (SqlValue::Bytes(b), "bytea") => b.to_sql(ty, out),
            (SqlValue::Json(v), "json" | "jsonb") => v.to_sql(ty, out),
            (SqlValue::Text(s), "json" | "jsonb") => {
                let v: serde_json::Value = serde_json::from_str(s)
                    .unwrap_or_else(|_| serde_json::Value::String(s.clone()));
                v.to_sql(ty, out)
            }
            (SqlValue::Text(s), _) => text_to_sql(s, ty, out),
            (other, "text" | "varchar" | "bpchar" | "name") => {
                other.to_string().as_str().to_sql(ty, out)
            }
            (other, _) => Err(format!(
                "cannot bind {} value to a {} column",
                other.type_name(),
                name
            )
            .into()),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn text_to_sql(s: &str, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
    let t = s.trim();
    match ty.name() {
        "bool" => match t.to_ascii_lowercase().as_str() {
            "t" | "true" | "1" | "y" | "yes" => true.to_sql(ty, out),
            "f" | "false" | "0" | "n" | "no" => false.to_sql(ty, out),
            _ => Err(format!("invalid boolean {:?}", s).into()),
        },
        "int2" => t.parse::<i16>()?.to_sql(ty, out),
        "int4" => t.parse::<i32>()?.to_sql(ty, out),
        "int8" => t.parse::<i64>()?.to_sql(ty, out),
        "float4" => t.parse::<f32>()?.to_sql(ty, out),
        "float8" => t.parse::<f64>()?.to_sql(ty, out),
        "numeric" => t.parse::<Decimal>()?.to_sql(ty, out),
        "uuid" => t.parse::<uuid::Uuid>()?.to_sql(ty, out),
        "date" => t.parse::<NaiveDate>()?.to_sql(ty, out),
        "time" => t.parse::<NaiveTime>()?.to_sql(ty, out),
        "timestamp" => t.parse::<NaiveDateTime>()?.to_sql(ty, out),
        "timestamptz" => t.parse::<DateTime<Utc>>()?.to_sql(ty, out),
        _ => s.to_sql(ty, out),
    }
}

/// Writes through a deadpool load pool.
pub struct PgWriter {
    pool: Pool,
}

impl PgWriter {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn params(row: &[SqlValue]) -> Vec<PgParam<'_>> {
    row.iter().map(PgParam).collect()
}

fn refs<'a>(params: &'a [PgParam<'a>]) -> Vec<&'a (dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl TargetWriter for PgWriter {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn supports_bulk(&self) -> bool {
        true
    }

    async fn execute_batch(&self, sql: &str, rows: &[Vec<SqlValue>]) -> Result<u64> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let stmt = tx.prepare_cached(sql).await?;
        let mut affected = 0;
        for row in rows {
            let p = params(row);
            affected += tx.execute(&stmt, &refs(&p)).await?;
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn execute_row(&self, sql: &str, row: &[SqlValue]) -> Result<u64> {
        let client = self.pool.get().await?;
        let stmt = client.prepare_cached(sql).await?;
        let p = params(row);
        Ok(client.execute(&stmt, &refs(&p)).await?)
    }

    async fn copy_rows(&self, copy_sql: &str, rows: &[Vec<SqlValue>]) -> Result<u64> {
        let client = self.pool.get().await?;
        let sink = client.copy_in(copy_sql).await?;
        futures::pin_mut!(sink);

        let mut buf = BytesMut::with_capacity(1024 * 1024);
        for (i, row) in rows.iter().enumerate() {
            for (j, value) in row.iter().enumerate() {
                if j > 0 {
                    buf.put_u8(b'\t');
                }
                buf.extend_from_slice(copy_text(value).as_bytes());
            }
            buf.put_u8(b'\n');

            if (i + 1) % COPY_FLUSH_ROWS == 0 || i + 1 == rows.len() {
                sink.send(buf.split().freeze())
                    .await
                    .map_err(|e| MigrateError::load("copy", format!("COPY send failed: {}", e)))?;
            }
        }
        Ok(sink.finish().await?)
    }

    async fn query_count(&self, sql: &str) -> Result<i64> {
        let client = self.pool.get().await?;
        let row = client.query_one(sql, &[]).await?;
        Ok(row.try_get::<_, i64>(0)?)
    }

    async fn test_connection(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}
