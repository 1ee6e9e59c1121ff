//! Load engine: writes row batches to a target table with one of five
//! strategies.
//!
//! Every table, column and key-column name is validated before any SQL is
//! built, and values are always bound as parameters.

mod mssql;
mod postgres;
pub mod sql;

pub use mssql::MssqlWriter;
pub use postgres::PgWriter;
pub use sql::Dialect;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::{validate_all, validate_sql_identifier, IdentifierRole, SqlValue};
use crate::error::{MigrateError, Result};
use crate::pool::{PoolHandle, PoolRegistry, PoolRole};

/// How a batch reaches the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadStrategy {
    /// One prepared INSERT per row inside a single transaction.
    #[default]
    Batch,
    /// COPY where the target supports it, otherwise BATCH.
    Bulk,
    /// Row-by-row with progress logging.
    Streaming,
    /// Contiguous sub-batches loaded concurrently with BATCH.
    Parallel,
    /// Insert-or-update on the key columns.
    Upsert,
}

impl LoadStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStrategy::Batch => "BATCH",
            LoadStrategy::Bulk => "BULK",
            LoadStrategy::Streaming => "STREAMING",
            LoadStrategy::Parallel => "PARALLEL",
            LoadStrategy::Upsert => "UPSERT",
        }
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One batch to load.
#[derive(Debug, Clone)]
pub struct LoadContext {
    pub batch_id: String,
    pub schema: Option<String>,
    pub table: String,
    pub columns: Vec<String>,
    pub key_columns: Vec<String>,
    pub strategy: LoadStrategy,
    /// Positional rows in `columns` order.
    pub rows: Vec<Vec<SqlValue>>,
    /// Propagate the first error instead of counting it.
    pub fail_fast: bool,
    /// Sub-batches for PARALLEL.
    pub parallelism: usize,
}

impl LoadContext {
    fn with_rows(&self, rows: Vec<Vec<SqlValue>>, strategy: LoadStrategy) -> Self {
        Self {
            batch_id: self.batch_id.clone(),
            schema: self.schema.clone(),
            table: self.table.clone(),
            columns: self.columns.clone(),
            key_columns: self.key_columns.clone(),
            strategy,
            rows,
            fail_fast: self.fail_fast,
            parallelism: 1,
        }
    }

    /// Check every name that will be spliced into SQL.
    pub fn validate_identifiers(&self) -> Result<()> {
        if let Some(schema) = &self.schema {
            validate_sql_identifier(schema, IdentifierRole::Schema)?;
        }
        validate_sql_identifier(&self.table, IdentifierRole::Table)?;
        validate_all(&self.columns, IdentifierRole::Column)?;
        validate_all(&self.key_columns, IdentifierRole::KeyColumn)
    }
}

/// Rows loaded and failed for one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadResult {
    pub loaded: u64,
    pub failed: u64,
    /// First error seen, if any.
    pub error: Option<String>,
}

impl LoadResult {
    pub fn loaded(n: u64) -> Self {
        Self {
            loaded: n,
            ..Default::default()
        }
    }

    pub fn failed(n: u64, error: impl Into<String>) -> Self {
        Self {
            loaded: 0,
            failed: n,
            error: Some(error.into()),
        }
    }

    pub fn merge(&mut self, other: LoadResult) {
        self.loaded += other.loaded;
        self.failed += other.failed;
        if self.error.is_none() {
            self.error = other.error;
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Database access used by the load engine and rollback.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Whether [`TargetWriter::copy_rows`] is available.
    fn supports_bulk(&self) -> bool;

    /// Execute `sql` once per row inside one transaction; all or nothing.
    async fn execute_batch(&self, sql: &str, rows: &[Vec<SqlValue>]) -> Result<u64>;

    /// Execute `sql` for a single row outside any explicit transaction.
    async fn execute_row(&self, sql: &str, row: &[SqlValue]) -> Result<u64>;

    /// Stream rows through a bulk path such as COPY.
    async fn copy_rows(&self, copy_sql: &str, rows: &[Vec<SqlValue>]) -> Result<u64>;

    /// Run a single-value `COUNT` query.
    async fn query_count(&self, sql: &str) -> Result<i64>;

    async fn test_connection(&self) -> Result<()>;
}

/// Writer backed by the load pool of a registered data source.
pub async fn writer_for(pools: &PoolRegistry, data_source: &str) -> Result<Arc<dyn TargetWriter>> {
    Ok(match pools.get(data_source, PoolRole::Load).await? {
        PoolHandle::Postgres(pool) => Arc::new(PgWriter::new(pool)),
        PoolHandle::Mssql(pool) => Arc::new(MssqlWriter::new(pool)),
    })
}

/// Applies load strategies through a [`TargetWriter`].
#[derive(Clone)]
pub struct LoadEngine {
    writer: Arc<dyn TargetWriter>,
    progress_interval: usize,
}

impl LoadEngine {
    pub fn new(writer: Arc<dyn TargetWriter>) -> Self {
        Self {
            writer,
            progress_interval: 10_000,
        }
    }

    /// Rows between STREAMING progress lines.
    pub fn with_progress_interval(mut self, rows: usize) -> Self {
        self.progress_interval = rows.max(1);
        self
    }

    pub fn writer(&self) -> &Arc<dyn TargetWriter> {
        &self.writer
    }

    /// Load one batch.
    ///
    /// Identifier errors always return `Err`. Database errors return `Err`
    /// under `fail_fast` and are otherwise counted in the result.
    pub async fn load_batch(&self, ctx: &LoadContext) -> Result<LoadResult> {
        ctx.validate_identifiers()?;
        if ctx.columns.is_empty() {
            return Err(MigrateError::load(&ctx.table, "no columns to load"));
        }
        if ctx.strategy == LoadStrategy::Upsert && ctx.key_columns.is_empty() {
            return Err(MigrateError::load(
                &ctx.table,
                "UPSERT requires at least one key column",
            ));
        }
        if ctx.rows.is_empty() {
            return Ok(LoadResult::default());
        }

        let result = match ctx.strategy {
            LoadStrategy::Batch => self.load_transactional(ctx, false).await?,
            LoadStrategy::Upsert => self.load_transactional(ctx, true).await?,
            LoadStrategy::Bulk => self.load_bulk(ctx).await?,
            LoadStrategy::Streaming => self.load_streaming(ctx).await?,
            LoadStrategy::Parallel => self.load_parallel(ctx).await?,
        };
        debug!(
            "Batch {} into {}: {} loaded, {} failed ({})",
            ctx.batch_id, ctx.table, result.loaded, result.failed, ctx.strategy
        );
        Ok(result)
    }

    fn absorb_failure(&self, ctx: &LoadContext, rows: u64, err: MigrateError) -> Result<LoadResult> {
        if ctx.fail_fast {
            return Err(err);
        }
        warn!("Batch {} into {} failed: {}", ctx.batch_id, ctx.table, err);
        Ok(LoadResult::failed(rows, err.to_string()))
    }

    async fn load_transactional(&self, ctx: &LoadContext, upsert: bool) -> Result<LoadResult> {
        let dialect = self.writer.dialect();
        let sql = if upsert {
            sql::upsert_sql(dialect, ctx.schema.as_deref(), &ctx.table, &ctx.columns, &ctx.key_columns)?
        } else {
            sql::insert_sql(dialect, ctx.schema.as_deref(), &ctx.table, &ctx.columns)?
        };
        let rows = ctx.rows.len() as u64;
        match self.writer.execute_batch(&sql, &ctx.rows).await {
            // UPSERT may report 0 for unchanged rows; every row was applied.
            Ok(_) => Ok(LoadResult::loaded(rows)),
            Err(e) => self.absorb_failure(ctx, rows, e),
        }
    }

    async fn load_bulk(&self, ctx: &LoadContext) -> Result<LoadResult> {
        if !self.writer.supports_bulk() {
            debug!("Target has no bulk path; loading {} with BATCH", ctx.table);
            return self.load_transactional(ctx, false).await;
        }
        let copy = sql::copy_sql(ctx.schema.as_deref(), &ctx.table, &ctx.columns)?;
        let rows = ctx.rows.len() as u64;
        match self.writer.copy_rows(&copy, &ctx.rows).await {
            Ok(_) => Ok(LoadResult::loaded(rows)),
            Err(e) => self.absorb_failure(ctx, rows, e),
        }
    }

    async fn load_streaming(&self, ctx: &LoadContext) -> Result<LoadResult> {
        let sql = sql::insert_sql(self.writer.dialect(), ctx.schema.as_deref(), &ctx.table, &ctx.columns)?;
        let total = ctx.rows.len();
        let mut result = LoadResult::default();
        for (idx, row) in ctx.rows.iter().enumerate() {
            match self.writer.execute_row(&sql, row).await {
                Ok(_) => result.loaded += 1,
                Err(e) if ctx.fail_fast => return Err(e),
                Err(e) => {
                    result.failed += 1;
                    if result.error.is_none() {
                        result.error = Some(format!("row {}: {}", idx, e));
                    }
                }
            }
            let done = idx + 1;
            if done % self.progress_interval == 0 || done == total {
                info!(
                    "Streaming {}: {}/{} rows ({} failed)",
                    ctx.table, done, total, result.failed
                );
            }
        }
        Ok(result)
    }

    async fn load_parallel(&self, ctx: &LoadContext) -> Result<LoadResult> {
        let parts = ctx.parallelism.max(1).min(ctx.rows.len());
        let chunk = ctx.rows.len().div_ceil(parts);
        let tasks = ctx
            .rows
            .chunks(chunk)
            .map(|rows| {
                let sub = ctx.with_rows(rows.to_vec(), LoadStrategy::Batch);
                async move { self.load_transactional(&sub, false).await }
            })
            .collect::<Vec<_>>();

        let mut total = LoadResult::default();
        for outcome in futures::future::join_all(tasks).await {
            total.merge(outcome?);
        }
        Ok(total)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// In-memory target that records every executed statement and row.
    ///
    /// Rows whose first value is listed in `poison` fail. Row counts per
    /// table are tracked for INSERT/COPY and DELETE statements.
    #[derive(Default)]
    pub struct RecordingWriter {
        pub statements: Mutex<Vec<String>>,
        pub rows: Mutex<Vec<Vec<SqlValue>>>,
        pub poison: Mutex<HashSet<String>>,
        pub counts: Mutex<std::collections::HashMap<String, i64>>,
        pub bulk: bool,
    }

    impl RecordingWriter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn poison(&self, first_value: &str) {
            self.poison.lock().unwrap().insert(first_value.to_string());
        }

        pub fn set_count(&self, table: &str, n: i64) {
            self.counts.lock().unwrap().insert(table.to_string(), n);
        }

        pub fn count(&self, table: &str) -> i64 {
            self.counts.lock().unwrap().get(table).copied().unwrap_or(0)
        }

        fn check(&self, row: &[SqlValue]) -> Result<()> {
            let first = row.first().map(|v| v.to_string()).unwrap_or_default();
            if self.poison.lock().unwrap().contains(&first) {
                return Err(MigrateError::load("test", format!("poisoned row {}", first)));
            }
            Ok(())
        }

        /// Table name as it appears in the statement, unquoted.
        fn table_of(sql: &str) -> String {
            let rest = sql
                .strip_prefix("COPY ")
                .or_else(|| sql.split_once(" INTO ").map(|(_, r)| r))
                .or_else(|| sql.split_once(" FROM ").map(|(_, r)| r))
                .unwrap_or("");
            let name = rest.split_whitespace().next().unwrap_or("");
            name.rsplit('.')
                .next()
                .unwrap_or("")
                .trim_matches(|c| c == '"' || c == '[' || c == ']')
                .to_string()
        }

        fn apply(&self, sql: &str, n: usize) {
            let table = Self::table_of(sql);
            let mut counts = self.counts.lock().unwrap();
            let entry = counts.entry(table).or_insert(0);
            if sql.starts_with("DELETE") {
                *entry -= n as i64;
            } else if sql.starts_with("INSERT") || sql.starts_with("COPY") {
                *entry += n as i64;
            }
        }
    }

    #[async_trait]
    impl TargetWriter for RecordingWriter {
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }

        fn supports_bulk(&self) -> bool {
            self.bulk
        }

        async fn execute_batch(&self, sql: &str, rows: &[Vec<SqlValue>]) -> Result<u64> {
            for row in rows {
                self.check(row)?;
            }
            self.statements.lock().unwrap().push(sql.to_string());
            self.rows.lock().unwrap().extend(rows.iter().cloned());
            self.apply(sql, rows.len());
            Ok(rows.len() as u64)
        }

        async fn execute_row(&self, sql: &str, row: &[SqlValue]) -> Result<u64> {
            self.check(row)?;
            self.statements.lock().unwrap().push(sql.to_string());
            self.rows.lock().unwrap().push(row.to_vec());
            self.apply(sql, 1);
            Ok(1)
        }

        async fn copy_rows(&self, copy_sql: &str, rows: &[Vec<SqlValue>]) -> Result<u64> {
            self.execute_batch(copy_sql, rows).await
        }

        async fn query_count(&self, sql: &str) -> Result<i64> {
            Ok(self.count(&Self::table_of(sql)))
        }

        async fn test_connection(&self) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingWriter;
    use super::*;

    fn rows(n: i64) -> Vec<Vec<SqlValue>> {
        (0..n)
            .map(|i| vec![SqlValue::Int(i), SqlValue::Text(format!("user{}", i))])
            .collect()
    }

    fn ctx(strategy: LoadStrategy, n: i64) -> LoadContext {
        LoadContext {
            batch_id: "b1".into(),
            schema: None,
            table: "customers".into(),
            columns: vec!["id".into(), "email".into()],
            key_columns: vec!["id".into()],
            strategy,
            rows: rows(n),
            fail_fast: false,
            parallelism: 3,
        }
    }

    #[tokio::test]
    async fn test_batch_and_parallel_totals_match() {
        for parallelism in [1, 2, 3, 7, 50] {
            let batch = LoadEngine::new(Arc::new(RecordingWriter::new()))
                .load_batch(&ctx(LoadStrategy::Batch, 20))
                .await
                .unwrap();
            let mut pctx = ctx(LoadStrategy::Parallel, 20);
            pctx.parallelism = parallelism;
            let writer = Arc::new(RecordingWriter::new());
            let parallel = LoadEngine::new(writer.clone()).load_batch(&pctx).await.unwrap();
            assert_eq!(batch.loaded, parallel.loaded);
            assert_eq!(batch.failed, parallel.failed);
            assert_eq!(writer.rows.lock().unwrap().len(), 20);
            assert_eq!(
                writer.statements.lock().unwrap().len(),
                parallelism.min(20)
            );
        }
    }

    #[tokio::test]
    async fn test_batch_failure_counts_whole_batch() {
        let writer = Arc::new(RecordingWriter::new());
        writer.poison("3");
        let result = LoadEngine::new(writer)
            .load_batch(&ctx(LoadStrategy::Batch, 5))
            .await
            .unwrap();
        assert_eq!(result.loaded, 0);
        assert_eq!(result.failed, 5);
        assert!(result.error.unwrap().contains("poisoned"));
    }

    #[tokio::test]
    async fn test_streaming_counts_row_failures() {
        let writer = Arc::new(RecordingWriter::new());
        writer.poison("1");
        writer.poison("4");
        let result = LoadEngine::new(writer)
            .with_progress_interval(2)
            .load_batch(&ctx(LoadStrategy::Streaming, 6))
            .await
            .unwrap();
        assert_eq!(result.loaded, 4);
        assert_eq!(result.failed, 2);
    }

    #[tokio::test]
    async fn test_streaming_fail_fast_propagates() {
        let writer = Arc::new(RecordingWriter::new());
        writer.poison("2");
        let mut c = ctx(LoadStrategy::Streaming, 6);
        c.fail_fast = true;
        assert!(LoadEngine::new(writer.clone()).load_batch(&c).await.is_err());
        assert_eq!(writer.rows.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_bulk_falls_back_to_batch() {
        let writer = Arc::new(RecordingWriter::new());
        LoadEngine::new(writer.clone())
            .load_batch(&ctx(LoadStrategy::Bulk, 3))
            .await
            .unwrap();
        assert!(writer.statements.lock().unwrap()[0].starts_with("INSERT"));

        let writer = Arc::new(RecordingWriter {
            bulk: true,
            ..Default::default()
        });
        LoadEngine::new(writer.clone())
            .load_batch(&ctx(LoadStrategy::Bulk, 3))
            .await
            .unwrap();
        assert!(writer.statements.lock().unwrap()[0].starts_with("COPY"));
    }

    #[tokio::test]
    async fn test_upsert_requires_key_columns() {
        let mut c = ctx(LoadStrategy::Upsert, 2);
        c.key_columns.clear();
        let err = LoadEngine::new(Arc::new(RecordingWriter::new()))
            .load_batch(&c)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Load { .. }));

        let writer = Arc::new(RecordingWriter::new());
        LoadEngine::new(writer.clone())
            .load_batch(&ctx(LoadStrategy::Upsert, 2))
            .await
            .unwrap();
        assert!(writer.statements.lock().unwrap()[0].contains("ON CONFLICT"));
    }

    #[tokio::test]
    async fn test_bad_identifiers_rejected_before_any_statement() {
        let writer = Arc::new(RecordingWriter::new());
        let engine = LoadEngine::new(writer.clone());
        for (table, column) in [
            ("customers; DROP TABLE customers", "id"),
            ("customers", "id--"),
            ("customers", "a/*b*/"),
            ("customers", "`id`"),
            ("customers", "[id]"),
            ("customers", "{id}"),
            ("SELECT", "id"),
            ("customers", "select"),
        ] {
            let mut c = ctx(LoadStrategy::Batch, 1);
            c.table = table.into();
            c.columns = vec![column.into(), "email".into()];
            let err = engine.load_batch(&c).await.unwrap_err();
            assert!(
                matches!(err, MigrateError::InvalidIdentifier { .. }),
                "{} / {}",
                table,
                column
            );
        }
        assert!(writer.statements.lock().unwrap().is_empty());
    }

    #[test]
    fn test_strategy_serde_names() {
        let s: LoadStrategy = serde_yaml::from_str("UPSERT").unwrap();
        assert_eq!(s, LoadStrategy::Upsert);
        assert_eq!(LoadStrategy::default(), LoadStrategy::Batch);
        assert_eq!(LoadStrategy::Parallel.to_string(), "PARALLEL");
    }
}
