//! Statement builders for each target dialect.
//!
//! Every builder validates the names it splices in; values only ever travel
//! as parameters.

use crate::core::{
    qualify_mssql, qualify_pg, quote_mssql, quote_pg, IdentifierRole, SqlValue,
};
use crate::error::{MigrateError, Result};

/// SQL flavour of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Mssql,
}

impl Dialect {
    pub fn quote(&self, name: &str, role: IdentifierRole) -> Result<String> {
        match self {
            Dialect::Postgres => quote_pg(name, role),
            Dialect::Mssql => quote_mssql(name, role),
        }
    }

    pub fn qualify(&self, schema: Option<&str>, table: &str) -> Result<String> {
        match self {
            Dialect::Postgres => qualify_pg(schema, table),
            Dialect::Mssql => qualify_mssql(schema, table),
        }
    }

    /// 1-based positional parameter.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", index),
            Dialect::Mssql => format!("@P{}", index),
        }
    }

    fn quote_all(&self, names: &[String], role: IdentifierRole) -> Result<Vec<String>> {
        names.iter().map(|n| self.quote(n, role)).collect()
    }
}

/// `INSERT INTO t (a, b) VALUES ($1, $2)`
pub fn insert_sql(dialect: Dialect, schema: Option<&str>, table: &str, columns: &[String]) -> Result<String> {
    let table = dialect.qualify(schema, table)?;
    let cols = dialect.quote_all(columns, IdentifierRole::Column)?;
    let params: Vec<String> = (1..=columns.len()).map(|i| dialect.placeholder(i)).collect();
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        cols.join(", "),
        params.join(", ")
    ))
}

/// Insert-or-update keyed on `key_columns`.
///
/// PostgreSQL uses `ON CONFLICT`; SQL Server uses `MERGE`. Tables whose
/// columns are all keys only insert missing rows.
pub fn upsert_sql(
    dialect: Dialect,
    schema: Option<&str>,
    table: &str,
    columns: &[String],
    key_columns: &[String],
) -> Result<String> {
    if key_columns.is_empty() {
        return Err(MigrateError::load(
            table,
            "UPSERT requires at least one key column",
        ));
    }
    let qualified = dialect.qualify(schema, table)?;
    let cols = dialect.quote_all(columns, IdentifierRole::Column)?;
    let keys = dialect.quote_all(key_columns, IdentifierRole::KeyColumn)?;
    if let Some(missing) = key_columns.iter().find(|k| !columns.contains(k)) {
        return Err(MigrateError::load(
            table,
            format!("key column {} is not among the loaded columns", missing),
        ));
    }
    let updates: Vec<&String> = columns
        .iter()
        .zip(&cols)
        .filter(|(raw, _)| !key_columns.contains(raw))
        .map(|(_, quoted)| quoted)
        .collect();

    match dialect {
        Dialect::Postgres => {
            let params: Vec<String> = (1..=columns.len()).map(|i| dialect.placeholder(i)).collect();
            let mut sql = format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO",
                qualified,
                cols.join(", "),
                params.join(", "),
                keys.join(", ")
            );
            if updates.is_empty() {
                sql.push_str(" NOTHING");
            } else {
                let set: Vec<String> = updates
                    .iter()
                    .map(|c| format!("{} = EXCLUDED.{}", c, c))
                    .collect();
                sql.push_str(&format!(" UPDATE SET {}", set.join(", ")));
            }
            Ok(sql)
        }
        Dialect::Mssql => {
            let source_cols: Vec<String> = cols
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{} AS {}", dialect.placeholder(i + 1), c))
                .collect();
            let on: Vec<String> = keys
                .iter()
                .map(|k| format!("tgt.{} = src.{}", k, k))
                .collect();
            let mut sql = format!(
                "MERGE INTO {} WITH (HOLDLOCK) AS tgt USING (SELECT {}) AS src ON {}",
                qualified,
                source_cols.join(", "),
                on.join(" AND ")
            );
            if !updates.is_empty() {
                let set: Vec<String> = updates
                    .iter()
                    .map(|c| format!("tgt.{} = src.{}", c, c))
                    .collect();
                sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {}", set.join(", ")));
            }
            let values: Vec<String> = cols.iter().map(|c| format!("src.{}", c)).collect();
            sql.push_str(&format!(
                " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({});",
                cols.join(", "),
                values.join(", ")
            ));
            Ok(sql)
        }
    }
}

/// `DELETE FROM t WHERE k1 = $1 AND k2 = $2`, run once per key tuple.
pub fn delete_by_key_sql(
    dialect: Dialect,
    schema: Option<&str>,
    table: &str,
    key_columns: &[String],
) -> Result<String> {
    if key_columns.is_empty() {
        return Err(MigrateError::load(table, "delete by key needs key columns"));
    }
    let table = dialect.qualify(schema, table)?;
    let predicates = key_columns
        .iter()
        .enumerate()
        .map(|(i, k)| {
            Ok(format!(
                "{} = {}",
                dialect.quote(k, IdentifierRole::KeyColumn)?,
                dialect.placeholder(i + 1)
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("DELETE FROM {} WHERE {}", table, predicates.join(" AND ")))
}

pub fn count_sql(dialect: Dialect, schema: Option<&str>, table: &str) -> Result<String> {
    let table = dialect.qualify(schema, table)?;
    Ok(match dialect {
        Dialect::Postgres => format!("SELECT COUNT(*)::BIGINT FROM {}", table),
        Dialect::Mssql => format!("SELECT COUNT_BIG(*) FROM {}", table),
    })
}

/// `COPY t (a, b) FROM STDIN WITH (FORMAT text)` (PostgreSQL only).
pub fn copy_sql(schema: Option<&str>, table: &str, columns: &[String]) -> Result<String> {
    let table = qualify_pg(schema, table)?;
    let cols = Dialect::Postgres.quote_all(columns, IdentifierRole::Column)?;
    Ok(format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
        table,
        cols.join(", ")
    ))
}

/// Render a value for the COPY text format.
pub fn copy_text(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "\\N".to_string(),
        SqlValue::Bool(b) => if *b { "t" } else { "f" }.to_string(),
        SqlValue::Bytes(b) => format!("\\\\x{}", hex::encode(b)),
        SqlValue::Text(s) => escape_copy_text(s),
        SqlValue::Json(v) => escape_copy_text(&v.to_string()),
        other => escape_copy_text(&other.to_string()),
    }
}

/// Escape backslash, tab, newline and carriage return for COPY.
fn escape_copy_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_insert_sql() {
        let sql = insert_sql(Dialect::Postgres, Some("crm"), "customers", &cols(&["id", "email"])).unwrap();
        assert_eq!(
            sql,
            r#"INSERT INTO "crm"."customers" ("id", "email") VALUES ($1, $2)"#
        );
        let sql = insert_sql(Dialect::Mssql, None, "customers", &cols(&["id"])).unwrap();
        assert_eq!(sql, "INSERT INTO [customers] ([id]) VALUES (@P1)");
    }

    #[test]
    fn test_pg_upsert() {
        let sql = upsert_sql(
            Dialect::Postgres,
            None,
            "customers",
            &cols(&["id", "email", "name"]),
            &cols(&["id"]),
        )
        .unwrap();
        assert_eq!(
            sql,
            r#"INSERT INTO "customers" ("id", "email", "name") VALUES ($1, $2, $3) ON CONFLICT ("id") DO UPDATE SET "email" = EXCLUDED."email", "name" = EXCLUDED."name""#
        );
    }

    #[test]
    fn test_pg_upsert_keys_only_does_nothing() {
        let sql = upsert_sql(Dialect::Postgres, None, "tags", &cols(&["id"]), &cols(&["id"])).unwrap();
        assert!(sql.ends_with("ON CONFLICT (\"id\") DO NOTHING"));
    }

    #[test]
    fn test_mssql_merge() {
        let sql = upsert_sql(
            Dialect::Mssql,
            Some("dbo"),
            "customers",
            &cols(&["id", "email"]),
            &cols(&["id"]),
        )
        .unwrap();
        assert_eq!(
            sql,
            "MERGE INTO [dbo].[customers] WITH (HOLDLOCK) AS tgt USING (SELECT @P1 AS [id], @P2 AS [email]) AS src \
             ON tgt.[id] = src.[id] WHEN MATCHED THEN UPDATE SET tgt.[email] = src.[email] \
             WHEN NOT MATCHED THEN INSERT ([id], [email]) VALUES (src.[id], src.[email]);"
        );
    }

    #[test]
    fn test_upsert_requires_keys() {
        assert!(upsert_sql(Dialect::Postgres, None, "t", &cols(&["a"]), &[]).is_err());
        assert!(upsert_sql(Dialect::Postgres, None, "t", &cols(&["a"]), &cols(&["b"])).is_err());
    }

    #[test]
    fn test_bad_key_column_named_in_error() {
        let err = upsert_sql(Dialect::Postgres, None, "t", &cols(&["a"]), &cols(&["a--"])).unwrap_err();
        match err {
            MigrateError::InvalidIdentifier { role, value, .. } => {
                assert_eq!(role, IdentifierRole::KeyColumn);
                assert_eq!(value, "a--");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_delete_and_count() {
        let sql = delete_by_key_sql(Dialect::Postgres, None, "orders", &cols(&["region", "id"])).unwrap();
        assert_eq!(sql, r#"DELETE FROM "orders" WHERE "region" = $1 AND "id" = $2"#);
        assert_eq!(
            count_sql(Dialect::Mssql, Some("dbo"), "orders").unwrap(),
            "SELECT COUNT_BIG(*) FROM [dbo].[orders]"
        );
    }

    #[test]
    fn test_copy_text_escaping() {
        assert_eq!(copy_text(&SqlValue::Null), "\\N");
        assert_eq!(copy_text(&SqlValue::Text("a\tb\\c\n".into())), "a\\tb\\\\c\\n");
        assert_eq!(copy_text(&SqlValue::Bytes(vec![0xde, 0xad])), "\\\\xdead");
        assert_eq!(copy_text(&SqlValue::Bool(false)), "f");
    }
}
