//! SQL identifier validation and quoting.
//!
//! Identifiers (schemas, tables, columns) cannot be bound as statement
//! parameters, so every name that ends up literally inside generated SQL must
//! pass [`validate_sql_identifier`] first. The rules are deliberately narrow:
//!
//! 1. non-empty after trimming
//! 2. ASCII letters, digits and underscore only
//! 3. must not start with a digit
//! 4. must not be a reserved SQL keyword (case-insensitive)
//!
//! The quoting helpers re-validate, so a caller cannot produce quoted SQL from
//! an unchecked name.

use crate::error::{MigrateError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum identifier length (SQL Server allows 128, PostgreSQL truncates at 63).
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Keywords rejected as bare identifiers.
const RESERVED_KEYWORDS: &[&str] = &[
    "ADD", "ALL", "ALTER", "AND", "ANY", "AS", "ASC", "BEGIN", "BETWEEN", "BY", "CASCADE", "CASE",
    "CAST", "CHECK", "COLUMN", "COMMIT", "CONSTRAINT", "CREATE", "CROSS", "DATABASE", "DECLARE",
    "DEFAULT", "DELETE", "DESC", "DISTINCT", "DROP", "ELSE", "END", "EXCEPT", "EXEC", "EXECUTE",
    "EXISTS", "FETCH", "FOREIGN", "FROM", "FULL", "GRANT", "GROUP", "HAVING", "IN", "INDEX",
    "INNER", "INSERT", "INTERSECT", "INTO", "IS", "JOIN", "KEY", "LEFT", "LIKE", "LIMIT",
    "MATCHED", "MERGE", "NOT", "NULL", "OFFSET", "ON", "OR", "ORDER", "OUTER", "PRIMARY",
    "PROCEDURE", "REFERENCES", "REVOKE", "RIGHT", "ROLLBACK", "SCHEMA", "SELECT", "SET",
    "TABLE", "THEN", "TO", "TRANSACTION", "TRIGGER", "TRUNCATE", "UNION", "UNIQUE", "UPDATE",
    "USER", "USING", "VALUES", "VIEW", "WHEN", "WHERE", "WITH",
];

/// Where an identifier appears in generated SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierRole {
    Schema,
    Table,
    Column,
    KeyColumn,
}

impl fmt::Display for IdentifierRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IdentifierRole::Schema => "schema",
            IdentifierRole::Table => "table",
            IdentifierRole::Column => "column",
            IdentifierRole::KeyColumn => "key column",
        };
        f.write_str(s)
    }
}

fn reject(name: &str, role: IdentifierRole, reason: impl Into<String>) -> MigrateError {
    MigrateError::InvalidIdentifier {
        role,
        value: name.to_string(),
        reason: reason.into(),
    }
}

/// Check whether `name` is a reserved keyword, ignoring case.
pub fn is_reserved_keyword(name: &str) -> bool {
    RESERVED_KEYWORDS
        .iter()
        .any(|kw| kw.eq_ignore_ascii_case(name))
}

/// Validate a SQL identifier for the given role.
///
/// # Errors
///
/// Returns `MigrateError::InvalidIdentifier` naming the offending value and
/// its role.
pub fn validate_sql_identifier(name: &str, role: IdentifierRole) -> Result<()> {
    if name.trim().is_empty() {
        return Err(reject(name, role, "identifier cannot be empty"));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(reject(
            name,
            role,
            format!("exceeds maximum length of {} bytes", MAX_IDENTIFIER_LENGTH),
        ));
    }

    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
    {
        return Err(reject(
            name,
            role,
            format!("contains disallowed character {:?}", bad),
        ));
    }

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(reject(name, role, "must not start with a digit"));
    }

    if is_reserved_keyword(name) {
        return Err(reject(name, role, "is a reserved SQL keyword"));
    }

    Ok(())
}

/// Validate every name in `names` for the given role.
pub fn validate_all<S: AsRef<str>>(names: &[S], role: IdentifierRole) -> Result<()> {
    for name in names {
        validate_sql_identifier(name.as_ref(), role)?;
    }
    Ok(())
}

/// Quote a PostgreSQL identifier after validating it.
pub fn quote_pg(name: &str, role: IdentifierRole) -> Result<String> {
    validate_sql_identifier(name, role)?;
    Ok(format!("\"{}\"", name))
}

/// Quote a SQL Server identifier after validating it.
pub fn quote_mssql(name: &str, role: IdentifierRole) -> Result<String> {
    validate_sql_identifier(name, role)?;
    Ok(format!("[{}]", name))
}

/// Qualify a PostgreSQL table name with an optional schema.
pub fn qualify_pg(schema: Option<&str>, table: &str) -> Result<String> {
    let table = quote_pg(table, IdentifierRole::Table)?;
    match schema {
        Some(s) => Ok(format!("{}.{}", quote_pg(s, IdentifierRole::Schema)?, table)),
        None => Ok(table),
    }
}

/// Qualify a SQL Server table name with an optional schema.
pub fn qualify_mssql(schema: Option<&str>, table: &str) -> Result<String> {
    let table = quote_mssql(table, IdentifierRole::Table)?;
    match schema {
        Some(s) => Ok(format!(
            "{}.{}",
            quote_mssql(s, IdentifierRole::Schema)?,
            table
        )),
        None => Ok(table),
    }
}
