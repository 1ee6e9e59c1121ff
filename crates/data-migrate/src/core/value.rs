//! Database-agnostic values and records.
//!
//! Every connector produces [`Record`]s of [`SqlValue`]s, the staging area
//! persists them, and the load engine binds them as statement parameters.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    Json(serde_json::Value),
}

/// One row keyed by column name.
pub type Record = BTreeMap<String, SqlValue>;

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Short type name used in validation messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "boolean",
            SqlValue::Int(_) => "integer",
            SqlValue::Float(_) => "float",
            SqlValue::Decimal(_) => "decimal",
            SqlValue::Text(_) => "text",
            SqlValue::Bytes(_) => "binary",
            SqlValue::Uuid(_) => "uuid",
            SqlValue::Timestamp(_) => "timestamp",
            SqlValue::TimestampTz(_) => "timestamptz",
            SqlValue::Date(_) => "date",
            SqlValue::Time(_) => "time",
            SqlValue::Json(_) => "json",
        }
    }

    /// Approximate in-memory/wire size, used for `bytes_processed`.
    pub fn estimated_size(&self) -> u64 {
        match self {
            SqlValue::Null => 1,
            SqlValue::Bool(_) => 1,
            SqlValue::Int(_) | SqlValue::Float(_) => 8,
            SqlValue::Decimal(_) | SqlValue::Uuid(_) => 16,
            SqlValue::Text(s) => s.len() as u64,
            SqlValue::Bytes(b) => b.len() as u64,
            SqlValue::Timestamp(_) | SqlValue::TimestampTz(_) => 8,
            SqlValue::Date(_) => 4,
            SqlValue::Time(_) => 8,
            SqlValue::Json(v) => v.to_string().len() as u64,
        }
    }

    /// Text rendering used for pattern checks and cross-type key matching.
    /// Returns `None` for NULL.
    pub fn as_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Text(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Numeric view for range constraints.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Int(n) => Some(*n as f64),
            SqlValue::Float(f) => Some(*f),
            SqlValue::Decimal(d) => d.to_string().parse().ok(),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Convert a JSON value coming from a file or HTTP source.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => SqlValue::Null,
            serde_json::Value::Bool(b) => SqlValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    SqlValue::Float(f)
                } else {
                    SqlValue::Text(n.to_string())
                }
            }
            serde_json::Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Json(other.clone()),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Bool(b) => write!(f, "{}", b),
            SqlValue::Int(n) => write!(f, "{}", n),
            SqlValue::Float(n) => write!(f, "{}", n),
            SqlValue::Decimal(d) => write!(f, "{}", d),
            SqlValue::Text(s) => f.write_str(s),
            SqlValue::Bytes(b) => write!(f, "\\x{}", hex::encode(b)),
            SqlValue::Uuid(u) => write!(f, "{}", u),
            SqlValue::Timestamp(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.6f")),
            SqlValue::TimestampTz(dt) => f.write_str(&dt.to_rfc3339()),
            SqlValue::Date(d) => write!(f, "{}", d),
            SqlValue::Time(t) => write!(f, "{}", t),
            SqlValue::Json(v) => write!(f, "{}", v),
        }
    }
}

/// Approximate size of a record.
pub fn record_size(record: &Record) -> u64 {
    record
        .iter()
        .map(|(k, v)| k.len() as u64 + v.estimated_size())
        .sum()
}

/// Build a record from a JSON object, optionally projecting to `columns`.
/// Projected columns missing from the object become NULL.
pub fn record_from_json(
    object: &serde_json::Map<String, serde_json::Value>,
    columns: &[String],
) -> Record {
    if columns.is_empty() {
        object
            .iter()
            .map(|(k, v)| (k.clone(), SqlValue::from_json(v)))
            .collect()
    } else {
        columns
            .iter()
            .map(|c| {
                let v = object.get(c).map(SqlValue::from_json).unwrap_or(SqlValue::Null);
                (c.clone(), v)
            })
            .collect()
    }
}

/// Lay out a record as a positional row in `columns` order.
pub fn record_to_row(record: &Record, columns: &[String]) -> Vec<SqlValue> {
    columns
        .iter()
        .map(|c| record.get(c).cloned().unwrap_or(SqlValue::Null))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_maps_scalars() {
        assert_eq!(SqlValue::from_json(&json!(null)), SqlValue::Null);
        assert_eq!(SqlValue::from_json(&json!(true)), SqlValue::Bool(true));
        assert_eq!(SqlValue::from_json(&json!(42)), SqlValue::Int(42));
        assert_eq!(SqlValue::from_json(&json!(1.5)), SqlValue::Float(1.5));
        assert_eq!(
            SqlValue::from_json(&json!("abc")),
            SqlValue::Text("abc".into())
        );
        assert!(matches!(
            SqlValue::from_json(&json!({"a": 1})),
            SqlValue::Json(_)
        ));
    }

    #[test]
    fn test_record_from_json_projection_fills_nulls() {
        let obj = json!({"id": 1, "email": "a@b.c", "ignored": true});
        let cols = vec!["id".to_string(), "email".to_string(), "phone".to_string()];
        let rec = record_from_json(obj.as_object().unwrap(), &cols);
        assert_eq!(rec.len(), 3);
        assert_eq!(rec["phone"], SqlValue::Null);
        assert!(!rec.contains_key("ignored"));
    }

    #[test]
    fn test_record_to_row_orders_columns() {
        let mut rec = Record::new();
        rec.insert("b".into(), SqlValue::Int(2));
        rec.insert("a".into(), SqlValue::Int(1));
        let row = record_to_row(&rec, &["b".to_string(), "a".to_string(), "c".to_string()]);
        assert_eq!(row, vec![SqlValue::Int(2), SqlValue::Int(1), SqlValue::Null]);
    }

    #[test]
    fn test_as_text_and_as_f64() {
        assert_eq!(SqlValue::Int(5).as_text().as_deref(), Some("5"));
        assert_eq!(SqlValue::Null.as_text(), None);
        assert_eq!(SqlValue::Text(" 2.5 ".into()).as_f64(), Some(2.5));
        assert_eq!(SqlValue::Bool(true).as_f64(), None);
    }

    #[test]
    fn test_staged_value_keeps_its_type() {
        let v = SqlValue::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        let json = serde_json::to_string(&v).unwrap();
        assert!(json.contains("\"type\":\"date\""));
        let back: SqlValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_record_size_counts_keys_and_values() {
        let mut rec = Record::new();
        rec.insert("id".into(), SqlValue::Int(1));
        rec.insert("name".into(), SqlValue::Text("abc".into()));
        assert_eq!(record_size(&rec), 2 + 8 + 4 + 3);
    }
}
