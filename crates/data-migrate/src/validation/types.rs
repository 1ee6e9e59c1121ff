//! Coarse type families for schema and data-type checks.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;

use crate::core::SqlValue;

/// What a declared column type or a sampled value can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    Boolean,
    Integer,
    Numeric,
    Text,
    Binary,
    Uuid,
    Date,
    Time,
    Timestamp,
    Json,
}

impl TypeFamily {
    /// Classify a declared type name from either dialect (`varchar(20)`,
    /// `bigint`, `datetime2`, `uniqueidentifier`...). `None` when unknown.
    pub fn from_declared(data_type: &str) -> Option<Self> {
        let lower = data_type.trim().to_lowercase();
        let base = lower.split('(').next().unwrap_or("").trim();
        let family = match base {
            "bit" | "bool" | "boolean" => TypeFamily::Boolean,

            "tinyint" | "smallint" | "int" | "integer" | "bigint" | "int2" | "int4" | "int8"
            | "serial" | "bigserial" => TypeFamily::Integer,

            "decimal" | "numeric" | "money" | "smallmoney" | "float" | "float4" | "float8"
            | "real" | "double" | "double precision" => TypeFamily::Numeric,

            "char" | "nchar" | "varchar" | "nvarchar" | "text" | "ntext" | "string"
            | "character varying" | "bpchar" | "citext" | "xml" => TypeFamily::Text,

            "binary" | "varbinary" | "image" | "bytea" | "blob" => TypeFamily::Binary,

            "uuid" | "uniqueidentifier" => TypeFamily::Uuid,

            "date" => TypeFamily::Date,
            "time" => TypeFamily::Time,
            "datetime" | "datetime2" | "smalldatetime" | "datetimeoffset" | "timestamp"
            | "timestamptz" | "timestamp with time zone" | "timestamp without time zone" => {
                TypeFamily::Timestamp
            }

            "json" | "jsonb" => TypeFamily::Json,
            _ => return None,
        };
        Some(family)
    }

    /// Family of a sampled value. NULL has none.
    pub fn of_value(value: &SqlValue) -> Option<Self> {
        Some(match value {
            SqlValue::Null => return None,
            SqlValue::Bool(_) => TypeFamily::Boolean,
            SqlValue::Int(_) => TypeFamily::Integer,
            SqlValue::Float(_) | SqlValue::Decimal(_) => TypeFamily::Numeric,
            SqlValue::Text(_) => TypeFamily::Text,
            SqlValue::Bytes(_) => TypeFamily::Binary,
            SqlValue::Uuid(_) => TypeFamily::Uuid,
            SqlValue::Date(_) => TypeFamily::Date,
            SqlValue::Time(_) => TypeFamily::Time,
            SqlValue::Timestamp(_) | SqlValue::TimestampTz(_) => TypeFamily::Timestamp,
            SqlValue::Json(_) => TypeFamily::Json,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TypeFamily::Boolean => "boolean",
            TypeFamily::Integer => "integer",
            TypeFamily::Numeric => "numeric",
            TypeFamily::Text => "text",
            TypeFamily::Binary => "binary",
            TypeFamily::Uuid => "uuid",
            TypeFamily::Date => "date",
            TypeFamily::Time => "time",
            TypeFamily::Timestamp => "timestamp",
            TypeFamily::Json => "json",
        }
    }

    /// Can a column of family `source` be loaded into one of family `self`?
    ///
    /// Text sources are accepted everywhere since the writers parse text
    /// into typed columns; [`TypeFamily::accepts_value`] checks the values.
    pub fn accepts_family(&self, source: TypeFamily) -> bool {
        use TypeFamily::*;
        *self == source
            || source == Text
            || matches!(
                (self, source),
                (Text, _)
                    | (Numeric, Integer)
                    | (Integer, Boolean)
                    | (Timestamp, Date)
                    | (Json, _)
            )
    }

    /// Would this sampled value load into a column of this family?
    pub fn accepts_value(&self, value: &SqlValue) -> bool {
        match value {
            SqlValue::Null => true,
            SqlValue::Text(s) => self.accepts_text(s),
            SqlValue::Float(f) if *self == TypeFamily::Integer => f.fract() == 0.0,
            SqlValue::Decimal(d) if *self == TypeFamily::Integer => d.fract().is_zero(),
            other => match TypeFamily::of_value(other) {
                Some(family) => self.accepts_family(family),
                None => true,
            },
        }
    }

    fn accepts_text(&self, s: &str) -> bool {
        let t = s.trim();
        match self {
            TypeFamily::Text | TypeFamily::Json => true,
            TypeFamily::Boolean => matches!(
                t.to_ascii_lowercase().as_str(),
                "t" | "true" | "1" | "y" | "yes" | "f" | "false" | "0" | "n" | "no"
            ),
            TypeFamily::Integer => t.parse::<i64>().is_ok(),
            TypeFamily::Numeric => t.parse::<Decimal>().is_ok() || t.parse::<f64>().is_ok(),
            TypeFamily::Binary => t
                .strip_prefix("\\x")
                .map_or(false, |h| hex::decode(h).is_ok()),
            TypeFamily::Uuid => t.parse::<uuid::Uuid>().is_ok(),
            TypeFamily::Date => t.parse::<NaiveDate>().is_ok(),
            TypeFamily::Time => t.parse::<NaiveTime>().is_ok(),
            TypeFamily::Timestamp => {
                t.parse::<NaiveDateTime>().is_ok()
                    || DateTime::parse_from_rfc3339(t).is_ok()
                    || t.parse::<NaiveDate>().is_ok()
            }
        }
    }
}
