//! Shared building blocks: identifier safety, values and run control.

pub mod control;
pub mod identifier;
pub mod value;

pub use control::{Control, ControlSignal};
pub use identifier::{
    is_reserved_keyword, qualify_mssql, qualify_pg, quote_mssql, quote_pg, validate_all,
    validate_sql_identifier, IdentifierRole,
};
pub use value::{record_from_json, record_size, record_to_row, Record, SqlValue};
