//! Migration state persistence.

mod backend;
mod db;
mod file;
mod memory;

pub use backend::{MigrationStore, Mutation, Transition};
pub use db::{PgStore, STATE_SCHEMA};
pub use file::FileStore;
pub use memory::MemoryStore;
