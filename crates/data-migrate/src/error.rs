//! Error types for the migration engine.

use crate::core::IdentifierRole;
use crate::migration::{MigrationPhase, MigrationStatus};
use thiserror::Error;
use uuid::Uuid;

/// Exit code for configuration and request errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for connection and pool errors.
pub const EXIT_CONNECTION_ERROR: u8 = 2;
/// Exit code for extraction and load failures.
pub const EXIT_TRANSFER_ERROR: u8 = 3;
/// Exit code for validation and verification failures.
pub const EXIT_VALIDATION_ERROR: u8 = 4;
/// Exit code for state machine, lock and persistence errors.
pub const EXIT_STATE_ERROR: u8 = 5;
/// Exit code for a cancelled or paused run.
pub const EXIT_INTERRUPTED: u8 = 6;
/// Exit code for file system errors.
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A migration request failed validation.
    #[error("Invalid migration request: {0}")]
    InvalidRequest(String),

    /// A SQL identifier failed validation before any statement was built.
    #[error("Invalid {role} identifier {value:?}: {reason}")]
    InvalidIdentifier {
        role: IdentifierRole,
        value: String,
        reason: String,
    },

    /// Operation is not legal in the migration's current status.
    #[error("Cannot {operation} migration {id} in status {status}")]
    InvalidState {
        id: Uuid,
        status: MigrationStatus,
        operation: &'static str,
    },

    /// No migration with the given id exists.
    #[error("Migration {0} not found")]
    NotFound(Uuid),

    /// Another execution already holds the lock for this migration.
    #[error("Migration {0} is already being executed by another worker")]
    AlreadyExecuting(Uuid),

    /// Lock backend failure (not contention).
    #[error("Lock error: {0}")]
    Lock(String),

    /// The orchestration pool queue is full.
    #[error("Orchestration queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// SQL Server error
    #[error("SQL Server error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// PostgreSQL error
    #[error("PostgreSQL error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// HTTP source error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Extraction failed for an entity
    #[error("Extraction failed for {entity}: {message}")]
    Extraction { entity: String, message: String },

    /// Load failed for a specific table
    #[error("Load failed for table {table}: {message}")]
    Load { table: String, message: String },

    /// Validation reported failure under strict validation.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Post-load verification found a mismatch.
    #[error("Verification failed: {0}")]
    Verification(String),

    /// A phase failed for a reason not covered by a more specific variant.
    #[error("Phase {phase} failed: {message}")]
    Phase {
        phase: MigrationPhase,
        message: String,
    },

    /// State persistence error
    #[error("State error: {0}")]
    State(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Work stopped at a checkpoint because the migration was paused.
    #[error("Migration paused")]
    Paused,

    /// Work stopped at a checkpoint because the migration was cancelled.
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Load error
    pub fn load(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Load {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create an Extraction error
    pub fn extraction(entity: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Extraction {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Create an InvalidState error
    pub fn invalid_state(id: Uuid, status: MigrationStatus, operation: &'static str) -> Self {
        MigrateError::InvalidState {
            id,
            status,
            operation,
        }
    }

    /// True when the error means another holder owns the execution lock.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, MigrateError::AlreadyExecuting(_))
    }

    /// True for cooperative stops at a batch or phase checkpoint.
    pub fn is_interruption(&self) -> bool {
        matches!(self, MigrateError::Paused | MigrateError::Cancelled)
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_)
            | MigrateError::InvalidRequest(_)
            | MigrateError::InvalidIdentifier { .. }
            | MigrateError::Yaml(_) => EXIT_CONFIG_ERROR,
            MigrateError::Source(_)
            | MigrateError::Target(_)
            | MigrateError::Http(_)
            | MigrateError::Pool { .. } => EXIT_CONNECTION_ERROR,
            MigrateError::Extraction { .. }
            | MigrateError::Load { .. }
            | MigrateError::Phase { .. } => EXIT_TRANSFER_ERROR,
            MigrateError::ValidationFailed(_) | MigrateError::Verification(_) => {
                EXIT_VALIDATION_ERROR
            }
            MigrateError::InvalidState { .. }
            | MigrateError::NotFound(_)
            | MigrateError::AlreadyExecuting(_)
            | MigrateError::Lock(_)
            | MigrateError::QueueFull { .. }
            | MigrateError::State(_)
            | MigrateError::Json(_) => EXIT_STATE_ERROR,
            MigrateError::Paused | MigrateError::Cancelled => EXIT_INTERRUPTED,
            MigrateError::Io(_) => EXIT_IO_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

impl From<deadpool_postgres::PoolError> for MigrateError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        MigrateError::pool(e.to_string(), "postgres checkout")
    }
}

impl From<bb8::RunError<tiberius::error::Error>> for MigrateError {
    fn from(e: bb8::RunError<tiberius::error::Error>) -> Self {
        match e {
            bb8::RunError::User(inner) => MigrateError::Source(inner),
            bb8::RunError::TimedOut => {
                MigrateError::pool("timed out waiting for connection", "sql server checkout")
            }
        }
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
