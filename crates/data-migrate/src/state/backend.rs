//! Persistence trait for migration aggregates.
//!
//! The orchestrator works with `Arc<dyn MigrationStore>` and never knows
//! which backend it talks to:
//!
//! - **Memory**: [`MemoryStore`](super::MemoryStore), process-local
//! - **File**: [`FileStore`](super::FileStore), one HMAC-signed JSON file per migration
//! - **PostgreSQL**: [`PgStore`](super::PgStore), JSONB document with a status column

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::Result;
use crate::migration::{Migration, MigrationStatus};

/// Mutation applied to a migration inside a conditional update.
pub type Mutation<'a> = &'a (dyn Fn(&mut Migration) + Send + Sync);

/// Outcome of a conditional update.
#[derive(Debug, Clone)]
pub enum Transition {
    /// The status matched; the stored migration after the update.
    Applied(Box<Migration>),
    /// The status did not match; nothing was written.
    Rejected(MigrationStatus),
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// Storage for migration aggregates.
///
/// `update_if_status` is the only way phase code changes a stored migration,
/// so every write is a compare-and-set against the status the writer expects.
/// A pause or cancel issued elsewhere makes that write come back `Rejected`.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Create tables/directories. Idempotent.
    async fn init_schema(&self) -> Result<()>;

    /// Insert or overwrite unconditionally.
    async fn save(&self, migration: &Migration) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Migration>>;

    async fn project_code_exists(&self, code: &str) -> Result<bool>;

    /// Returns true if a migration was removed.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Apply `apply` atomically iff the stored status is one of `expected`.
    /// Fails with `NotFound` when the migration does not exist.
    async fn update_if_status(
        &self,
        id: Uuid,
        expected: &[MigrationStatus],
        apply: Mutation<'_>,
    ) -> Result<Transition>;

    /// Atomic status compare-and-set.
    async fn transition(
        &self,
        id: Uuid,
        expected: &[MigrationStatus],
        to: MigrationStatus,
    ) -> Result<Transition> {
        self.update_if_status(id, expected, &move |m: &mut Migration| m.status = to)
            .await
    }

    /// Overwrite the whole document iff the stored status is one of `expected`.
    async fn save_if_status(
        &self,
        migration: &Migration,
        expected: &[MigrationStatus],
    ) -> Result<Transition> {
        let replacement = migration.clone();
        self.update_if_status(migration.id, expected, &move |m: &mut Migration| {
            *m = replacement.clone()
        })
        .await
    }

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}

/// Shared tail of every backend's conditional update.
pub(crate) fn apply_mutation(
    migration: &mut Migration,
    expected: &[MigrationStatus],
    apply: Mutation<'_>,
) -> Option<MigrationStatus> {
    if !expected.contains(&migration.status) {
        return Some(migration.status);
    }
    apply(migration);
    migration.updated_at = Utc::now();
    None
}
