//! Staging area for batches passed between phases.
//!
//! Keys look like `<migration>/<phase>/<entity>`. Extraction appends to its
//! key, transformation reads that and writes its own, validation samples, and
//! loading reads in ranges. Cleanup removes everything under the migration id.

mod file;
mod memory;

pub use file::FileStaging;
pub use memory::MemoryStaging;

use async_trait::async_trait;

use crate::core::Record;
use crate::error::{MigrateError, Result};

#[async_trait]
pub trait StagingArea: Send + Sync {
    /// Append records to `key`, creating it if needed.
    async fn append(&self, key: &str, records: &[Record]) -> Result<()>;

    /// Up to `limit` records starting at `offset`, in append order.
    async fn read_range(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<Record>>;

    /// Number of records under `key` (0 if absent).
    async fn count(&self, key: &str) -> Result<usize>;

    /// Drop `key`. Missing keys are fine.
    async fn clear(&self, key: &str) -> Result<()>;

    /// Drop every key starting with `prefix`; returns how many were removed.
    async fn remove_prefix(&self, prefix: &str) -> Result<usize>;

    fn backend_type(&self) -> &'static str;

    /// First `limit` records.
    async fn sample(&self, key: &str, limit: usize) -> Result<Vec<Record>> {
        self.read_range(key, 0, limit).await
    }

    async fn read_all(&self, key: &str) -> Result<Vec<Record>> {
        self.read_range(key, 0, usize::MAX).await
    }
}

/// Reject keys that could escape a staging directory.
pub(crate) fn check_key(key: &str) -> Result<()> {
    let ok = !key.is_empty()
        && key.split('/').all(|part| {
            !part.is_empty()
                && part != "."
                && part != ".."
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });
    if ok {
        Ok(())
    } else {
        Err(MigrateError::State(format!("Invalid staging key '{}'", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_key() {
        assert!(check_key("0f8e-11/extraction/customers").is_ok());
        assert!(check_key("a/../b").is_err());
        assert!(check_key("a//b").is_err());
        assert!(check_key("").is_err());
        assert!(check_key("a/b c").is_err());
    }
}
