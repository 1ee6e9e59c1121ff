//! File-based migration store with integrity signatures.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::backend::{apply_mutation, MigrationStore, Mutation, Transition};
use crate::error::{MigrateError, Result};
use crate::migration::{Migration, MigrationStatus};

type HmacSha256 = Hmac<Sha256>;

/// On-disk envelope: the migration plus its signature.
#[derive(Serialize, Deserialize)]
struct SignedMigration {
    migration: Migration,
    /// HMAC-SHA256 over the serialized migration, hex encoded.
    hmac: String,
}

/// Stores each migration as `<dir>/<id>.json`.
///
/// Writes go to a temp file and are renamed into place. Every file carries an
/// HMAC-SHA256 computed with the store key; a mismatch on load is an error.
/// Conditional updates are serialized within the process only.
pub struct FileStore {
    dir: PathBuf,
    key: Vec<u8>,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>, key: impl AsRef<[u8]>) -> Self {
        Self {
            dir: dir.into(),
            key: key.as_ref().to_vec(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn sign(&self, migration: &Migration) -> Result<String> {
        let content = serde_json::to_string(migration)?;
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn read(&self, path: &Path) -> Result<Option<Migration>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let signed: SignedMigration = serde_json::from_str(&content)?;
        if self.sign(&signed.migration)? != signed.hmac {
            return Err(MigrateError::State(format!(
                "State file {} failed integrity check: HMAC mismatch",
                path.display()
            )));
        }
        Ok(Some(signed.migration))
    }

    async fn write(&self, migration: &Migration) -> Result<()> {
        let signed = SignedMigration {
            hmac: self.sign(migration)?,
            migration: migration.clone(),
        };
        let content = serde_json::to_string_pretty(&signed)?;

        let path = self.path_for(migration.id);
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &content).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl MigrationStore for FileStore {
    async fn init_schema(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn save(&self, migration: &Migration) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write(migration).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Migration>> {
        self.read(&self.path_for(id)).await
    }

    async fn project_code_exists(&self, code: &str) -> Result<bool> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read(&path).await {
                Ok(Some(m)) if m.project_code == code => return Ok(true),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable state file {}: {}", path.display(), e),
            }
        }
        Ok(false)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_if_status(
        &self,
        id: Uuid,
        expected: &[MigrationStatus],
        apply: Mutation<'_>,
    ) -> Result<Transition> {
        let _guard = self.write_lock.lock().await;
        let mut migration = self
            .read(&self.path_for(id))
            .await?
            .ok_or(MigrateError::NotFound(id))?;
        if let Some(actual) = apply_mutation(&mut migration, expected, apply) {
            return Ok(Transition::Rejected(actual));
        }
        self.write(&migration).await?;
        Ok(Transition::Applied(Box::new(migration)))
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::fixtures;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> FileStore {
        let store = FileStore::new(dir.path().join("state"), "secret");
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let m = fixtures::migration();
        store.save(&m).await.unwrap();

        let loaded = store.find_by_id(m.id).await.unwrap().unwrap();
        assert_eq!(loaded, m);
        assert!(store.project_code_exists(&m.project_code).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        assert!(store.find_by_id(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tampered_file_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let m = fixtures::migration();
        store.save(&m).await.unwrap();

        let path = store.path_for(m.id);
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("\"INITIALIZED\"", "\"COMPLETED\"")).unwrap();

        let err = store.find_by_id(m.id).await.unwrap_err();
        assert!(matches!(err, MigrateError::State(_)));
    }

    #[tokio::test]
    async fn test_different_key_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let m = fixtures::migration();
        store.save(&m).await.unwrap();

        let other = FileStore::new(dir.path().join("state"), "other-key");
        assert!(other.find_by_id(m.id).await.is_err());
    }

    #[tokio::test]
    async fn test_conditional_update_persists() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let m = fixtures::migration();
        store.save(&m).await.unwrap();

        store
            .update_if_status(m.id, &[MigrationStatus::Initialized], &|m: &mut Migration| {
                m.status = MigrationStatus::InProgress;
                m.metrics.extracted_records = 42;
            })
            .await
            .unwrap();

        let loaded = store.find_by_id(m.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, MigrationStatus::InProgress);
        assert_eq!(loaded.metrics.extracted_records, 42);

        let rejected = store
            .transition(m.id, &[MigrationStatus::Paused], MigrationStatus::InProgress)
            .await
            .unwrap();
        assert!(!rejected.is_applied());
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let m = fixtures::migration();
        store.save(&m).await.unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("state"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
