//! In-memory migration store.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::backend::{apply_mutation, MigrationStore, Mutation, Transition};
use crate::error::{MigrateError, Result};
use crate::migration::{Migration, MigrationStatus};

/// Process-local store. Everything is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    migrations: RwLock<HashMap<Uuid, Migration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of every stored migration, in no particular order.
    pub async fn ids(&self) -> Vec<Uuid> {
        self.migrations.read().await.keys().copied().collect()
    }
}

#[async_trait]
impl MigrationStore for MemoryStore {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn save(&self, migration: &Migration) -> Result<()> {
        self.migrations
            .write()
            .await
            .insert(migration.id, migration.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Migration>> {
        Ok(self.migrations.read().await.get(&id).cloned())
    }

    async fn project_code_exists(&self, code: &str) -> Result<bool> {
        Ok(self
            .migrations
            .read()
            .await
            .values()
            .any(|m| m.project_code == code))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.migrations.write().await.remove(&id).is_some())
    }

    async fn update_if_status(
        &self,
        id: Uuid,
        expected: &[MigrationStatus],
        apply: Mutation<'_>,
    ) -> Result<Transition> {
        let mut guard = self.migrations.write().await;
        let migration = guard.get_mut(&id).ok_or(MigrateError::NotFound(id))?;
        match apply_mutation(migration, expected, apply) {
            Some(actual) => Ok(Transition::Rejected(actual)),
            None => Ok(Transition::Applied(Box::new(migration.clone()))),
        }
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::fixtures;

    #[tokio::test]
    async fn test_save_and_find() {
        let store = MemoryStore::new();
        let m = fixtures::migration();
        store.save(&m).await.unwrap();
        let found = store.find_by_id(m.id).await.unwrap().unwrap();
        assert_eq!(found.project_code, m.project_code);
        assert!(store.project_code_exists(&m.project_code).await.unwrap());
        assert!(!store.project_code_exists("MIG-19990101-00000").await.unwrap());
        assert_eq!(store.ids().await, vec![m.id]);
    }

    #[tokio::test]
    async fn test_transition_compare_and_set() {
        let store = MemoryStore::new();
        let m = fixtures::migration();
        store.save(&m).await.unwrap();

        let applied = store
            .transition(m.id, &[MigrationStatus::Initialized], MigrationStatus::InProgress)
            .await
            .unwrap();
        assert!(applied.is_applied());

        let rejected = store
            .transition(m.id, &[MigrationStatus::Initialized], MigrationStatus::InProgress)
            .await
            .unwrap();
        assert!(matches!(
            rejected,
            Transition::Rejected(MigrationStatus::InProgress)
        ));
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .transition(
                Uuid::new_v4(),
                &[MigrationStatus::Initialized],
                MigrationStatus::InProgress,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_transitions_have_one_winner() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut m = fixtures::migration();
        m.status = MigrationStatus::Paused;
        store.save(&m).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = m.id;
            handles.push(tokio::spawn(async move {
                store
                    .transition(id, &[MigrationStatus::Paused], MigrationStatus::InProgress)
                    .await
                    .unwrap()
                    .is_applied()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        let m = fixtures::migration();
        store.save(&m).await.unwrap();
        assert!(store.delete(m.id).await.unwrap());
        assert!(!store.delete(m.id).await.unwrap());
        assert!(store.find_by_id(m.id).await.unwrap().is_none());
    }
}
