//! In-memory staging.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{check_key, StagingArea};
use crate::core::Record;
use crate::error::Result;

#[derive(Default)]
pub struct MemoryStaging {
    sets: RwLock<HashMap<String, Vec<Record>>>,
}

impl MemoryStaging {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StagingArea for MemoryStaging {
    async fn append(&self, key: &str, records: &[Record]) -> Result<()> {
        check_key(key)?;
        self.sets
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .extend_from_slice(records);
        Ok(())
    }

    async fn read_range(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<Record>> {
        let sets = self.sets.read().await;
        Ok(sets
            .get(key)
            .map(|records| records.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn count(&self, key: &str) -> Result<usize> {
        Ok(self.sets.read().await.get(key).map(Vec::len).unwrap_or(0))
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.sets.write().await.remove(key);
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize> {
        let mut sets = self.sets.write().await;
        let before = sets.len();
        sets.retain(|k, _| !k.starts_with(prefix));
        Ok(before - sets.len())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlValue;

    fn rec(n: i64) -> Record {
        Record::from([("id".to_string(), SqlValue::Int(n))])
    }

    #[tokio::test]
    async fn test_append_and_range() {
        let staging = MemoryStaging::new();
        staging.append("m/extraction/a", &[rec(1), rec(2)]).await.unwrap();
        staging.append("m/extraction/a", &[rec(3)]).await.unwrap();

        assert_eq!(staging.count("m/extraction/a").await.unwrap(), 3);
        let range = staging.read_range("m/extraction/a", 1, 5).await.unwrap();
        assert_eq!(range, vec![rec(2), rec(3)]);
        assert_eq!(staging.sample("m/extraction/a", 1).await.unwrap(), vec![rec(1)]);
        assert!(staging.read_all("m/extraction/missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_prefix() {
        let staging = MemoryStaging::new();
        staging.append("m1/extraction/a", &[rec(1)]).await.unwrap();
        staging.append("m1/transformation/a", &[rec(1)]).await.unwrap();
        staging.append("m2/extraction/a", &[rec(1)]).await.unwrap();

        assert_eq!(staging.remove_prefix("m1/").await.unwrap(), 2);
        assert_eq!(staging.count("m2/extraction/a").await.unwrap(), 1);
    }
}
