//! Process-local lease table.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::DistributedLock;
use crate::error::{MigrateError, Result};

struct Lease {
    holder: String,
    expires_at: Instant,
}

/// Lease lock for single-process deployments and tests.
#[derive(Default)]
pub struct InMemoryLeaseLock {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLeaseLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLeaseLock {
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> Result<bool> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|_| MigrateError::Lock("lease table poisoned".into()))?;
        let now = Instant::now();
        match leases.get(key) {
            Some(current) if current.holder != holder && current.expires_at > now => Ok(false),
            _ => {
                leases.insert(
                    key.to_string(),
                    Lease {
                        holder: holder.to_string(),
                        expires_at: now + lease,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, holder: &str) -> Result<()> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|_| MigrateError::Lock("lease table poisoned".into()))?;
        if leases.get(key).is_some_and(|l| l.holder == holder) {
            leases.remove(key);
        }
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_until_released() {
        let lock = InMemoryLeaseLock::new();
        let lease = Duration::from_secs(60);
        assert!(lock.try_acquire("m1", "a", lease).await.unwrap());
        assert!(!lock.try_acquire("m1", "b", lease).await.unwrap());
        assert!(lock.try_acquire("m2", "b", lease).await.unwrap());

        lock.release("m1", "a").await.unwrap();
        assert!(lock.try_acquire("m1", "b", lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_reentrant_for_same_holder() {
        let lock = InMemoryLeaseLock::new();
        let lease = Duration::from_secs(60);
        assert!(lock.try_acquire("m1", "a", lease).await.unwrap());
        assert!(lock.try_acquire("m1", "a", lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let lock = InMemoryLeaseLock::new();
        assert!(lock
            .try_acquire("m1", "a", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(lock
            .try_acquire("m1", "b", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_noop() {
        let lock = InMemoryLeaseLock::new();
        let lease = Duration::from_secs(60);
        assert!(lock.try_acquire("m1", "a", lease).await.unwrap());
        lock.release("m1", "b").await.unwrap();
        assert!(!lock.try_acquire("m1", "b", lease).await.unwrap());
    }
}
