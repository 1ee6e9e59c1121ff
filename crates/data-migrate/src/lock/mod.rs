//! Cluster-wide, lease-based mutual exclusion for migration execution.
//!
//! A lock is identified by a key and owned by a holder. Acquisition succeeds
//! when the key is free, its lease has expired, or the caller already holds
//! it (which renews the lease). Every `execute`/`resume` call uses a fresh
//! holder id, so concurrent callers race for the same key and exactly one wins.

mod db;
mod memory;

pub use db::PgLeaseLock;
pub use memory::InMemoryLeaseLock;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{MigrateError, Result};

/// Interval between attempts while waiting for a lock.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try once. Returns true when `holder` now owns `key` for `lease`.
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> Result<bool>;

    /// Release `key` if `holder` owns it. Releasing a lock you don't hold is a no-op.
    async fn release(&self, key: &str, holder: &str) -> Result<()>;

    fn backend_type(&self) -> &'static str;
}

/// Poll `try_acquire` until it succeeds or `timeout` elapses.
/// A zero timeout makes exactly one attempt.
pub async fn acquire_with_timeout(
    lock: &dyn DistributedLock,
    key: &str,
    holder: &str,
    lease: Duration,
    timeout: Duration,
) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if lock.try_acquire(key, holder, lease).await? {
            return Ok(true);
        }
        if Instant::now() + POLL_INTERVAL > deadline {
            return Ok(false);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Lock key for a migration.
pub fn migration_lock_key(id: Uuid) -> String {
    format!("migration:{}", id)
}

/// A held execution lock for one migration.
///
/// Created by a successful acquisition and moved into the task that runs the
/// phases. The task renews it at every phase and batch boundary and releases
/// it when done.
pub struct ExecutionLease {
    lock: Arc<dyn DistributedLock>,
    key: String,
    holder: String,
    lease: Duration,
}

impl ExecutionLease {
    /// Acquire the lock for `migration_id` under a fresh holder id.
    /// Contention is reported as `AlreadyExecuting`.
    pub async fn acquire(
        lock: Arc<dyn DistributedLock>,
        migration_id: Uuid,
        lease: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let key = migration_lock_key(migration_id);
        let holder = Uuid::new_v4().to_string();
        if !acquire_with_timeout(lock.as_ref(), &key, &holder, lease, timeout).await? {
            return Err(MigrateError::AlreadyExecuting(migration_id));
        }
        debug!("Acquired {} lock {} as {}", lock.backend_type(), key, holder);
        Ok(Self {
            lock,
            key,
            holder,
            lease,
        })
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Extend the lease. Fails with `Lock` if the lease was lost to another holder.
    pub async fn renew(&self) -> Result<()> {
        if self.lock.try_acquire(&self.key, &self.holder, self.lease).await? {
            Ok(())
        } else {
            Err(MigrateError::Lock(format!(
                "lease on {} expired and was taken by another holder",
                self.key
            )))
        }
    }

    /// Release the lock. Failures are logged; the lease expires on its own.
    pub async fn release(self) {
        if let Err(e) = self.lock.release(&self.key, &self.holder).await {
            warn!("Failed to release lock {}: {}", self.key, e);
        } else {
            debug!("Released lock {}", self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_with_timeout_waits_for_release() {
        let lock = Arc::new(InMemoryLeaseLock::new());
        assert!(lock.try_acquire("k", "a", Duration::from_secs(60)).await.unwrap());

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                acquire_with_timeout(
                    lock.as_ref(),
                    "k",
                    "b",
                    Duration::from_secs(60),
                    Duration::from_secs(5),
                )
                .await
                .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(120)).await;
        lock.release("k", "a").await.unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_timeout_tries_once() {
        let lock = InMemoryLeaseLock::new();
        assert!(lock.try_acquire("k", "a", Duration::from_secs(60)).await.unwrap());
        let got = acquire_with_timeout(&lock, "k", "b", Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();
        assert!(!got);
    }

    #[tokio::test]
    async fn test_execution_lease_contention_is_already_executing() {
        let lock: Arc<dyn DistributedLock> = Arc::new(InMemoryLeaseLock::new());
        let id = Uuid::new_v4();
        let first = ExecutionLease::acquire(lock.clone(), id, Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();
        let second = ExecutionLease::acquire(lock.clone(), id, Duration::from_secs(60), Duration::ZERO).await;
        assert!(matches!(second, Err(MigrateError::AlreadyExecuting(x)) if x == id));

        first.renew().await.unwrap();
        first.release().await;
        assert!(
            ExecutionLease::acquire(lock, id, Duration::from_secs(60), Duration::ZERO)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_concurrent_acquires_have_one_winner() {
        let lock: Arc<dyn DistributedLock> = Arc::new(InMemoryLeaseLock::new());
        let id = Uuid::new_v4();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let lock = lock.clone();
            handles.push(tokio::spawn(async move {
                ExecutionLease::acquire(lock, id, Duration::from_secs(60), Duration::ZERO).await
            }));
        }
        let mut ok = 0;
        let mut contended = 0;
        let mut leases = Vec::new();
        for h in handles {
            match h.await.unwrap() {
                Ok(lease) => {
                    ok += 1;
                    leases.push(lease);
                }
                Err(e) if e.is_lock_contention() => contended += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(contended, 9);
    }
}
