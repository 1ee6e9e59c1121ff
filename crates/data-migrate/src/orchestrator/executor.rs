//! Bounded pool that runs migrations as tokio tasks.
//!
//! At most `max_pool_size` migrations run at once; up to `queue_capacity`
//! more wait for a slot. A submission beyond that is refused with
//! `QueueFull` before any state is touched.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::error::{MigrateError, Result};

/// A reserved place in the pool, taken before a migration changes status.
pub(crate) enum Slot {
    Running(OwnedSemaphorePermit),
    Queued(QueueTicket),
}

/// Holds one queue position until dropped.
pub(crate) struct QueueTicket {
    queued: Arc<AtomicUsize>,
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct TaskPool {
    permits: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    max_running: usize,
    queue_capacity: usize,
    tracker: TaskTracker,
}

impl TaskPool {
    pub fn new(config: &ExecutorConfig) -> Self {
        let max_running = config.get_max_pool_size();
        debug!(
            "Orchestration pool: {} core, {} max, queue {}",
            config.get_core_pool_size(),
            max_running,
            config.get_queue_capacity()
        );
        Self {
            permits: Arc::new(Semaphore::new(max_running)),
            queued: Arc::new(AtomicUsize::new(0)),
            max_running,
            queue_capacity: config.get_queue_capacity(),
            tracker: TaskTracker::new(),
        }
    }

    /// Take a running slot if one is free, otherwise a queue position.
    pub fn reserve(&self) -> Result<Slot> {
        if self.tracker.is_closed() {
            return Err(MigrateError::State("orchestrator is shutting down".into()));
        }
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(Slot::Running(permit));
        }
        let capacity = self.queue_capacity;
        self.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map_err(|_| MigrateError::QueueFull { capacity })?;
        Ok(Slot::Queued(QueueTicket {
            queued: self.queued.clone(),
        }))
    }

    /// Run `task` in a reserved slot. Queued tasks wait for a running slot first.
    pub fn spawn<F, T>(&self, slot: Slot, task: F) -> JoinHandle<Result<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        self.tracker.spawn(async move {
            let _permit = match slot {
                Slot::Running(permit) => permit,
                Slot::Queued(ticket) => {
                    let permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|_| MigrateError::State("orchestration pool closed".into()))?;
                    drop(ticket);
                    permit
                }
            };
            task.await
        })
    }

    pub fn running(&self) -> usize {
        self.max_running - self.permits.available_permits()
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Stop accepting work and wait up to `timeout` for every task to end.
    /// Returns false when tasks were still running at the deadline.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tracker.close();
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "{} migration tasks still running after {:?}",
                    self.tracker.len(),
                    timeout
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn pool(max: usize, queue: usize) -> TaskPool {
        TaskPool::new(&ExecutorConfig {
            core_pool_size: Some(1),
            max_pool_size: Some(max),
            queue_capacity: Some(queue),
            await_termination_seconds: Some(1),
        })
    }

    #[tokio::test]
    async fn test_queue_full_after_capacity() {
        let pool = pool(1, 1);
        let (tx, rx) = oneshot::channel::<()>();
        let first = pool.spawn(pool.reserve().unwrap(), async move {
            let _ = rx.await;
            Ok(1)
        });
        let queued = pool.reserve().unwrap();
        assert!(matches!(queued, Slot::Queued(_)));
        assert_eq!(pool.queued(), 1);
        assert!(matches!(
            pool.reserve(),
            Err(MigrateError::QueueFull { capacity: 1 })
        ));

        let second = pool.spawn(queued, async { Ok(2) });
        tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert_eq!(second.await.unwrap().unwrap(), 2);
        assert_eq!(pool.queued(), 0);
        assert_eq!(pool.running(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_then_refuses_work() {
        let pool = pool(2, 0);
        let handle = pool.spawn(pool.reserve().unwrap(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        });
        assert!(pool.shutdown(Duration::from_secs(5)).await);
        assert!(handle.await.unwrap().is_ok());
        assert!(pool.reserve().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_times_out() {
        let pool = pool(1, 0);
        let (_tx, rx) = oneshot::channel::<()>();
        let _handle = pool.spawn(pool.reserve().unwrap(), async move {
            let _ = rx.await;
            Ok(())
        });
        assert!(!pool.shutdown(Duration::from_millis(20)).await);
    }
}
