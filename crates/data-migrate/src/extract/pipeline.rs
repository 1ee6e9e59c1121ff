//! Batching and the extraction worker pool.
//!
//! The reading task fills fixed-size batches and hands each full batch to a
//! small pool of workers over a bounded channel, then keeps reading. Workers
//! write batches to staging and update the shared [`ExtractionResult`].

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ExtractRequest, ExtractionResult, ExtractionSummary};
use crate::core::{record_size, ControlSignal, Record};
use crate::error::{MigrateError, Result};
use crate::staging::StagingArea;

/// Bounded pool of staging writers.
pub struct BatchPipeline {
    tx: async_channel::Sender<Vec<Record>>,
    workers: Vec<JoinHandle<()>>,
    drain_timeout: Duration,
    result: Arc<ExtractionResult>,
}

impl BatchPipeline {
    pub fn start(
        staging: Arc<dyn StagingArea>,
        key: String,
        workers: usize,
        drain_timeout: Duration,
        result: Arc<ExtractionResult>,
    ) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = async_channel::bounded::<Vec<Record>>(workers * 2);

        let handles = (0..workers)
            .map(|worker_id| {
                let rx = rx.clone();
                let staging = staging.clone();
                let key = key.clone();
                let result = result.clone();
                tokio::spawn(async move {
                    while let Ok(batch) = rx.recv().await {
                        let count = batch.len() as u64;
                        let bytes: u64 = batch.iter().map(record_size).sum();
                        match staging.append(&key, &batch).await {
                            Ok(()) => {
                                result.record_batch(count, bytes);
                                debug!("Worker {}: staged {} rows to {}", worker_id, count, key);
                            }
                            Err(e) => result.record_failure(
                                count,
                                format!("worker {} failed to stage batch: {}", worker_id, e),
                            ),
                        }
                    }
                })
            })
            .collect();

        Self {
            tx,
            workers: handles,
            drain_timeout,
            result,
        }
    }

    /// Queue a batch, waiting while the workers are busy.
    pub async fn submit(&self, batch: Vec<Record>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let count = batch.len() as u64;
        if self.tx.send(batch).await.is_err() {
            self.result
                .record_failure(count, "extraction workers stopped before the batch was queued");
        }
        Ok(())
    }

    /// Close the queue and wait for the workers, aborting any still busy
    /// after the drain timeout.
    pub async fn finish(self) {
        self.tx.close();
        let aborts: Vec<_> = self.workers.iter().map(|h| h.abort_handle()).collect();
        let drained =
            tokio::time::timeout(self.drain_timeout, futures::future::join_all(self.workers)).await;
        if drained.is_err() {
            warn!(
                "Extraction workers still busy after {:?}; aborting",
                self.drain_timeout
            );
            for abort in aborts {
                abort.abort();
            }
            self.result.push_error(format!(
                "extraction workers did not drain within {:?} and were aborted",
                self.drain_timeout
            ));
        }
    }
}

/// Where a connector's reading loop puts rows.
///
/// Collects rows into batches of `batch_size`, submits full batches and
/// checks the control signal at every batch boundary.
pub struct RowSink {
    entity: String,
    batch_size: usize,
    current: Vec<Record>,
    rows_seen: u64,
    control: ControlSignal,
    pipeline: BatchPipeline,
    result: Arc<ExtractionResult>,
}

impl RowSink {
    pub fn new(
        request: &ExtractRequest,
        staging: Arc<dyn StagingArea>,
        control: ControlSignal,
    ) -> Self {
        let result = Arc::new(ExtractionResult::new(request.staging_key.clone()));
        let pipeline = BatchPipeline::start(
            staging,
            request.staging_key.clone(),
            request.workers,
            request.drain_timeout,
            result.clone(),
        );
        Self {
            entity: request.entity.clone(),
            batch_size: request.batch_size.max(1),
            current: Vec::with_capacity(request.batch_size.max(1)),
            rows_seen: 0,
            control,
            pipeline,
            result,
        }
    }

    pub async fn push(&mut self, record: Record) -> Result<()> {
        self.rows_seen += 1;
        self.current.push(record);
        if self.current.len() >= self.batch_size {
            let batch = std::mem::replace(&mut self.current, Vec::with_capacity(self.batch_size));
            self.pipeline.submit(batch).await?;
            self.control.checkpoint()?;
        }
        Ok(())
    }

    /// A row that could not be read or converted.
    pub fn reject(&mut self, message: impl Into<String>) {
        self.rows_seen += 1;
        self.result.record_failure(1, message);
    }

    pub fn rows_seen(&self) -> u64 {
        self.rows_seen
    }

    /// Flush, drain the workers and fold the read outcome into the summary.
    ///
    /// Interruptions propagate. Any other read error is recorded in the
    /// result instead of failing the call; if it happened before the first
    /// row the summary reports zero extracted plus the error.
    pub async fn complete(mut self, outcome: Result<()>) -> Result<ExtractionSummary> {
        let interrupted = matches!(&outcome, Err(e) if e.is_interruption());
        if !interrupted && !self.current.is_empty() {
            let batch = std::mem::take(&mut self.current);
            self.pipeline.submit(batch).await?;
        }
        self.pipeline.finish().await;

        match outcome {
            Ok(()) => {}
            Err(e) if e.is_interruption() => return Err(e),
            Err(e) => {
                if self.rows_seen == 0 {
                    warn!("Extraction of {} failed before the first row: {}", self.entity, e);
                } else {
                    warn!(
                        "Extraction of {} stopped after {} rows: {}",
                        self.entity, self.rows_seen, e
                    );
                }
                self.result.push_error(e.to_string());
            }
        }
        Ok(self.result.snapshot(&self.entity))
    }
}

/// Wrap a driver error with the entity being extracted.
pub(crate) fn extraction_error(entity: &str, e: impl std::fmt::Display) -> MigrateError {
    MigrateError::extraction(entity, e.to_string())
}
