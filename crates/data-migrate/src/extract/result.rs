//! Extraction counters shared by worker tasks.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Live counters for one connector invocation.
///
/// Workers add to the counters concurrently; the error list is append-only.
/// Aggregation is sum-based, so batch completion order does not matter.
#[derive(Debug, Default)]
pub struct ExtractionResult {
    records_extracted: AtomicU64,
    records_failed: AtomicU64,
    bytes_processed: AtomicU64,
    errors: Mutex<Vec<String>>,
    output_location: String,
}

impl ExtractionResult {
    pub fn new(output_location: impl Into<String>) -> Self {
        Self {
            output_location: output_location.into(),
            ..Default::default()
        }
    }

    /// A batch reached staging.
    pub fn record_batch(&self, records: u64, bytes: u64) {
        self.records_extracted.fetch_add(records, Ordering::Relaxed);
        self.bytes_processed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// `records` rows were lost; `message` says why.
    pub fn record_failure(&self, records: u64, message: impl Into<String>) {
        self.records_failed.fetch_add(records, Ordering::Relaxed);
        self.push_error(message);
    }

    pub fn push_error(&self, message: impl Into<String>) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(message.into());
        }
    }

    pub fn records_extracted(&self) -> u64 {
        self.records_extracted.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, entity: &str) -> ExtractionSummary {
        ExtractionSummary {
            entity: entity.to_string(),
            records_extracted: self.records_extracted.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            errors: self.errors.lock().map(|e| e.clone()).unwrap_or_default(),
            output_location: self.output_location.clone(),
        }
    }
}

/// Final, plain-data view of an [`ExtractionResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSummary {
    pub entity: String,
    pub records_extracted: u64,
    pub records_failed: u64,
    pub bytes_processed: u64,
    pub errors: Vec<String>,
    /// Staging key holding the extracted rows.
    pub output_location: String,
}

impl ExtractionSummary {
    /// Nothing was extracted and something went wrong.
    pub fn is_total_failure(&self) -> bool {
        self.records_extracted == 0 && !self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_counts_sum() {
        let result = Arc::new(ExtractionResult::new("m/extraction/e"));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let result = result.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    result.record_batch(10, 100);
                }
                result.record_failure(1, "bad row");
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let summary = result.snapshot("e");
        assert_eq!(summary.records_extracted, 8_000);
        assert_eq!(summary.bytes_processed, 80_000);
        assert_eq!(summary.records_failed, 8);
        assert_eq!(summary.errors.len(), 8);
        assert!(!summary.is_total_failure());
    }

    #[test]
    fn test_total_failure() {
        let result = ExtractionResult::new("k");
        result.push_error("connection refused");
        assert!(result.snapshot("e").is_total_failure());
        assert!(!ExtractionResult::new("k").snapshot("e").is_total_failure());
    }
}
