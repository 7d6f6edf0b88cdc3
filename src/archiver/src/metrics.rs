//! Archive pipeline metrics
//!
//! Thread-safe counters shared by every pipeline component.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Clone)]
pub struct ArchiveMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    batches_extracted: AtomicUsize,
    records_extracted: AtomicU64,
    extraction_failures: AtomicUsize,
    bundles_uploaded: AtomicUsize,
    bytes_uploaded: AtomicU64,
    upload_failures: AtomicUsize,
    artifacts_skipped: AtomicUsize,
    artifacts_cleaned: AtomicUsize,
    records_deleted: AtomicU64,
    deletion_misses: AtomicU64,
    deletion_failures: AtomicU64,
    verification_anomalies: AtomicU64,
}

impl Default for ArchiveMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    pub fn record_batch_extracted(&self, records: usize) {
        self.inner.batches_extracted.fetch_add(1, Ordering::Relaxed);
        self.inner
            .records_extracted
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_extraction_failure(&self) {
        self.inner
            .extraction_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bundle_uploaded(&self, bytes: u64) {
        self.inner.bundles_uploaded.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_upload_failure(&self) {
        self.inner.upload_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_artifacts_skipped(&self, count: usize) {
        self.inner
            .artifacts_skipped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_artifacts_cleaned(&self, count: usize) {
        self.inner
            .artifacts_cleaned
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_deletions(&self, deleted: u64, misses: u64, failures: u64) {
        self.inner
            .records_deleted
            .fetch_add(deleted, Ordering::Relaxed);
        self.inner.deletion_misses.fetch_add(misses, Ordering::Relaxed);
        self.inner
            .deletion_failures
            .fetch_add(failures, Ordering::Relaxed);
    }

    pub fn record_verification_anomalies(&self, count: u64) {
        self.inner
            .verification_anomalies
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn summary(&self) -> MetricsSummary {
        let inner = &self.inner;
        MetricsSummary {
            batches_extracted: inner.batches_extracted.load(Ordering::Relaxed),
            records_extracted: inner.records_extracted.load(Ordering::Relaxed),
            extraction_failures: inner.extraction_failures.load(Ordering::Relaxed),
            bundles_uploaded: inner.bundles_uploaded.load(Ordering::Relaxed),
            bytes_uploaded: inner.bytes_uploaded.load(Ordering::Relaxed),
            upload_failures: inner.upload_failures.load(Ordering::Relaxed),
            artifacts_skipped: inner.artifacts_skipped.load(Ordering::Relaxed),
            artifacts_cleaned: inner.artifacts_cleaned.load(Ordering::Relaxed),
            records_deleted: inner.records_deleted.load(Ordering::Relaxed),
            deletion_misses: inner.deletion_misses.load(Ordering::Relaxed),
            deletion_failures: inner.deletion_failures.load(Ordering::Relaxed),
            verification_anomalies: inner.verification_anomalies.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ArchiveMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSummary {
    pub batches_extracted: usize,
    pub records_extracted: u64,
    pub extraction_failures: usize,
    pub bundles_uploaded: usize,
    pub bytes_uploaded: u64,
    pub upload_failures: usize,
    pub artifacts_skipped: usize,
    pub artifacts_cleaned: usize,
    pub records_deleted: u64,
    pub deletion_misses: u64,
    pub deletion_failures: u64,
    pub verification_anomalies: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        tracing::info!(
            batches_extracted = self.batches_extracted,
            records_extracted = self.records_extracted,
            extraction_failures = self.extraction_failures,
            bundles_uploaded = self.bundles_uploaded,
            bytes_uploaded = self.bytes_uploaded,
            upload_failures = self.upload_failures,
            artifacts_skipped = self.artifacts_skipped,
            artifacts_cleaned = self.artifacts_cleaned,
            records_deleted = self.records_deleted,
            deletion_misses = self.deletion_misses,
            deletion_failures = self.deletion_failures,
            verification_anomalies = self.verification_anomalies,
            "Archive metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_shared_between_clones() {
        let metrics = ArchiveMetrics::new();
        let clone = metrics.clone();

        metrics.record_batch_extracted(5);
        clone.record_batch_extracted(3);
        clone.record_deletions(7, 1, 0);
        metrics.record_upload_failure();

        let summary = metrics.summary();
        assert_eq!(summary.batches_extracted, 2);
        assert_eq!(summary.records_extracted, 8);
        assert_eq!(summary.records_deleted, 7);
        assert_eq!(summary.deletion_misses, 1);
        assert_eq!(summary.upload_failures, 1);
    }
}
