use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing ingestion and query activity.
#[derive(Default)]
pub struct DomainMetrics {
    documents_ingested: AtomicU64,
    chunks_written: AtomicU64,
    ocr_fallbacks: AtomicU64,
    extraction_failures: AtomicU64,
    queries_served: AtomicU64,
}

impl DomainMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an ingested document, the chunks written for it, and whether OCR replaced its text layer.
    pub fn record_document(&self, chunk_count: u64, ocr_used: bool) {
        self.documents_ingested.fetch_add(1, Ordering::Relaxed);
        self.chunks_written.fetch_add(chunk_count, Ordering::Relaxed);
        if ocr_used {
            self.ocr_fallbacks.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a document whose extraction failed.
    pub fn record_extraction_failure(&self) {
        self.extraction_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an answered query, single- or multi-domain.
    pub fn record_query(&self) {
        self.queries_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_ingested: self.documents_ingested.load(Ordering::Relaxed),
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            ocr_fallbacks: self.ocr_fallbacks.load(Ordering::Relaxed),
            extraction_failures: self.extraction_failures.load(Ordering::Relaxed),
            queries_served: self.queries_served.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of the counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Documents that produced at least one chunk since startup.
    pub documents_ingested: u64,
    /// Chunks written across all ingested documents.
    pub chunks_written: u64,
    /// Documents whose text layer was replaced by OCR.
    pub ocr_fallbacks: u64,
    /// Documents that failed extraction and contributed nothing.
    pub extraction_failures: u64,
    /// Queries answered.
    pub queries_served: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_documents_and_chunks() {
        let metrics = DomainMetrics::new();
        metrics.record_document(2, false);
        metrics.record_document(3, true);
        metrics.record_extraction_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.documents_ingested, 2);
        assert_eq!(snapshot.chunks_written, 5);
        assert_eq!(snapshot.ocr_fallbacks, 1);
        assert_eq!(snapshot.extraction_failures, 1);
    }

    #[test]
    fn snapshot_starts_at_zero() {
        let metrics = DomainMetrics::new();
        metrics.record_query();
        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                queries_served: 1,
                ..MetricsSnapshot::default()
            }
        );
    }
}
