//! Metrics collection for the relay
//!
//! Thread-safe counters backed by atomics. Tracks relayed requests, range
//! responses, upstream faults, indexing jobs and prefetch plans.

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics collector for the relay
///
/// All operations are thread-safe using atomic operations.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    // Relay statistics
    relayed_requests: AtomicU64,
    partial_responses: AtomicU64,
    upstream_error_responses: AtomicU64,
    upstream_failures: AtomicU64,
    rejected_requests: AtomicU64,
    bytes_to_client: AtomicU64,
    partial_range_bytes: AtomicU64,

    // Indexing job statistics
    index_jobs: AtomicU64,

    // Prefetch statistics
    prefetch_plans_started: AtomicU64,
    prefetch_plans_superseded: AtomicU64,
    prefetch_batches: AtomicU64,
    prefetch_hits: AtomicU64,
    prefetch_misses: AtomicU64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub relayed_requests: u64,
    pub partial_responses: u64,
    pub upstream_error_responses: u64,
    pub upstream_failures: u64,
    pub rejected_requests: u64,
    pub bytes_to_client: u64,
    pub partial_range_bytes: u64,

    pub index_jobs: u64,

    pub prefetch_plans_started: u64,
    pub prefetch_plans_superseded: u64,
    pub prefetch_batches: u64,
    pub prefetch_hits: u64,
    pub prefetch_misses: u64,
}

impl RelayMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a relayed response by its upstream status
    pub fn record_relay(&self, status: u16) {
        self.relayed_requests.fetch_add(1, Ordering::Relaxed);
        if status == 206 {
            self.partial_responses.fetch_add(1, Ordering::Relaxed);
        } else if status >= 400 {
            self.upstream_error_responses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a transport fault before any upstream response arrived
    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request rejected before contacting upstream
    pub fn record_rejected(&self) {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_to_client(&self, bytes: u64) {
        self.bytes_to_client.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record the span advertised by a 206 response's `Content-Range`
    pub fn record_partial_range(&self, len: u64) {
        self.partial_range_bytes.fetch_add(len, Ordering::Relaxed);
    }

    pub fn record_index_job(&self) {
        self.index_jobs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch_plan(&self) {
        self.prefetch_plans_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a plan that was invalidated before it finished
    pub fn record_prefetch_superseded(&self) {
        self.prefetch_plans_superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch_batch(&self) {
        self.prefetch_batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one prefetch request
    pub fn record_prefetch(&self, hit: bool) {
        if hit {
            self.prefetch_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.prefetch_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get a snapshot of current metrics
    ///
    /// Fields are read independently, so the snapshot may not be perfectly
    /// consistent across counters while requests are in flight.
    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            relayed_requests: self.relayed_requests.load(Ordering::Relaxed),
            partial_responses: self.partial_responses.load(Ordering::Relaxed),
            upstream_error_responses: self.upstream_error_responses.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            partial_range_bytes: self.partial_range_bytes.load(Ordering::Relaxed),
            index_jobs: self.index_jobs.load(Ordering::Relaxed),
            prefetch_plans_started: self.prefetch_plans_started.load(Ordering::Relaxed),
            prefetch_plans_superseded: self.prefetch_plans_superseded.load(Ordering::Relaxed),
            prefetch_batches: self.prefetch_batches.load(Ordering::Relaxed),
            prefetch_hits: self.prefetch_hits.load(Ordering::Relaxed),
            prefetch_misses: self.prefetch_misses.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        self.relayed_requests.store(0, Ordering::Relaxed);
        self.partial_responses.store(0, Ordering::Relaxed);
        self.upstream_error_responses.store(0, Ordering::Relaxed);
        self.upstream_failures.store(0, Ordering::Relaxed);
        self.rejected_requests.store(0, Ordering::Relaxed);
        self.bytes_to_client.store(0, Ordering::Relaxed);
        self.partial_range_bytes.store(0, Ordering::Relaxed);
        self.index_jobs.store(0, Ordering::Relaxed);
        self.prefetch_plans_started.store(0, Ordering::Relaxed);
        self.prefetch_plans_superseded.store(0, Ordering::Relaxed);
        self.prefetch_batches.store(0, Ordering::Relaxed);
        self.prefetch_hits.store(0, Ordering::Relaxed);
        self.prefetch_misses.store(0, Ordering::Relaxed);
    }
}

impl MetricsSnapshot {
    /// Share of prefetch requests that populated the cache, in percent
    pub fn prefetch_hit_rate(&self) -> f64 {
        let total = self.prefetch_hits + self.prefetch_misses;
        if total == 0 {
            0.0
        } else {
            (self.prefetch_hits as f64 / total as f64) * 100.0
        }
    }
}
