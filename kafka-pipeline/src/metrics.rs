//! In-process counters backing `PipelineControl::metrics` snapshots.
//!
//! Every counter here is also reported through the `metrics` facade for the
//! Prometheus exporter; these atomics exist so a snapshot can be taken
//! without a recorder installed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    records_polled: AtomicU64,
    records_emitted: AtomicU64,
    records_processed: AtomicU64,
    stale_records_dropped: AtomicU64,
    queued_records_dropped: AtomicU64,
    commit_calls: AtomicU64,
    commit_failures: AtomicU64,
    offsets_committed: AtomicU64,
    records_sent: AtomicU64,
    send_failures: AtomicU64,
    backpressure_events: AtomicU64,
    active_partitions: AtomicU64,
    queued_partitions: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records_polled(&self, n: u64) {
        self.records_polled.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_emitted(&self) {
        self.records_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.records_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale_record_dropped(&self) {
        self.stale_records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queued_record_dropped(&self) {
        self.queued_records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commit_call(&self, partitions_committed: u64) {
        self.commit_calls.fetch_add(1, Ordering::Relaxed);
        self.offsets_committed
            .fetch_add(partitions_committed, Ordering::Relaxed);
    }

    pub fn commit_failure(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.records_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backpressure(&self) {
        self.backpressure_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_partitions(&self, active: usize, queued: usize) {
        self.active_partitions
            .store(active as u64, Ordering::Relaxed);
        self.queued_partitions
            .store(queued as u64, Ordering::Relaxed);
    }

    pub fn emitted(&self) -> u64 {
        self.records_emitted.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.records_processed.load(Ordering::Relaxed)
    }

    pub fn commit_calls(&self) -> u64 {
        self.commit_calls.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.records_sent.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        let counters = [
            ("records_polled", &self.records_polled),
            ("records_emitted", &self.records_emitted),
            ("records_processed", &self.records_processed),
            ("stale_records_dropped", &self.stale_records_dropped),
            ("queued_records_dropped", &self.queued_records_dropped),
            ("commit_calls", &self.commit_calls),
            ("commit_failures", &self.commit_failures),
            ("offsets_committed", &self.offsets_committed),
            ("records_sent", &self.records_sent),
            ("send_failures", &self.send_failures),
            ("backpressure_events", &self.backpressure_events),
            ("active_partitions", &self.active_partitions),
            ("queued_partitions", &self.queued_partitions),
        ];

        counters
            .into_iter()
            .map(|(name, value)| (name.to_string(), value.load(Ordering::Relaxed) as f64))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = PipelineMetrics::new();
        metrics.records_polled(3);
        metrics.record_emitted();
        metrics.record_emitted();
        metrics.commit_call(2);
        metrics.set_partitions(4, 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["records_polled"], 3.0);
        assert_eq!(snapshot["records_emitted"], 2.0);
        assert_eq!(snapshot["commit_calls"], 1.0);
        assert_eq!(snapshot["offsets_committed"], 2.0);
        assert_eq!(snapshot["active_partitions"], 4.0);
        assert_eq!(snapshot["queued_partitions"], 1.0);
        assert_eq!(snapshot["send_failures"], 0.0);
    }
}
