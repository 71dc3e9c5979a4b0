//! Operational metrics
//!
//! Lock-free counters and gauges updated by the consumers and the retrieval
//! engine, snapshotted for `/v1/admin/stats`. Node counts by kind are read
//! live from the graph store instead of being tracked here.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Shared metric registry
#[derive(Debug, Default)]
pub struct Metrics {
    events_appended_total: AtomicU64,
    duplicates_total: AtomicU64,
    poison_messages_total: AtomicU64,
    reflection_triggers_total: AtomicU64,
    graph_nodes_pruned_total: AtomicU64,
    extraction_sessions_total: AtomicU64,
    extraction_items_rejected_total: AtomicU64,
    enrichment_lag_seconds: AtomicU64,
    consolidation_lag_seconds: AtomicU64,
    reconsolidation_last_run_epoch: AtomicI64,
    decay_score_p50_bits: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_append(&self) {
        self.events_appended_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poison(&self) {
        self.poison_messages_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reflection_trigger(&self) {
        self.reflection_triggers_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pruned(&self, count: u64) {
        self.graph_nodes_pruned_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_extraction_session(&self, rejected_items: u64) {
        self.extraction_sessions_total.fetch_add(1, Ordering::Relaxed);
        self.extraction_items_rejected_total
            .fetch_add(rejected_items, Ordering::Relaxed);
    }

    pub fn set_enrichment_lag_seconds(&self, lag: u64) {
        self.enrichment_lag_seconds.store(lag, Ordering::Relaxed);
    }

    pub fn set_consolidation_lag_seconds(&self, lag: u64) {
        self.consolidation_lag_seconds.store(lag, Ordering::Relaxed);
    }

    pub fn set_reconsolidation_last_run(&self, epoch_seconds: i64) {
        self.reconsolidation_last_run_epoch
            .store(epoch_seconds, Ordering::Relaxed);
    }

    pub fn set_decay_score_p50(&self, p50: f64) {
        self.decay_score_p50_bits
            .store(p50.to_bits(), Ordering::Relaxed);
    }

    pub fn reflection_triggers_total(&self) -> u64 {
        self.reflection_triggers_total.load(Ordering::Relaxed)
    }

    /// Point-in-time view for the stats surface
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_appended_total: self.events_appended_total.load(Ordering::Relaxed),
            duplicates_total: self.duplicates_total.load(Ordering::Relaxed),
            poison_messages_total: self.poison_messages_total.load(Ordering::Relaxed),
            reflection_triggers_total: self.reflection_triggers_total.load(Ordering::Relaxed),
            graph_nodes_pruned_total: self.graph_nodes_pruned_total.load(Ordering::Relaxed),
            extraction_sessions_total: self.extraction_sessions_total.load(Ordering::Relaxed),
            extraction_items_rejected_total: self
                .extraction_items_rejected_total
                .load(Ordering::Relaxed),
            enrichment_lag_seconds: self.enrichment_lag_seconds.load(Ordering::Relaxed),
            consolidation_lag_seconds: self.consolidation_lag_seconds.load(Ordering::Relaxed),
            reconsolidation_last_run_epoch: self
                .reconsolidation_last_run_epoch
                .load(Ordering::Relaxed),
            decay_score_p50: f64::from_bits(self.decay_score_p50_bits.load(Ordering::Relaxed)),
        }
    }
}

/// Serialized metric view
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub events_appended_total: u64,
    pub duplicates_total: u64,
    pub poison_messages_total: u64,
    pub reflection_triggers_total: u64,
    pub graph_nodes_pruned_total: u64,
    pub extraction_sessions_total: u64,
    pub extraction_items_rejected_total: u64,
    pub enrichment_lag_seconds: u64,
    pub consolidation_lag_seconds: u64,
    pub reconsolidation_last_run_epoch: i64,
    pub decay_score_p50: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_append();
        metrics.record_append();
        metrics.record_duplicate();
        metrics.record_pruned(5);
        metrics.record_reflection_trigger();
        metrics.set_decay_score_p50(0.42);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_appended_total, 2);
        assert_eq!(snapshot.duplicates_total, 1);
        assert_eq!(snapshot.graph_nodes_pruned_total, 5);
        assert_eq!(snapshot.reflection_triggers_total, 1);
        assert!((snapshot.decay_score_p50 - 0.42).abs() < 1e-12);
    }
}
