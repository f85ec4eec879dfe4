//! Cache Metrics Collection
//!
//! In-process counters for hit ratios, degraded operations and evictions.
//! Every recording also bumps the matching Prometheus series.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::exporter;
use crate::kv::Namespace;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Lookup metrics
    lazy_hits: AtomicU64,
    lazy_misses: AtomicU64,
    search_hits: AtomicU64,
    search_misses: AtomicU64,
    report_hits: AtomicU64,
    report_misses: AtomicU64,

    // Soft-stale references dropped from results
    stale_index_refs: AtomicU64,
    stale_children: AtomicU64,

    // Backend health
    kv_errors: AtomicU64,
    kv_bypassed: AtomicU64,
    reconnects: AtomicU64,

    // Eviction
    keys_evicted: AtomicU64,

    // KV command latency (microseconds, exponential moving average)
    command_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, namespace: Namespace) -> Option<(&AtomicU64, &AtomicU64)> {
        match namespace {
            Namespace::Lazy => Some((&self.lazy_hits, &self.lazy_misses)),
            Namespace::Search => Some((&self.search_hits, &self.search_misses)),
            Namespace::Report => Some((&self.report_hits, &self.report_misses)),
            _ => None,
        }
    }

    pub fn record_hit(&self, namespace: Namespace) {
        if let Some((hits, _)) = self.counters(namespace) {
            hits.fetch_add(1, Ordering::Relaxed);
        }
        exporter::LOOKUPS
            .with_label_values(&[namespace.prefix(), "hit"])
            .inc();
    }

    pub fn record_miss(&self, namespace: Namespace) {
        if let Some((_, misses)) = self.counters(namespace) {
            misses.fetch_add(1, Ordering::Relaxed);
        }
        exporter::LOOKUPS
            .with_label_values(&[namespace.prefix(), "miss"])
            .inc();
    }

    pub fn hits(&self, namespace: Namespace) -> u64 {
        self.counters(namespace)
            .map(|(hits, _)| hits.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn misses(&self, namespace: Namespace) -> u64 {
        self.counters(namespace)
            .map(|(_, misses)| misses.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn hit_ratio(&self, namespace: Namespace) -> f64 {
        ratio(self.hits(namespace), self.misses(namespace))
    }

    /// Hit ratio across every tracked lookup namespace
    pub fn overall_hit_ratio(&self) -> f64 {
        let (hits, misses) = Namespace::TRACKED
            .iter()
            .fold((0, 0), |(h, m), ns| (h + self.hits(*ns), m + self.misses(*ns)));
        ratio(hits, misses)
    }

    pub fn record_stale_index_ref(&self) {
        self.stale_index_refs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_child(&self) {
        self.stale_children.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_kv_error(&self, operation: &str) {
        self.kv_errors.fetch_add(1, Ordering::Relaxed);
        exporter::KV_ERRORS.with_label_values(&[operation]).inc();
    }

    pub fn record_bypass(&self) {
        self.kv_bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.keys_evicted.fetch_add(count, Ordering::Relaxed);
        exporter::KEYS_EVICTED.inc_by(count);
    }

    pub fn keys_evicted(&self) -> u64 {
        self.keys_evicted.load(Ordering::Relaxed)
    }

    pub fn kv_errors(&self) -> u64 {
        self.kv_errors.load(Ordering::Relaxed)
    }

    pub fn record_command_latency(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = self.command_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .command_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn command_latency(&self) -> Duration {
        Duration::from_micros(self.command_latency_us.load(Ordering::Relaxed))
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            lazy_hits: self.hits(Namespace::Lazy),
            lazy_misses: self.misses(Namespace::Lazy),
            lazy_hit_ratio: self.hit_ratio(Namespace::Lazy),
            search_hits: self.hits(Namespace::Search),
            search_misses: self.misses(Namespace::Search),
            report_hits: self.hits(Namespace::Report),
            report_misses: self.misses(Namespace::Report),
            report_hit_ratio: self.hit_ratio(Namespace::Report),
            stale_index_refs: self.stale_index_refs.load(Ordering::Relaxed),
            stale_children: self.stale_children.load(Ordering::Relaxed),
            kv_errors: self.kv_errors(),
            kv_bypassed: self.kv_bypassed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            keys_evicted: self.keys_evicted(),
            command_latency_us: self.command_latency_us.load(Ordering::Relaxed),
            overall_hit_ratio: self.overall_hit_ratio(),
        }
    }
}

fn ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub lazy_hits: u64,
    pub lazy_misses: u64,
    pub lazy_hit_ratio: f64,
    pub search_hits: u64,
    pub search_misses: u64,
    pub report_hits: u64,
    pub report_misses: u64,
    pub report_hit_ratio: f64,
    pub stale_index_refs: u64,
    pub stale_children: u64,
    pub kv_errors: u64,
    pub kv_bypassed: u64,
    pub reconnects: u64,
    pub keys_evicted: u64,
    pub command_latency_us: u64,
    pub overall_hit_ratio: f64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_hit(Namespace::Lazy);
        metrics.record_hit(Namespace::Lazy);
        metrics.record_miss(Namespace::Lazy);

        assert_eq!(metrics.hits(Namespace::Lazy), 2);
        assert_eq!(metrics.misses(Namespace::Lazy), 1);
        assert!((metrics.hit_ratio(Namespace::Lazy) - 0.666).abs() < 0.01);
        assert_eq!(metrics.hit_ratio(Namespace::Report), 0.0);
    }

    #[test]
    fn test_untracked_namespace_is_ignored() {
        let metrics = CacheMetrics::new();
        metrics.record_hit(Namespace::Cache);
        assert_eq!(metrics.hits(Namespace::Cache), 0);
        assert_eq!(metrics.overall_hit_ratio(), 0.0);
    }

    #[test]
    fn test_latency_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_command_latency(Duration::from_micros(100));
        assert_eq!(metrics.command_latency(), Duration::from_micros(100));

        metrics.record_command_latency(Duration::from_micros(200));
        let latency = metrics.command_latency().as_micros();
        assert!(latency > 100 && latency < 200);
    }

    #[test]
    fn test_snapshot() {
        let metrics = CacheMetrics::new();
        metrics.record_hit(Namespace::Report);
        metrics.record_evictions(4);
        metrics.record_kv_error("get");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.report_hits, 1);
        assert_eq!(snapshot.keys_evicted, 4);
        assert_eq!(snapshot.kv_errors, 1);
        assert_eq!(snapshot.overall_hit_ratio, 1.0);
    }
}
