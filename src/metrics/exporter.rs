//! Prometheus Exporter
//!
//! Process-wide Prometheus series, registered lazily on a crate registry and
//! rendered by the ops server.

use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing::warn;

use crate::error::{Error, Result};

/// Registry holding every rostercache series.
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("rostercache_lookups_total", "Cache lookups by namespace and result"),
            &["namespace", "result"],
        )
        .expect("valid metric definition"),
    )
});

pub static KV_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("rostercache_kv_errors_total", "KV commands that failed or timed out"),
            &["operation"],
        )
        .expect("valid metric definition"),
    )
});

pub static KEYS_EVICTED: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new("rostercache_keys_evicted_total", "Lazy keys evicted under memory pressure")
            .expect("valid metric definition"),
    )
});

pub static KV_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    register(
        IntGauge::new("rostercache_kv_connected", "1 when the KV backend is connected")
            .expect("valid metric definition"),
    )
});

pub static KV_MEMORY_USED: Lazy<IntGauge> = Lazy::new(|| {
    register(
        IntGauge::new("rostercache_kv_memory_used_bytes", "Last observed KV memory usage")
            .expect("valid metric definition"),
    )
});

pub static PRELOAD_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("rostercache_preload_runs_total", "Full preload runs by outcome"),
            &["status"],
        )
        .expect("valid metric definition"),
    )
});

pub static PRELOAD_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register(
        Histogram::with_opts(
            HistogramOpts::new("rostercache_preload_duration_seconds", "Full preload duration")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
        )
        .expect("valid metric definition"),
    )
});

pub static MAINTENANCE_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("rostercache_maintenance_runs_total", "Maintenance task runs by outcome"),
            &["task", "outcome"],
        )
        .expect("valid metric definition"),
    )
});

fn register<C: Collector + Clone + 'static>(collector: C) -> C {
    if let Err(e) = REGISTRY.register(Box::new(collector.clone())) {
        warn!("Failed to register metric: {}", e);
    }
    collector
}

/// Render every registered series in the Prometheus text format.
pub fn render() -> Result<(String, Vec<u8>)> {
    // Touch the lazies so series show up before their first sample
    Lazy::force(&LOOKUPS);
    Lazy::force(&KV_ERRORS);
    Lazy::force(&KEYS_EVICTED);
    Lazy::force(&KV_CONNECTED);
    Lazy::force(&KV_MEMORY_USED);
    Lazy::force(&PRELOAD_RUNS);
    Lazy::force(&PRELOAD_DURATION);
    Lazy::force(&MAINTENANCE_RUNS);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    Ok((encoder.format_type().to_string(), buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_series() {
        PRELOAD_RUNS.with_label_values(&["completed"]).inc();
        let (content_type, body) = render().unwrap();
        let text = String::from_utf8(body).unwrap();

        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("rostercache_preload_runs_total"));
        assert!(text.contains("rostercache_keys_evicted_total"));
    }
}
