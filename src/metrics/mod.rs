//! Metrics module
//!
//! In-process cache counters and the Prometheus series they feed.

mod cache_metrics;
pub mod exporter;

pub use cache_metrics::{CacheMetrics, MetricsSnapshot};
