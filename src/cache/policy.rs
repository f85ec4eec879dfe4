//! Cache TTL and Eviction Policies
//!
//! Configurable policies for lazy entry lifetimes and memory-pressure
//! eviction.

use std::time::Duration;

use crate::domain::ports::MemoryInfo;

/// Access-count driven TTL for lazily loaded entries.
///
/// Tiers are checked from the highest threshold down; a count strictly above
/// a threshold earns that tier's TTL.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicTtlPolicy {
    /// `(exclusive access threshold, ttl)`, highest threshold first
    pub tiers: Vec<(u64, Duration)>,
    /// TTL when no tier applies
    pub base_ttl: Duration,
}

impl Default for DynamicTtlPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl DynamicTtlPolicy {
    /// `>100 -> 2h`, `>50 -> 1h`, `>10 -> 30m`, else `10m`.
    pub fn standard() -> Self {
        Self::new(
            vec![
                (100, Duration::from_secs(7200)),
                (50, Duration::from_secs(3600)),
                (10, Duration::from_secs(1800)),
            ],
            Duration::from_secs(600),
        )
    }

    /// Same TTL regardless of popularity.
    pub fn flat(ttl: Duration) -> Self {
        Self::new(Vec::new(), ttl)
    }

    pub fn new(mut tiers: Vec<(u64, Duration)>, base_ttl: Duration) -> Self {
        tiers.sort_by(|a, b| b.0.cmp(&a.0));
        Self { tiers, base_ttl }
    }

    pub fn ttl_for(&self, access_count: u64) -> Duration {
        self.tiers
            .iter()
            .find(|(threshold, _)| access_count > *threshold)
            .map(|(_, ttl)| *ttl)
            .unwrap_or(self.base_ttl)
    }
}

/// Eviction policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionPolicy {
    /// Memory ceiling used when the backend reports no maximum (0 = none)
    pub memory_ceiling_bytes: u64,
    /// Share of candidate keys removed per eviction
    pub fraction: f64,
    /// Floor on keys removed when any candidate exists
    pub min_keys: usize,
    /// Usage ratio at which memory optimization evicts
    pub optimize_threshold: f64,
    /// Usage ratio at which health checks warn
    pub warn_threshold: f64,
    /// Fragmentation ratio at which memory optimization warns
    pub fragmentation_warn: f64,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            memory_ceiling_bytes: 512 * 1024 * 1024,
            fraction: 0.2,
            min_keys: 1,
            optimize_threshold: 0.8,
            warn_threshold: 0.9,
            fragmentation_warn: 1.5,
        }
    }
}

impl EvictionPolicy {
    pub fn with_ceiling(memory_ceiling_bytes: u64) -> Self {
        Self {
            memory_ceiling_bytes,
            ..Default::default()
        }
    }

    /// Ceiling given in megabytes. Oversized values clamp to `u64::MAX`.
    pub fn with_ceiling_mb(megabytes: u64) -> Self {
        Self::with_ceiling(megabytes.saturating_mul(1024 * 1024))
    }

    /// Keys to remove out of `candidates`.
    pub fn batch_size(&self, candidates: usize) -> usize {
        if candidates == 0 {
            return 0;
        }
        let share = (candidates as f64 * self.fraction).floor() as usize;
        share.max(self.min_keys).min(candidates)
    }

    /// Used memory is above the configured ceiling.
    pub fn exceeds_ceiling(&self, info: &MemoryInfo) -> bool {
        self.memory_ceiling_bytes > 0 && info.used_bytes > self.memory_ceiling_bytes
    }

    /// Usage ratio against the backend maximum, else the ceiling.
    pub fn usage_ratio(&self, info: &MemoryInfo) -> f64 {
        info.usage_ratio(self.memory_ceiling_bytes)
    }

    pub fn should_optimize(&self, info: &MemoryInfo) -> bool {
        self.usage_ratio(info) > self.optimize_threshold
    }

    pub fn should_warn(&self, info: &MemoryInfo) -> bool {
        self.usage_ratio(info) > self.warn_threshold
    }

    pub fn is_fragmented(&self, info: &MemoryInfo) -> bool {
        info.fragmentation_ratio > self.fragmentation_warn
    }
}
