//! Usage Tracking
//!
//! In-process access counters keyed `{type}:{id}`. Counters drive dynamic
//! TTLs, eviction ranking and nightly re-warming. They are never
//! authoritative: a snapshot is saved to `system:usage_stats` and merged back
//! at startup.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::policy::DynamicTtlPolicy;
use crate::domain::EntityType;
use crate::domain::ports::KvBatch;
use crate::kv::keys::{self, HOT_ENTITIES_KEY, USAGE_STATS_KEY};
use crate::kv::CacheClient;

/// Lifetime of the persisted usage snapshot.
const SNAPSHOT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Entities mirrored into the hot-entities sorted set.
const HOT_SET_SIZE: usize = 100;

/// Access counter for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub access_count: u64,
    pub last_access: DateTime<Utc>,
}

/// Serialized form of the usage map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub counters: BTreeMap<String, UsageCounter>,
}

/// Thresholds for hot/cold classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageThresholds {
    /// Access count at or above which an entity is hot
    pub hot: u64,
    /// Access count at or below which an entity is cold
    pub cold: u64,
}

impl Default for UsageThresholds {
    fn default() -> Self {
        Self { hot: 50, cold: 5 }
    }
}

/// Result of a usage analysis pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageAnalysis {
    pub analyzed_at: Option<DateTime<Utc>>,
    pub total_tracked: usize,
    pub total_accesses: u64,
    pub hot: Vec<String>,
    pub warm_count: usize,
    pub cold_count: usize,
    pub recommendations: Vec<String>,
}

/// Usage tracker
#[derive(Debug, Default)]
pub struct UsageTracker {
    counters: DashMap<String, UsageCounter>,
    ttl_policy: DynamicTtlPolicy,
}

impl UsageTracker {
    pub fn new(ttl_policy: DynamicTtlPolicy) -> Self {
        Self {
            counters: DashMap::new(),
            ttl_policy,
        }
    }

    /// Count one access. Returns the new access count.
    pub fn record(&self, entity_type: EntityType, id: &str) -> u64 {
        self.record_key(&keys::usage_key(entity_type, id))
    }

    pub fn record_key(&self, key: &str) -> u64 {
        let now = Utc::now();
        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert(UsageCounter {
                access_count: 0,
                last_access: now,
            });
        counter.access_count += 1;
        counter.last_access = now;
        counter.access_count
    }

    pub fn count(&self, entity_type: EntityType, id: &str) -> u64 {
        self.counter(&keys::usage_key(entity_type, id))
            .map(|c| c.access_count)
            .unwrap_or(0)
    }

    pub fn counter(&self, key: &str) -> Option<UsageCounter> {
        self.counters.get(key).map(|c| *c)
    }

    /// TTL for an entity given its current popularity.
    pub fn dynamic_ttl(&self, entity_type: EntityType, id: &str) -> Duration {
        self.ttl_for_count(self.count(entity_type, id))
    }

    pub fn ttl_for_count(&self, count: u64) -> Duration {
        self.ttl_policy.ttl_for(count)
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn clear(&self) {
        self.counters.clear();
    }

    /// Most accessed keys, highest count first.
    pub fn top_accessed(&self, n: usize) -> Vec<(String, UsageCounter)> {
        let mut all: Vec<(String, UsageCounter)> = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        all.sort_by(|a, b| {
            b.1.access_count
                .cmp(&a.1.access_count)
                .then_with(|| a.0.cmp(&b.0))
        });
        all.truncate(n);
        all
    }

    /// Classify tracked entities into hot, warm and cold buckets.
    pub fn analyze(&self, thresholds: UsageThresholds) -> UsageAnalysis {
        let mut analysis = UsageAnalysis {
            analyzed_at: Some(Utc::now()),
            ..Default::default()
        };

        let mut hot: Vec<(String, u64)> = Vec::new();
        for entry in self.counters.iter() {
            let count = entry.value().access_count;
            analysis.total_tracked += 1;
            analysis.total_accesses += count;
            if count >= thresholds.hot {
                hot.push((entry.key().clone(), count));
            } else if count <= thresholds.cold {
                analysis.cold_count += 1;
            } else {
                analysis.warm_count += 1;
            }
        }
        hot.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        analysis.hot = hot.into_iter().map(|(key, _)| key).collect();

        if !analysis.hot.is_empty() {
            analysis.recommendations.push(format!(
                "{} hot entities qualify for nightly re-warming",
                analysis.hot.len()
            ));
        }
        if analysis.total_tracked > 0 && analysis.cold_count * 2 > analysis.total_tracked {
            analysis.recommendations.push(format!(
                "{} of {} tracked entities are cold, shorter base TTL would free memory",
                analysis.cold_count, analysis.total_tracked
            ));
        }
        analysis
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            taken_at: Some(Utc::now()),
            counters: self
                .counters
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }

    /// Merge a snapshot, keeping the larger count and later access per key.
    /// Returns how many keys were merged.
    pub fn restore(&self, snapshot: UsageSnapshot) -> usize {
        let merged = snapshot.counters.len();
        for (key, saved) in snapshot.counters {
            self.counters
                .entry(key)
                .and_modify(|current| {
                    current.access_count = current.access_count.max(saved.access_count);
                    current.last_access = current.last_access.max(saved.last_access);
                })
                .or_insert(saved);
        }
        merged
    }

    /// Save the snapshot and the hot-entities sorted set.
    pub async fn persist(&self, client: &CacheClient) -> bool {
        let snapshot = self.snapshot();
        let raw = match serde_json::to_string(&snapshot) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "Failed to encode usage snapshot");
                return false;
            }
        };

        let mut batch = KvBatch::new();
        batch.set_ex(USAGE_STATS_KEY, raw, SNAPSHOT_TTL);
        batch.del(vec![HOT_ENTITIES_KEY.to_string()]);
        for (key, counter) in self.top_accessed(HOT_SET_SIZE) {
            batch.zadd(HOT_ENTITIES_KEY, key, counter.access_count as f64);
        }
        batch.expire(HOT_ENTITIES_KEY, SNAPSHOT_TTL);

        let saved = client.execute(batch).await;
        if saved {
            info!(tracked = snapshot.counters.len(), "Persisted usage snapshot");
        }
        saved
    }

    /// Merge the persisted snapshot, if any.
    pub async fn load(&self, client: &CacheClient) -> usize {
        match client.get_json::<UsageSnapshot>(USAGE_STATS_KEY).await {
            Some(snapshot) => {
                let merged = self.restore(snapshot);
                info!(merged, "Restored usage snapshot");
                merged
            }
            None => 0,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryKvStore;
    use crate::kv::KvConfig;
    use std::sync::Arc;

    #[test]
    fn test_record_and_dynamic_ttl() {
        let tracker = UsageTracker::default();
        for _ in 0..11 {
            tracker.record(EntityType::Employee, "E1");
        }
        assert_eq!(tracker.count(EntityType::Employee, "E1"), 11);
        assert_eq!(
            tracker.dynamic_ttl(EntityType::Employee, "E1"),
            Duration::from_secs(1800)
        );
        assert_eq!(
            tracker.dynamic_ttl(EntityType::Employee, "unknown"),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn test_top_accessed_order() {
        let tracker = UsageTracker::default();
        tracker.record(EntityType::Division, "D1");
        for _ in 0..3 {
            tracker.record(EntityType::Employee, "E1");
        }
        let top = tracker.top_accessed(1);
        assert_eq!(top[0].0, "employee:E1");
        assert_eq!(top[0].1.access_count, 3);
    }

    #[test]
    fn test_analyze_buckets() {
        let tracker = UsageTracker::default();
        for _ in 0..60 {
            tracker.record(EntityType::Employee, "hot");
        }
        for _ in 0..20 {
            tracker.record(EntityType::Employee, "warm");
        }
        tracker.record(EntityType::Employee, "cold");

        let analysis = tracker.analyze(UsageThresholds::default());
        assert_eq!(analysis.hot, vec!["employee:hot"]);
        assert_eq!(analysis.warm_count, 1);
        assert_eq!(analysis.cold_count, 1);
        assert_eq!(analysis.total_accesses, 81);
    }

    #[test]
    fn test_restore_merges() {
        let tracker = UsageTracker::default();
        tracker.record(EntityType::Employee, "E1");

        let mut snapshot = UsageSnapshot::default();
        snapshot.counters.insert(
            "employee:E1".into(),
            UsageCounter {
                access_count: 9,
                last_access: Utc::now() - chrono::Duration::hours(1),
            },
        );
        snapshot.counters.insert(
            "division:D1".into(),
            UsageCounter {
                access_count: 2,
                last_access: Utc::now(),
            },
        );

        assert_eq!(tracker.restore(snapshot), 2);
        assert_eq!(tracker.count(EntityType::Employee, "E1"), 9);
        assert_eq!(tracker.len(), 2);
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let store = Arc::new(MemoryKvStore::new());
        let client = CacheClient::new(store.clone(), KvConfig::default());
        client.connect().await;

        let tracker = UsageTracker::default();
        tracker.record(EntityType::Section, "S1");
        tracker.record(EntityType::Section, "S1");
        assert!(tracker.persist(&client).await);
        assert_eq!(store.zrange_desc(HOT_ENTITIES_KEY)[0].0, "section:S1");

        let restored = UsageTracker::default();
        assert_eq!(restored.load(&client).await, 1);
        assert_eq!(restored.count(EntityType::Section, "S1"), 2);
    }
}
