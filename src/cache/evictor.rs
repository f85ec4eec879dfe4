//! Memory-Pressure Eviction
//!
//! Removes the least valuable lazy entries when the KV backend runs above its
//! memory ceiling. Only the `lazy:` namespace is a candidate; preloaded
//! collections, index rows and relationship rows are never touched.
//!
//! Candidates come from the client's namespace registry, which is seeded from
//! a backend scan on connect and reconciled by every cleanup sweep.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::policy::EvictionPolicy;
use super::usage::{UsageCounter, UsageTracker};
use crate::domain::ports::{EventPublisher, KeyTtl, MemoryInfo};
use crate::domain::CacheEvent;
use crate::kv::keys::usage_key_for_lazy;
use crate::kv::{CacheClient, Namespace};

/// Result of one eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvictionOutcome {
    /// Whether memory pressure triggered the pass
    pub triggered: bool,
    pub candidates: usize,
    pub evicted: u64,
    pub before_bytes: u64,
    pub after_bytes: u64,
}

/// Evicts lazy entries ranked by usage.
pub struct Evictor {
    client: Arc<CacheClient>,
    usage: Arc<UsageTracker>,
    policy: EvictionPolicy,
    events: Arc<dyn EventPublisher>,
}

impl Evictor {
    pub fn new(
        client: Arc<CacheClient>,
        usage: Arc<UsageTracker>,
        policy: EvictionPolicy,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            client,
            usage,
            policy,
            events,
        }
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    /// Evict only when used memory exceeds the configured ceiling.
    pub async fn evict_if_needed(&self) -> EvictionOutcome {
        let Some(info) = self.client.memory_info().await else {
            return EvictionOutcome::default();
        };

        if !self.policy.exceeds_ceiling(&info) {
            debug!(
                used = info.used_bytes,
                ceiling = self.policy.memory_ceiling_bytes,
                "Memory below ceiling, nothing to evict"
            );
            return EvictionOutcome {
                before_bytes: info.used_bytes,
                after_bytes: info.used_bytes,
                ..Default::default()
            };
        }

        self.evict_with(info).await
    }

    /// Evict a batch regardless of the ceiling.
    pub async fn evict_now(&self) -> EvictionOutcome {
        let info = self.client.memory_info().await.unwrap_or_default();
        self.evict_with(info).await
    }

    #[instrument(skip(self, before), fields(before_bytes = before.used_bytes))]
    async fn evict_with(&self, before: MemoryInfo) -> EvictionOutcome {
        let ranked = self.rank_candidates();
        let batch = self.policy.batch_size(ranked.len());
        let mut outcome = EvictionOutcome {
            triggered: true,
            candidates: ranked.len(),
            before_bytes: before.used_bytes,
            after_bytes: before.used_bytes,
            evicted: 0,
        };
        if batch == 0 {
            debug!("No lazy entries to evict");
            return outcome;
        }

        let victims = self.live_victims(ranked, batch).await;
        outcome.evicted = self.client.del(&victims).await;
        outcome.after_bytes = self
            .client
            .memory_info()
            .await
            .map(|info| info.used_bytes)
            .unwrap_or(before.used_bytes);

        self.client.metrics().record_evictions(outcome.evicted);
        info!(
            evicted = outcome.evicted,
            candidates = outcome.candidates,
            before = outcome.before_bytes,
            after = outcome.after_bytes,
            "Evicted lazy entries"
        );

        let event = CacheEvent::eviction_performed(
            outcome.evicted,
            outcome.before_bytes,
            outcome.after_bytes,
        );
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish eviction event");
        }
        outcome
    }

    /// Take up to `batch` keys from `ranked` that still exist. Expired keys
    /// are forgotten and their slots refilled from the next candidates.
    async fn live_victims(&self, ranked: Vec<String>, batch: usize) -> Vec<String> {
        let mut victims = Vec::with_capacity(batch);
        let mut expired = 0usize;
        for key in ranked {
            if victims.len() == batch {
                break;
            }
            match self.client.ttl(&key).await {
                Some(KeyTtl::Missing) => {
                    self.client.registry().untrack(&key);
                    expired += 1;
                }
                Some(_) => victims.push(key),
                None => break,
            }
        }
        if expired > 0 {
            debug!(expired, "Skipped expired eviction candidates");
        }
        victims
    }

    /// Lazy keys, least valuable first: never-seen keys, then oldest access,
    /// then lowest count.
    fn rank_candidates(&self) -> Vec<String> {
        let mut ranked: Vec<(Option<UsageCounter>, String)> = self
            .client
            .registry()
            .keys(Namespace::Lazy)
            .into_iter()
            .map(|key| {
                let counter = usage_key_for_lazy(&key).and_then(|k| self.usage.counter(k));
                (counter, key)
            })
            .collect();

        ranked.sort_by(|(a, ka), (b, kb)| {
            let by_usage = match (a, b) {
                (None, None) => std::cmp::Ordering::Equal,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(a), Some(b)) => a
                    .last_access
                    .cmp(&b.last_access)
                    .then_with(|| a.access_count.cmp(&b.access_count)),
            };
            by_usage.then_with(|| ka.cmp(kb))
        });
        ranked.into_iter().map(|(_, key)| key).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, MemoryKvStore};
    use crate::domain::ports::KvStore;
    use crate::domain::EntityType;
    use crate::kv::KvConfig;
    use std::time::Duration;

    async fn setup(ceiling: u64) -> (Arc<MemoryKvStore>, Arc<CacheClient>, Arc<UsageTracker>, Evictor, Arc<InMemoryEventCollector>) {
        let store = Arc::new(MemoryKvStore::new());
        let client = Arc::new(CacheClient::new(store.clone(), KvConfig::default()));
        client.connect().await;
        let usage = Arc::new(UsageTracker::default());
        let events = Arc::new(InMemoryEventCollector::new());
        let evictor = Evictor::new(
            client.clone(),
            usage.clone(),
            EvictionPolicy::with_ceiling(ceiling),
            events.clone(),
        );
        (store, client, usage, evictor, events)
    }

    #[tokio::test]
    async fn test_below_ceiling_is_noop() {
        let (_store, client, _usage, evictor, events) = setup(u64::MAX).await;
        client
            .set_ex("lazy:employee:E1", "{}", Duration::from_secs(60))
            .await;

        let outcome = evictor.evict_if_needed().await;
        assert!(!outcome.triggered);
        assert_eq!(outcome.evicted, 0);
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_evicts_never_seen_first_and_spares_collections() {
        let (store, client, usage, evictor, events) = setup(1).await;
        client
            .set_ex("cache:employee:all", "[]", Duration::from_secs(600))
            .await;
        for id in ["E1", "E2", "E3", "E4", "E5"] {
            client
                .set_ex(&format!("lazy:employee:{}", id), "{\"id\":1}", Duration::from_secs(600))
                .await;
        }
        for id in ["E1", "E2", "E3", "E5"] {
            usage.record(EntityType::Employee, id);
        }

        let before = store.used_bytes();
        let outcome = evictor.evict_if_needed().await;

        assert!(outcome.triggered);
        assert_eq!(outcome.candidates, 5);
        assert_eq!(outcome.evicted, 1);
        assert!(outcome.after_bytes < before);
        assert_eq!(client.get("lazy:employee:E4").await, None);
        assert!(client.get("cache:employee:all").await.is_some());
        assert_eq!(events.events_of_type("EvictionPerformed").len(), 1);
        assert_eq!(client.metrics().keys_evicted(), 1);
    }

    #[tokio::test]
    async fn test_expired_candidates_are_replaced() {
        let (store, client, _usage, evictor, _events) = setup(1).await;
        for i in 0..10 {
            client
                .set_ex(&format!("lazy:employee:A{}", i), "{\"id\":0}", Duration::from_millis(20))
                .await;
        }
        for i in 0..5 {
            client
                .set_ex(&format!("lazy:employee:L{}", i), "{\"id\":1}", Duration::from_secs(600))
                .await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let before = store.used_bytes();
        let outcome = evictor.evict_if_needed().await;

        assert_eq!(outcome.candidates, 15);
        assert_eq!(outcome.evicted, 3);
        assert!(store.used_bytes() < before);
        assert_eq!(client.registry().len(Namespace::Lazy), 2);
    }

    #[tokio::test]
    async fn test_restarted_process_sees_existing_lazy_keys() {
        let store = Arc::new(MemoryKvStore::new());
        let first = CacheClient::new(store.clone(), KvConfig::default());
        first.connect().await;
        for i in 0..10 {
            first
                .set_ex(&format!("lazy:employee:E{}", i), "{\"id\":1}", Duration::from_secs(600))
                .await;
        }

        let client = Arc::new(CacheClient::new(store.clone(), KvConfig::default()));
        client.connect().await;
        let evictor = Evictor::new(
            client.clone(),
            Arc::new(UsageTracker::default()),
            EvictionPolicy::with_ceiling(1),
            Arc::new(InMemoryEventCollector::new()),
        );

        let outcome = evictor.evict_if_needed().await;
        assert!(outcome.triggered);
        assert_eq!(outcome.candidates, 10);
        assert_eq!(outcome.evicted, 2);
        assert!(outcome.after_bytes < outcome.before_bytes);
        assert_eq!(store.keys("lazy:*").await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_oldest_access_ranks_first() {
        let (_store, client, usage, evictor, _events) = setup(1).await;
        for id in ["A", "B"] {
            client
                .set_ex(&format!("lazy:employee:{}", id), "{}", Duration::from_secs(600))
                .await;
        }
        usage.record(EntityType::Employee, "A");
        tokio::time::sleep(Duration::from_millis(5)).await;
        usage.record(EntityType::Employee, "B");

        let outcome = evictor.evict_now().await;
        assert_eq!(outcome.evicted, 1);
        assert_eq!(client.get("lazy:employee:A").await, None);
        assert!(client.get("lazy:employee:B").await.is_some());
    }
}
