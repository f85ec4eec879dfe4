//! Index Registry
//!
//! Secondary indexes `(entity_type, index_key, index_value) -> cache_key`
//! kept in the durable catalog. Lookups match catalog rows, never scan the KV
//! store, and resolve each hit through its cache entry. Rows whose cache
//! entry is gone are soft-stale and dropped from results.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::domain::ports::CatalogStore;
use crate::domain::{Entity, EntityType, IndexEntry, Indexed};
use crate::error::Result;
use crate::kv::keys::{entity_key, search_key, search_pattern};
use crate::kv::{CacheClient, Namespace};

/// Default lifetime of memoised search results.
pub const DEFAULT_SEARCH_TTL: Duration = Duration::from_secs(300);

/// Default bound on matched catalog rows per search.
pub const DEFAULT_SEARCH_LIMIT: usize = 1000;

/// Index registry
pub struct IndexRegistry {
    client: Arc<CacheClient>,
    catalog: Arc<dyn CatalogStore>,
    search_ttl: Duration,
    search_limit: usize,
}

impl IndexRegistry {
    pub fn new(client: Arc<CacheClient>, catalog: Arc<dyn CatalogStore>) -> Self {
        Self {
            client,
            catalog,
            search_ttl: DEFAULT_SEARCH_TTL,
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }

    pub fn with_search_ttl(mut self, ttl: Duration) -> Self {
        self.search_ttl = ttl;
        self
    }

    pub fn with_search_limit(mut self, limit: usize) -> Self {
        self.search_limit = limit.max(1);
        self
    }

    /// Index rows for one record. Empty values are not indexed.
    pub fn entries_for<T: Indexed>(record: &T, now: DateTime<Utc>) -> Vec<IndexEntry> {
        let id = record.entity_id();
        let cache_key = entity_key(T::TYPE, id);
        record
            .index_values()
            .into_iter()
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(index_key, index_value)| IndexEntry {
                entity_type: T::TYPE,
                entity_id: id.to_string(),
                index_key: index_key.to_string(),
                index_value,
                cache_key: cache_key.clone(),
                updated_at: now,
            })
            .collect()
    }

    /// Upsert rows in one catalog write.
    pub async fn register(&self, entries: &[IndexEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        self.catalog.upsert_index_entries(entries).await
    }

    /// Case-insensitive substring search on one index.
    #[instrument(skip(self), fields(entity_type = %entity_type))]
    pub async fn search_by_index(
        &self,
        entity_type: EntityType,
        index_key: &str,
        value: &str,
    ) -> Result<Vec<Value>> {
        let memo_key = search_key(entity_type, index_key, value);
        let metrics = self.client.metrics();

        if let Some(cached) = self.client.get_json::<Vec<Value>>(&memo_key).await {
            metrics.record_hit(Namespace::Search);
            return Ok(cached);
        }
        metrics.record_miss(Namespace::Search);

        let rows = self
            .catalog
            .search_index(entity_type, index_key, value, self.search_limit)
            .await?;

        let resolved = join_all(
            rows.iter()
                .map(|row| self.client.get_json::<Value>(&row.cache_key)),
        )
        .await;

        let matched = rows.len();
        let results: Vec<Value> = resolved.into_iter().flatten().collect();
        for _ in results.len()..matched {
            metrics.record_stale_index_ref();
        }
        if results.len() < matched {
            debug!(
                matched,
                resolved = results.len(),
                "Dropped index rows without cache entries"
            );
        }

        if !results.is_empty() {
            self.client
                .set_json(&memo_key, &results, self.search_ttl)
                .await;
        }
        Ok(results)
    }

    /// Search and decode the hits as `T`. Undecodable hits are skipped.
    pub async fn search_typed<T: Entity>(&self, index_key: &str, value: &str) -> Result<Vec<T>> {
        let values = self.search_by_index(T::TYPE, index_key, value).await?;
        Ok(values
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    /// Remove every row of one entity.
    pub async fn remove_entity(&self, entity_type: EntityType, id: &str) -> Result<u64> {
        self.catalog.delete_index_entries(entity_type, id).await
    }

    /// Drop memoised searches of one type. Called whenever rows of that type
    /// change so no memo outlives the payloads it copied.
    pub async fn invalidate_searches(&self, entity_type: EntityType) -> u64 {
        let dropped = self.client.delete_pattern(&search_pattern(entity_type)).await;
        if dropped > 0 {
            debug!(%entity_type, dropped, "Dropped memoised searches");
        }
        dropped
    }

    pub async fn count(&self) -> Result<usize> {
        self.catalog.count_index_entries().await
    }

    /// Drop every row and memoised search.
    pub async fn clear(&self) -> Result<u64> {
        let rows = self.catalog.clear_index().await?;
        self.client.delete_pattern(&Namespace::Search.pattern()).await;
        Ok(rows)
    }
}

// =============================================================================
// Tests
// =============================================================================
