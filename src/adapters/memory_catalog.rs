//! In-Memory Catalog
//!
//! `CatalogStore` holding the durable index, relationship, metadata, sync log
//! and performance report tables in process memory. Upserts are keyed by the
//! rows' natural identifiers, so concurrent writers converge
//! last-write-wins.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;

use crate::domain::model::{
    CacheMetadata, EntityType, IndexEntry, PerformanceReport, RelationshipEdge, SyncLog,
};
use crate::domain::ports::CatalogStore;
use crate::error::{Error, Result};

/// Performance reports kept before the oldest are dropped.
const MAX_PERFORMANCE_REPORTS: usize = 1000;

type IndexKey = (EntityType, String, String);

/// In-memory catalog
pub struct MemoryCatalog {
    index: DashMap<IndexKey, IndexEntry>,
    relationships: DashSet<RelationshipEdge>,
    metadata: DashMap<String, CacheMetadata>,
    sync_logs: RwLock<Vec<SyncLog>>,
    next_sync_id: AtomicU64,
    reports: RwLock<VecDeque<PerformanceReport>>,
    /// Failure injection: every call errors while set
    unavailable: AtomicBool,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self {
            index: DashMap::new(),
            relationships: DashSet::new(),
            metadata: DashMap::new(),
            sync_logs: RwLock::new(Vec::new()),
            next_sync_id: AtomicU64::new(1),
            reports: RwLock::new(VecDeque::new()),
            unavailable: AtomicBool::new(false),
        }
    }
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Catalog("catalog marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn upsert_index_entries(&self, entries: &[IndexEntry]) -> Result<usize> {
        self.check()?;
        for entry in entries {
            self.index.insert(entry.natural_key(), entry.clone());
        }
        Ok(entries.len())
    }

    async fn search_index(
        &self,
        entity_type: EntityType,
        index_key: &str,
        search_value: &str,
        limit: usize,
    ) -> Result<Vec<IndexEntry>> {
        self.check()?;
        let needle = search_value.trim().to_lowercase();
        let mut matches: Vec<IndexEntry> = self
            .index
            .iter()
            .filter(|row| {
                let entry = row.value();
                entry.entity_type == entity_type
                    && entry.index_key == index_key
                    && entry.index_value.to_lowercase().contains(&needle)
            })
            .map(|row| row.value().clone())
            .collect();
        matches.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn delete_index_entries(&self, entity_type: EntityType, entity_id: &str) -> Result<u64> {
        self.check()?;
        let before = self.index.len();
        self.index
            .retain(|(ty, id, _), _| !(*ty == entity_type && id == entity_id));
        Ok((before - self.index.len()) as u64)
    }

    async fn count_index_entries(&self) -> Result<usize> {
        self.check()?;
        Ok(self.index.len())
    }

    async fn clear_index(&self) -> Result<u64> {
        self.check()?;
        let count = self.index.len() as u64;
        self.index.clear();
        Ok(count)
    }

    async fn upsert_relationships(&self, edges: &[RelationshipEdge]) -> Result<usize> {
        self.check()?;
        for edge in edges {
            self.relationships.insert(edge.clone());
        }
        Ok(edges.len())
    }

    async fn list_relationships(&self) -> Result<Vec<RelationshipEdge>> {
        self.check()?;
        let mut edges: Vec<RelationshipEdge> =
            self.relationships.iter().map(|e| e.key().clone()).collect();
        edges.sort();
        Ok(edges)
    }

    async fn delete_relationships_for_child(
        &self,
        child_type: EntityType,
        child_id: &str,
    ) -> Result<u64> {
        self.check()?;
        let before = self.relationships.len();
        self.relationships
            .retain(|edge| !(edge.child_type == child_type && edge.child_id == child_id));
        Ok((before - self.relationships.len()) as u64)
    }

    async fn count_relationships(&self) -> Result<usize> {
        self.check()?;
        Ok(self.relationships.len())
    }

    async fn clear_relationships(&self) -> Result<u64> {
        self.check()?;
        let count = self.relationships.len() as u64;
        self.relationships.clear();
        Ok(count)
    }

    async fn upsert_metadata(&self, metadata: CacheMetadata) -> Result<()> {
        self.check()?;
        self.metadata.insert(metadata.entity_type.clone(), metadata);
        Ok(())
    }

    async fn get_metadata(&self, entity_type: &str) -> Result<Option<CacheMetadata>> {
        self.check()?;
        Ok(self.metadata.get(entity_type).map(|m| m.value().clone()))
    }

    async fn list_metadata(&self) -> Result<Vec<CacheMetadata>> {
        self.check()?;
        let mut rows: Vec<CacheMetadata> = self.metadata.iter().map(|m| m.value().clone()).collect();
        rows.sort_by(|a, b| a.entity_type.cmp(&b.entity_type));
        Ok(rows)
    }

    async fn invalidate_metadata(&self) -> Result<u64> {
        self.check()?;
        let mut touched = 0;
        for mut row in self.metadata.iter_mut() {
            row.is_valid = false;
            row.version += 1;
            touched += 1;
        }
        Ok(touched)
    }

    async fn append_sync_log(&self, mut log: SyncLog) -> Result<u64> {
        self.check()?;
        let id = self.next_sync_id.fetch_add(1, Ordering::SeqCst);
        log.id = id;
        self.sync_logs.write().push(log);
        Ok(id)
    }

    async fn update_sync_log(&self, log: &SyncLog) -> Result<()> {
        self.check()?;
        let mut logs = self.sync_logs.write();
        match logs.iter_mut().find(|l| l.id == log.id) {
            Some(existing) => {
                *existing = log.clone();
                Ok(())
            }
            None => Err(Error::Catalog(format!("Sync log {} not found", log.id))),
        }
    }

    async fn recent_sync_logs(&self, limit: usize) -> Result<Vec<SyncLog>> {
        self.check()?;
        Ok(self
            .sync_logs
            .read()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn append_performance_report(&self, report: PerformanceReport) -> Result<()> {
        self.check()?;
        let mut reports = self.reports.write();
        reports.push_back(report);
        while reports.len() > MAX_PERFORMANCE_REPORTS {
            reports.pop_front();
        }
        Ok(())
    }

    async fn recent_performance_reports(&self, limit: usize) -> Result<Vec<PerformanceReport>> {
        self.check()?;
        Ok(self.reports.read().iter().rev().take(limit).cloned().collect())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(id: &str, key: &str, value: &str) -> IndexEntry {
        IndexEntry {
            entity_type: EntityType::Employee,
            entity_id: id.to_string(),
            index_key: key.to_string(),
            index_value: value.to_string(),
            cache_key: format!("cache:employee:{}", id),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_index_upsert_is_idempotent() {
        let catalog = MemoryCatalog::new();
        catalog
            .upsert_index_entries(&[entry("E1", "name", "Ada"), entry("E1", "email", "ada@x")])
            .await
            .unwrap();
        catalog
            .upsert_index_entries(&[entry("E1", "name", "Ada Lovelace")])
            .await
            .unwrap();

        assert_eq!(catalog.count_index_entries().await.unwrap(), 2);
        let hits = catalog
            .search_index(EntityType::Employee, "name", "LOVE", 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].index_value, "Ada Lovelace");
    }

    #[tokio::test]
    async fn test_search_limit_and_delete() {
        let catalog = MemoryCatalog::new();
        let rows: Vec<_> = (0..5)
            .map(|i| entry(&format!("E{}", i), "name", "Grace"))
            .collect();
        catalog.upsert_index_entries(&rows).await.unwrap();

        let hits = catalog
            .search_index(EntityType::Employee, "name", "gra", 3)
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].entity_id, "E0");

        assert_eq!(
            catalog.delete_index_entries(EntityType::Employee, "E0").await.unwrap(),
            1
        );
        assert_eq!(catalog.count_index_entries().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_relationship_uniqueness() {
        let catalog = MemoryCatalog::new();
        let edge = RelationshipEdge::new(EntityType::Division, "D1", EntityType::Section, "S1");
        catalog.upsert_relationships(&[edge.clone()]).await.unwrap();
        catalog.upsert_relationships(&[edge]).await.unwrap();
        assert_eq!(catalog.count_relationships().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_relationships_for_child() {
        let catalog = MemoryCatalog::new();
        catalog
            .upsert_relationships(&[
                RelationshipEdge::new(EntityType::Division, "D1", EntityType::Employee, "E1"),
                RelationshipEdge::new(EntityType::Section, "S1", EntityType::Employee, "E1"),
                RelationshipEdge::new(EntityType::Section, "S1", EntityType::Employee, "E2"),
            ])
            .await
            .unwrap();

        assert_eq!(
            catalog
                .delete_relationships_for_child(EntityType::Employee, "E1")
                .await
                .unwrap(),
            2
        );
        let left = catalog.list_relationships().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].child_id, "E2");
    }

    #[tokio::test]
    async fn test_invalidate_metadata_bumps_version() {
        let catalog = MemoryCatalog::new();
        let now = Utc::now();
        catalog
            .upsert_metadata(CacheMetadata {
                cache_key: "cache:division:all".into(),
                entity_type: "division".into(),
                record_count: 2,
                size_bytes: 100,
                last_sync_at: now,
                expires_at: now + chrono::Duration::hours(1),
                version: 3,
                is_valid: true,
            })
            .await
            .unwrap();

        assert_eq!(catalog.invalidate_metadata().await.unwrap(), 1);
        let row = catalog.get_metadata("division").await.unwrap().unwrap();
        assert!(!row.is_valid);
        assert_eq!(row.version, 4);
    }

    #[tokio::test]
    async fn test_sync_log_ids_and_updates() {
        let catalog = MemoryCatalog::new();
        let id = catalog
            .append_sync_log(SyncLog::start("full_preload", "test"))
            .await
            .unwrap();

        let mut log = catalog.recent_sync_logs(1).await.unwrap().remove(0);
        assert_eq!(log.id, id);
        log.complete();
        catalog.update_sync_log(&log).await.unwrap();

        let stored = catalog.recent_sync_logs(1).await.unwrap().remove(0);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_unavailable_catalog() {
        let catalog = MemoryCatalog::new();
        catalog.set_unavailable(true);
        assert!(matches!(
            catalog.count_index_entries().await,
            Err(Error::Catalog(_))
        ));
    }
}
