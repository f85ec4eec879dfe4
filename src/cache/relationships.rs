//! Relationship Graph
//!
//! Parent to child edges of the organizational hierarchy. The catalog table
//! is durable; each parent's children are mirrored in a KV set
//! `rel:{parent}:{id}:{child}s` for hot-path traversal. A missing mirror
//! reads as no children; only rebuild flows go back to the table.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::domain::ports::{CatalogStore, KvBatch};
use crate::domain::{Entity, EntityType, Indexed, RelationshipEdge};
use crate::error::Result;
use crate::kv::keys::{entity_key, relationship_key};
use crate::kv::{CacheClient, Namespace};

/// Default lifetime of relationship mirrors.
pub const DEFAULT_MIRROR_TTL: Duration = Duration::from_secs(86_400);

/// Outcome of re-asserting the KV mirrors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorSync {
    /// Mirror sets written
    pub mirrors: usize,
    /// `rel:` keys removed because no edge backs them
    pub stale_removed: u64,
    /// Whether the pipeline was applied
    pub applied: bool,
}

/// Relationship graph
pub struct RelationshipGraph {
    client: Arc<CacheClient>,
    catalog: Arc<dyn CatalogStore>,
    mirror_ttl: Duration,
}

impl RelationshipGraph {
    pub fn new(client: Arc<CacheClient>, catalog: Arc<dyn CatalogStore>) -> Self {
        Self {
            client,
            catalog,
            mirror_ttl: DEFAULT_MIRROR_TTL,
        }
    }

    pub fn with_mirror_ttl(mut self, ttl: Duration) -> Self {
        self.mirror_ttl = ttl;
        self
    }

    pub fn mirror_ttl(&self) -> Duration {
        self.mirror_ttl
    }

    /// Edges from each record to its parents.
    pub fn edges_from<T: Indexed>(records: &[T]) -> Vec<RelationshipEdge> {
        records
            .iter()
            .flat_map(|record| {
                record.parent_links().into_iter().map(move |link| {
                    RelationshipEdge::new(
                        link.parent_type,
                        link.parent_id,
                        T::TYPE,
                        record.entity_id(),
                    )
                })
            })
            .collect()
    }

    /// Make the durable table equal `edges`.
    ///
    /// Upserts are enough when nothing was removed; otherwise the table is
    /// cleared first so dropped edges disappear.
    pub async fn store_edges(&self, edges: &[RelationshipEdge]) -> Result<usize> {
        let wanted: HashSet<&RelationshipEdge> = edges.iter().collect();
        let existing = self.catalog.list_relationships().await?;
        let stale = existing.iter().filter(|e| !wanted.contains(e)).count();
        if stale > 0 {
            debug!(stale, "Replacing relationship table");
            self.catalog.clear_relationships().await?;
        }
        if edges.is_empty() {
            return Ok(0);
        }
        self.catalog.upsert_relationships(edges).await
    }

    /// Rewrite every mirror from `edges` and drop `rel:` keys without edges.
    pub async fn sync_mirrors(&self, edges: &[RelationshipEdge]) -> MirrorSync {
        let mut grouped: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for edge in edges {
            grouped
                .entry(relationship_key(edge.parent_type, &edge.parent_id, edge.child_type))
                .or_default()
                .insert(edge.child_id.clone());
        }

        let stale: Vec<String> = self
            .client
            .keys(&Namespace::Relationship.pattern())
            .await
            .into_iter()
            .filter(|key| !grouped.contains_key(key))
            .collect();

        let mut batch = KvBatch::new();
        for (key, children) in &grouped {
            batch
                .del(vec![key.clone()])
                .sadd(key.clone(), children.iter().cloned().collect())
                .expire(key.clone(), self.mirror_ttl);
        }
        batch.del(stale.clone());

        let applied = self.client.execute(batch).await;
        MirrorSync {
            mirrors: grouped.len(),
            stale_removed: if applied { stale.len() as u64 } else { 0 },
            applied,
        }
    }

    /// Children of one parent, resolved through their cache entries.
    ///
    /// Children whose entry is gone are dropped.
    pub async fn get_children(
        &self,
        parent_type: EntityType,
        parent_id: &str,
        child_type: EntityType,
    ) -> Vec<Value> {
        let mut ids = self
            .client
            .smembers(&relationship_key(parent_type, parent_id, child_type))
            .await;
        if ids.is_empty() {
            return Vec::new();
        }
        ids.sort();

        let resolved = join_all(ids.iter().map(|id| {
            let key = entity_key(child_type, id);
            async move { self.client.get_json::<Value>(&key).await }
        }))
        .await;

        let total = resolved.len();
        let children: Vec<Value> = resolved.into_iter().flatten().collect();
        for _ in children.len()..total {
            self.client.metrics().record_stale_child();
        }
        children
    }

    pub async fn get_children_typed<T: Entity>(
        &self,
        parent_type: EntityType,
        parent_id: &str,
    ) -> Vec<T> {
        self.get_children(parent_type, parent_id, T::TYPE)
            .await
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect()
    }

    /// Restore every mirror from the durable table.
    #[instrument(skip(self))]
    pub async fn rebuild_mirrors(&self) -> Result<usize> {
        let edges = self.catalog.list_relationships().await?;
        let sync = self.sync_mirrors(&edges).await;
        info!(
            edges = edges.len(),
            mirrors = sync.mirrors,
            applied = sync.applied,
            "Rebuilt relationship mirrors"
        );
        Ok(if sync.applied { sync.mirrors } else { 0 })
    }

    pub async fn count(&self) -> Result<usize> {
        self.catalog.count_relationships().await
    }

    /// Drop the table and every mirror.
    pub async fn clear(&self) -> Result<u64> {
        let rows = self.catalog.clear_relationships().await?;
        self.client
            .delete_pattern(&Namespace::Relationship.pattern())
            .await;
        Ok(rows)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryCatalog, MemoryKvStore};
    use crate::domain::Section;
    use crate::kv::KvConfig;

    fn section(id: &str, division: &str) -> Section {
        Section {
            id: id.to_string(),
            code: id.to_string(),
            name: format!("Section {}", id),
            division_id: division.to_string(),
            is_active: true,
        }
    }

    async fn graph() -> (Arc<CacheClient>, RelationshipGraph) {
        let client = Arc::new(CacheClient::new(
            Arc::new(MemoryKvStore::new()),
            KvConfig::default(),
        ));
        client.connect().await;
        let graph = RelationshipGraph::new(client.clone(), Arc::new(MemoryCatalog::new()));
        (client, graph)
    }

    #[test]
    fn test_edges_from_parent_links() {
        let edges = RelationshipGraph::edges_from(&[section("S1", "D1"), section("S2", "D1")]);
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].relationship_type, "division_section");
        assert_eq!(edges[1].child_id, "S2");
    }

    #[tokio::test]
    async fn test_children_resolve_through_cache() {
        let (client, graph) = graph().await;
        let sections = [section("S1", "D1"), section("S2", "D1")];
        for s in &sections {
            client
                .set_json(&entity_key(EntityType::Section, &s.id), s, Duration::from_secs(60))
                .await;
        }
        let edges = RelationshipGraph::edges_from(&sections);
        graph.store_edges(&edges).await.unwrap();
        assert!(graph.sync_mirrors(&edges).await.applied);

        let children: Vec<Section> = graph.get_children_typed(EntityType::Division, "D1").await;
        assert_eq!(children, sections.to_vec());

        client.del(&["cache:section:S2".to_string()]).await;
        let children = graph
            .get_children(EntityType::Division, "D1", EntityType::Section)
            .await;
        assert_eq!(children.len(), 1);
        assert_eq!(client.metrics().snapshot().stale_children, 1);
    }

    #[tokio::test]
    async fn test_missing_mirror_reads_empty() {
        let (_client, graph) = graph().await;
        assert!(graph
            .get_children(EntityType::Division, "D9", EntityType::Section)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_sync_replaces_membership_and_drops_stale() {
        let (client, graph) = graph().await;
        let first = RelationshipGraph::edges_from(&[section("S1", "D1"), section("S2", "D2")]);
        graph.sync_mirrors(&first).await;

        let second = RelationshipGraph::edges_from(&[section("S1", "D1"), section("S3", "D1")]);
        let sync = graph.sync_mirrors(&second).await;
        assert_eq!(sync.mirrors, 1);
        assert_eq!(sync.stale_removed, 1);

        let mut members = client.smembers("rel:division:D1:sections").await;
        members.sort();
        assert_eq!(members, vec!["S1", "S3"]);
        assert!(client.smembers("rel:division:D2:sections").await.is_empty());
    }

    #[tokio::test]
    async fn test_store_edges_removes_dropped_rows() {
        let (_client, graph) = graph().await;
        graph
            .store_edges(&RelationshipGraph::edges_from(&[section("S1", "D1"), section("S2", "D1")]))
            .await
            .unwrap();
        graph
            .store_edges(&RelationshipGraph::edges_from(&[section("S1", "D1")]))
            .await
            .unwrap();
        assert_eq!(graph.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_from_table() {
        let (client, graph) = graph().await;
        let edges = RelationshipGraph::edges_from(&[section("S1", "D1")]);
        graph.store_edges(&edges).await.unwrap();

        assert_eq!(graph.rebuild_mirrors().await.unwrap(), 1);
        assert_eq!(client.smembers("rel:division:D1:sections").await, vec!["S1"]);

        graph.clear().await.unwrap();
        assert!(client.smembers("rel:division:D1:sections").await.is_empty());
        assert_eq!(graph.count().await.unwrap(), 0);
    }
}
