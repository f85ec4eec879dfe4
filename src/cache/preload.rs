//! Preload Orchestrator
//!
//! Bulk-loads every hierarchy collection into the KV store in fixed order
//! (divisions, sections, employees, relationships), builds the secondary
//! indexes and records sync metadata.
//!
//! Within a step the KV pipeline carrying payloads and set membership is
//! applied before the index rows pointing at them are upserted. A failed step
//! aborts the run and keeps the state earlier steps wrote. Rows are written
//! under their natural keys, so reruns converge.
//!
//! [`invalidate_all`](PreloadOrchestrator::invalidate_all) bumps a generation
//! counter. A running preload checks it before each write and stops before
//! recording metadata, so an invalidated cache never looks warm.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use super::index::IndexRegistry;
use super::jobs::JobHandle;
use super::relationships::RelationshipGraph;
use crate::config::TtlConfig;
use crate::domain::model::chrono_duration;
use crate::domain::ports::{CatalogStore, EventPublisher, KvBatch, SourceStore};
use crate::domain::{
    CacheEvent, CacheMetadata, Division, Employee, EntityType, Indexed, RelationshipEdge,
    Section, SyncLog, RELATIONSHIP_COLLECTION,
};
use crate::error::{Error, Result};
use crate::kv::keys::{all_key, entity_key, lazy_key, list_key, relationship_key};
use crate::kv::{CacheClient, Namespace};
use crate::metrics::exporter;

/// Step names in execution order.
pub const PRELOAD_STEPS: [&str; 4] = ["division", "section", "employee", "relationship"];

/// Sync type recorded in the sync log.
const SYNC_TYPE: &str = "full_preload";

/// Preload configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PreloadConfig {
    /// Rows per KV pipeline
    pub batch_size: usize,
    /// Collections that must be fresh for the cache to count as warm
    pub required_types: Vec<EntityType>,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            required_types: EntityType::HIERARCHY.to_vec(),
        }
    }
}

/// Outcome of one preload step.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepReport {
    pub step: String,
    pub records: u64,
    pub indexes: u64,
    /// Ids dropped because the source no longer has them
    pub removed: u64,
    pub duration_ms: u64,
}

/// Outcome of a full preload.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PreloadReport {
    pub sync_id: u64,
    pub triggered_by: String,
    pub steps: Vec<StepReport>,
    pub records_synced: u64,
    pub indexes_built: u64,
    pub relationships: u64,
    pub duration_ms: u64,
}

impl PreloadReport {
    fn push(&mut self, step: StepReport) {
        if step.step == RELATIONSHIP_COLLECTION {
            self.relationships = step.records;
        } else {
            self.records_synced += step.records;
        }
        self.indexes_built += step.indexes;
        self.steps.push(step);
    }
}

/// Outcome of [`PreloadOrchestrator::invalidate_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub generation: u64,
    pub metadata_rows: u64,
    pub keys_deleted: u64,
    pub index_rows: u64,
    pub relationship_rows: u64,
}

/// Wrap a step error, passing supersession through untouched.
fn step_failed(step: &'static str) -> impl FnOnce(Error) -> Error {
    move |e| match e {
        Error::PreloadSuperseded { .. } | Error::PreloadStepFailed { .. } => e,
        other => Error::PreloadStepFailed {
            step: step.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Preload orchestrator
pub struct PreloadOrchestrator {
    client: Arc<CacheClient>,
    source: Arc<dyn SourceStore>,
    catalog: Arc<dyn CatalogStore>,
    index: Arc<IndexRegistry>,
    graph: Arc<RelationshipGraph>,
    events: Arc<dyn EventPublisher>,
    ttl: TtlConfig,
    config: PreloadConfig,
    generation: AtomicU64,
}

impl PreloadOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<CacheClient>,
        source: Arc<dyn SourceStore>,
        catalog: Arc<dyn CatalogStore>,
        index: Arc<IndexRegistry>,
        graph: Arc<RelationshipGraph>,
        events: Arc<dyn EventPublisher>,
        ttl: TtlConfig,
        config: PreloadConfig,
    ) -> Self {
        Self {
            client,
            source,
            catalog,
            index,
            graph,
            events,
            ttl,
            config,
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PreloadConfig {
        &self.config
    }

    /// Invalidation generation; bumped by every `invalidate_all`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn ensure_current(&self, started: u64) -> Result<()> {
        let current = self.generation();
        if current != started {
            return Err(Error::PreloadSuperseded { started, current });
        }
        Ok(())
    }

    async fn publish(&self, event: CacheEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish cache event");
        }
    }

    // =========================================================================
    // Full Preload
    // =========================================================================

    /// Load every collection.
    pub async fn preload_all(&self, triggered_by: &str) -> Result<PreloadReport> {
        self.run(triggered_by, None).await
    }

    /// Load every collection, reporting step progress on `job`. The job is
    /// completed or failed when the run ends.
    pub async fn preload_all_with_progress(
        &self,
        triggered_by: &str,
        job: &JobHandle,
    ) -> Result<PreloadReport> {
        let result = self.run(triggered_by, Some(job)).await;
        match &result {
            Ok(_) => job.complete(),
            Err(e) => job.fail(&e.to_string()),
        }
        result
    }

    #[instrument(skip(self, job), fields(sync_id = tracing::field::Empty))]
    async fn run(&self, triggered_by: &str, job: Option<&JobHandle>) -> Result<PreloadReport> {
        let started = Instant::now();
        let generation = self.generation();

        let mut log = SyncLog::start(SYNC_TYPE, triggered_by);
        log.id = self.catalog.append_sync_log(log.clone()).await?;
        tracing::Span::current().record("sync_id", log.id);
        info!(triggered_by, "Starting full preload");
        self.publish(CacheEvent::preload_started(log.id, triggered_by))
            .await;

        let mut report = PreloadReport {
            sync_id: log.id,
            triggered_by: triggered_by.to_string(),
            ..Default::default()
        };
        let outcome = self.run_steps(generation, &mut report, job).await;
        report.duration_ms = started.elapsed().as_millis() as u64;
        exporter::PRELOAD_DURATION.observe(started.elapsed().as_secs_f64());

        log.records_synced = report.records_synced;
        log.indexes_built = report.indexes_built;
        match outcome {
            Ok(()) => {
                log.complete();
                self.record_log(&log).await;
                exporter::PRELOAD_RUNS.with_label_values(&["completed"]).inc();
                info!(
                    records = report.records_synced,
                    indexes = report.indexes_built,
                    relationships = report.relationships,
                    duration_ms = report.duration_ms,
                    "Full preload completed"
                );
                self.publish(CacheEvent::preload_completed(
                    log.id,
                    report.records_synced,
                    report.indexes_built,
                    report.relationships,
                    report.duration_ms,
                ))
                .await;
                Ok(report)
            }
            Err(e) => {
                log.fail(e.to_string());
                self.record_log(&log).await;
                let (status, step) = match &e {
                    Error::PreloadSuperseded { .. } => ("superseded", "invalidated"),
                    Error::PreloadStepFailed { step, .. } => ("failed", step.as_str()),
                    _ => ("failed", "unknown"),
                };
                exporter::PRELOAD_RUNS.with_label_values(&[status]).inc();
                error!(step, error = %e, "Full preload failed");
                self.publish(CacheEvent::preload_failed(log.id, step, &e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    async fn record_log(&self, log: &SyncLog) {
        if let Err(e) = self.catalog.update_sync_log(log).await {
            warn!(sync_id = log.id, error = %e, "Failed to update sync log");
        }
    }

    async fn run_steps(
        &self,
        generation: u64,
        report: &mut PreloadReport,
        job: Option<&JobHandle>,
    ) -> Result<()> {
        let divisions: Vec<Division> = self
            .source
            .list_divisions()
            .await
            .map_err(step_failed("division"))?;
        let step = self
            .write_collection(generation, &divisions, job)
            .await
            .map_err(step_failed("division"))?;
        self.finish_step(report, step, job).await;

        let sections: Vec<Section> = self
            .source
            .list_sections()
            .await
            .map_err(step_failed("section"))?;
        let step = self
            .write_collection(generation, &sections, job)
            .await
            .map_err(step_failed("section"))?;
        self.finish_step(report, step, job).await;

        let employees: Vec<Employee> = self
            .source
            .list_employees()
            .await
            .map_err(step_failed("employee"))?;
        let step = self
            .write_collection(generation, &employees, job)
            .await
            .map_err(step_failed("employee"))?;
        self.finish_step(report, step, job).await;

        let mut edges = RelationshipGraph::edges_from(&sections);
        edges.extend(RelationshipGraph::edges_from(&employees));
        begin(job, RELATIONSHIP_COLLECTION, edges.len() as u64);
        let step = self
            .build_relationships(generation, &edges)
            .await
            .map_err(step_failed("relationship"))?;
        self.finish_step(report, step, job).await;
        Ok(())
    }

    async fn finish_step(&self, report: &mut PreloadReport, step: StepReport, job: Option<&JobHandle>) {
        if let Some(job) = job {
            job.complete_step();
        }
        self.publish(CacheEvent::preload_step_completed(
            report.sync_id,
            &step.step,
            step.records,
            step.indexes,
            step.duration_ms,
        ))
        .await;
        info!(
            step = %step.step,
            records = step.records,
            indexes = step.indexes,
            removed = step.removed,
            duration_ms = step.duration_ms,
            "Preload step completed"
        );
        report.push(step);
    }

    /// Write one collection: payloads, `all` membership, parent mirrors,
    /// index rows, stale id removal, list snapshot, search memos, then
    /// metadata.
    async fn write_collection<T: Indexed>(
        &self,
        generation: u64,
        rows: &[T],
        job: Option<&JobHandle>,
    ) -> Result<StepReport> {
        let started = Instant::now();
        let entity_type = T::TYPE;
        let ttl = self.ttl.for_type(entity_type);
        let all = all_key(entity_type);
        let now = Utc::now();
        begin(job, entity_type.as_str(), rows.len() as u64);

        let previous: HashSet<String> = self.client.smembers(&all).await.into_iter().collect();

        let mut size_bytes = 0u64;
        let mut indexes = 0u64;
        for chunk in rows.chunks(self.config.batch_size.max(1)) {
            self.ensure_current(generation)?;

            let mut batch = KvBatch::new();
            let mut ids = Vec::with_capacity(chunk.len());
            let mut entries = Vec::new();
            let mut mirrors: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for row in chunk {
                let id = row.entity_id();
                let payload = serde_json::to_string(row)?;
                size_bytes += payload.len() as u64;
                batch.set_ex(entity_key(entity_type, id), payload, ttl);
                ids.push(id.to_string());
                entries.extend(IndexRegistry::entries_for(row, now));
                for link in row.parent_links() {
                    mirrors
                        .entry(relationship_key(link.parent_type, &link.parent_id, entity_type))
                        .or_default()
                        .push(id.to_string());
                }
            }
            batch.sadd(all.clone(), ids);
            for (key, members) in mirrors {
                batch
                    .sadd(key.clone(), members)
                    .expire(key, self.ttl.relationship_ttl);
            }

            self.apply(batch, entity_type).await?;
            indexes += self.index.register(&entries).await? as u64;
            if let Some(job) = job {
                job.advance(chunk.len() as u64);
            }
        }

        // Drop ids the source no longer returns
        let current: HashSet<&str> = rows.iter().map(|r| r.entity_id()).collect();
        let stale: Vec<String> = previous
            .into_iter()
            .filter(|id| !current.contains(id.as_str()))
            .collect();
        let ids: Vec<&str> = rows.iter().map(|r| r.entity_id()).collect();

        self.ensure_current(generation)?;
        let mut batch = KvBatch::new();
        batch
            .srem(all.clone(), stale.clone())
            .del(stale.iter().map(|id| entity_key(entity_type, id)).collect())
            .set_ex(list_key(entity_type), serde_json::to_string(&ids)?, ttl)
            .expire(all.clone(), ttl);
        self.apply(batch, entity_type).await?;
        for id in &stale {
            self.index.remove_entity(entity_type, id).await?;
        }
        if !stale.is_empty() {
            debug!(%entity_type, removed = stale.len(), "Removed ids missing from source");
        }
        self.index.invalidate_searches(entity_type).await;

        self.write_metadata(generation, entity_type.as_str(), all, rows.len() as u64, size_bytes, ttl)
            .await?;

        Ok(StepReport {
            step: entity_type.as_str().to_string(),
            records: rows.len() as u64,
            indexes,
            removed: stale.len() as u64,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Final step: persist the edges and re-assert every mirror.
    async fn build_relationships(
        &self,
        generation: u64,
        edges: &[RelationshipEdge],
    ) -> Result<StepReport> {
        let started = Instant::now();
        self.ensure_current(generation)?;

        self.graph.store_edges(edges).await?;
        self.ensure_current(generation)?;
        let sync = self.graph.sync_mirrors(edges).await;
        if !sync.applied {
            return Err(Error::BackendUnavailable(
                "relationship mirror pipeline rejected".to_string(),
            ));
        }

        self.write_metadata(
            generation,
            RELATIONSHIP_COLLECTION,
            Namespace::Relationship.pattern(),
            edges.len() as u64,
            0,
            self.ttl.relationship_ttl,
        )
        .await?;

        Ok(StepReport {
            step: RELATIONSHIP_COLLECTION.to_string(),
            records: edges.len() as u64,
            indexes: 0,
            removed: sync.stale_removed,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn apply(&self, batch: KvBatch, entity_type: EntityType) -> Result<()> {
        if self.client.execute(batch).await {
            Ok(())
        } else {
            Err(Error::BackendUnavailable(format!(
                "{} pipeline rejected",
                entity_type
            )))
        }
    }

    async fn write_metadata(
        &self,
        generation: u64,
        collection: &str,
        cache_key: String,
        record_count: u64,
        size_bytes: u64,
        ttl: Duration,
    ) -> Result<()> {
        self.ensure_current(generation)?;
        let version = self
            .catalog
            .get_metadata(collection)
            .await?
            .map(|m| m.version + 1)
            .unwrap_or(1);
        let now = Utc::now();
        self.catalog
            .upsert_metadata(CacheMetadata {
                cache_key,
                entity_type: collection.to_string(),
                record_count,
                size_bytes,
                last_sync_at: now,
                expires_at: now + chrono_duration(ttl),
                version,
                is_valid: true,
            })
            .await?;

        // An invalidation may have landed between the check and the upsert
        if let Err(e) = self.ensure_current(generation) {
            self.catalog.invalidate_metadata().await?;
            return Err(e);
        }
        Ok(())
    }

    // =========================================================================
    // Warmth and Invalidation
    // =========================================================================

    /// Every required collection has valid, unexpired metadata.
    pub async fn is_cache_warm(&self) -> bool {
        let now = Utc::now();
        for entity_type in &self.config.required_types {
            match self.catalog.get_metadata(entity_type.as_str()).await {
                Ok(Some(meta)) if meta.is_fresh(now) => {}
                Ok(_) => return false,
                Err(e) => {
                    warn!(error = %e, "Cannot read cache metadata");
                    return false;
                }
            }
        }
        true
    }

    /// Invalidate metadata and drop every preloaded key, index row and edge.
    #[instrument(skip(self))]
    pub async fn invalidate_all(&self) -> Result<InvalidationReport> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let metadata_rows = self.catalog.invalidate_metadata().await?;

        let mut keys_deleted = 0;
        for namespace in [Namespace::Cache, Namespace::Relationship, Namespace::Search] {
            keys_deleted += self.client.delete_pattern(&namespace.pattern()).await;
        }
        let index_rows = self.catalog.clear_index().await?;
        let relationship_rows = self.catalog.clear_relationships().await?;

        info!(
            generation,
            metadata_rows, keys_deleted, index_rows, relationship_rows, "Invalidated cache"
        );
        self.publish(CacheEvent::cache_invalidated(keys_deleted, metadata_rows))
            .await;
        Ok(InvalidationReport {
            generation,
            metadata_rows,
            keys_deleted,
            index_rows,
            relationship_rows,
        })
    }

    // =========================================================================
    // Single Entity Refresh
    // =========================================================================

    /// Re-read one row and rewrite its entry, index rows and parent mirrors,
    /// or remove them if the source no longer has it. Returns whether the
    /// entity still exists.
    #[instrument(skip(self))]
    pub async fn refresh_entity(&self, entity_type: EntityType, id: &str) -> Result<bool> {
        let fetched = match entity_type {
            EntityType::Attendance => {
                return Err(Error::Config(
                    "attendance records are streamed, not preloaded".to_string(),
                ))
            }
            _ => self.source.fetch_entity(entity_type, id).await?,
        };
        let previous: Option<Value> = self.client.get_json(&entity_key(entity_type, id)).await;

        let exists = match entity_type {
            EntityType::Division => self.refresh_typed::<Division>(id, previous, fetched).await?,
            EntityType::Section => self.refresh_typed::<Section>(id, previous, fetched).await?,
            _ => self.refresh_typed::<Employee>(id, previous, fetched).await?,
        };

        self.publish(CacheEvent::entity_refreshed(entity_type.as_str(), id, !exists))
            .await;
        Ok(exists)
    }

    async fn refresh_typed<T: Indexed>(
        &self,
        id: &str,
        previous: Option<Value>,
        fetched: Option<Value>,
    ) -> Result<bool> {
        let entity_type = T::TYPE;
        let record: Option<T> = fetched.map(serde_json::from_value).transpose()?;
        let old_links = previous
            .and_then(|v| serde_json::from_value::<T>(v).ok())
            .map(|r| r.parent_links())
            .unwrap_or_default();
        let new_links = record.as_ref().map(|r| r.parent_links()).unwrap_or_default();

        let mut batch = KvBatch::new();
        for link in old_links.iter().filter(|l| !new_links.contains(l)) {
            batch.srem(
                relationship_key(link.parent_type, &link.parent_id, entity_type),
                vec![id.to_string()],
            );
        }
        batch.del(vec![lazy_key(entity_type, id)]);

        let key = entity_key(entity_type, id);
        let all = all_key(entity_type);
        match &record {
            Some(row) => {
                let ttl = self.ttl.for_type(entity_type);
                batch
                    .set_ex(key, serde_json::to_string(row)?, ttl)
                    .sadd(all, vec![id.to_string()]);
                for link in &new_links {
                    let mirror = relationship_key(link.parent_type, &link.parent_id, entity_type);
                    batch
                        .sadd(mirror.clone(), vec![id.to_string()])
                        .expire(mirror, self.ttl.relationship_ttl);
                }
            }
            None => {
                batch.del(vec![key]).srem(all, vec![id.to_string()]);
            }
        }

        if !self.client.execute(batch).await {
            warn!(%entity_type, id, "Refresh not applied to KV backend");
        }

        self.index.remove_entity(entity_type, id).await?;
        self.catalog
            .delete_relationships_for_child(entity_type, id)
            .await?;
        if let Some(row) = &record {
            self.index
                .register(&IndexRegistry::entries_for(row, Utc::now()))
                .await?;
            let edges = RelationshipGraph::edges_from(std::slice::from_ref(row));
            if !edges.is_empty() {
                self.catalog.upsert_relationships(&edges).await?;
            }
        }
        self.index.invalidate_searches(entity_type).await;
        Ok(record.is_some())
    }
}

fn begin(job: Option<&JobHandle>, step: &str, items: u64) {
    if let Some(job) = job {
        job.begin_step(step, items);
    }
}

// =============================================================================
// Tests
// =============================================================================
