//! Cache Service
//!
//! Explicitly constructed context that wires the KV client, the ports and
//! every cache component together. Request handlers, the scheduler and the
//! ops server all hold an `Arc<CacheService>`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::evictor::Evictor;
use super::index::IndexRegistry;
use super::jobs::{JobKind, JobStatus, JobTracker, PreloadJob};
use super::lazy::LazyLoader;
use super::preload::PreloadOrchestrator;
use super::relationships::RelationshipGraph;
use super::report::{ReportCache, ReportCacheStats};
use super::usage::UsageTracker;
use crate::config::CacheConfig;
use crate::domain::ports::{CatalogStore, EventPublisher, KvStore, MemoryInfo, SourceStore};
use crate::domain::{AttendanceRecord, CacheMetadata, Entity, EntityType, PerformanceReport};
use crate::error::{Error, Result};
use crate::kv::keys::{entity_key, lazy_key, parse_usage_key};
use crate::kv::{CacheClient, Namespace};
use crate::metrics::{CacheMetrics, MetricsSnapshot};

/// Point-in-time view of the cache layer.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub backend: &'static str,
    pub enabled: bool,
    pub connected: bool,
    pub warm: bool,
    pub memory: Option<MemoryInfo>,
    pub metadata: Vec<CacheMetadata>,
    pub index_entries: usize,
    pub relationships: usize,
    pub tracked_usage_keys: usize,
    pub metrics: MetricsSnapshot,
    pub reports: ReportCacheStats,
    pub latest_preload: Option<PreloadJob>,
}

/// Cache service context
pub struct CacheService {
    config: CacheConfig,
    client: Arc<CacheClient>,
    source: Arc<dyn SourceStore>,
    catalog: Arc<dyn CatalogStore>,
    usage: Arc<UsageTracker>,
    index: Arc<IndexRegistry>,
    graph: Arc<RelationshipGraph>,
    lazy: LazyLoader,
    evictor: Evictor,
    preload: Arc<PreloadOrchestrator>,
    reports: ReportCache,
    jobs: Arc<JobTracker>,
}

impl CacheService {
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn KvStore>,
        source: Arc<dyn SourceStore>,
        catalog: Arc<dyn CatalogStore>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        let client = Arc::new(
            CacheClient::new(store, config.kv.clone()).with_metrics(Arc::new(CacheMetrics::new())),
        );
        let usage = Arc::new(UsageTracker::new(config.dynamic_ttl.clone()));
        let index = Arc::new(
            IndexRegistry::new(client.clone(), catalog.clone())
                .with_search_ttl(config.ttl.search_ttl)
                .with_search_limit(config.search_limit),
        );
        let graph = Arc::new(
            RelationshipGraph::new(client.clone(), catalog.clone())
                .with_mirror_ttl(config.ttl.relationship_ttl),
        );
        let lazy = LazyLoader::new(client.clone(), usage.clone());
        let evictor = Evictor::new(
            client.clone(),
            usage.clone(),
            config.eviction.clone(),
            events.clone(),
        );
        let preload = Arc::new(PreloadOrchestrator::new(
            client.clone(),
            source.clone(),
            catalog.clone(),
            index.clone(),
            graph.clone(),
            events,
            config.ttl.clone(),
            config.preload.clone(),
        ));
        let reports = ReportCache::new(client.clone())
            .with_source(source.clone())
            .with_default_ttl(config.report_ttl);

        Self {
            config,
            client,
            source,
            catalog,
            usage,
            index,
            graph,
            lazy,
            evictor,
            preload,
            reports,
            jobs: JobTracker::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<CacheClient> {
        &self.client
    }

    pub fn source(&self) -> &Arc<dyn SourceStore> {
        &self.source
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.catalog
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    pub fn index(&self) -> &IndexRegistry {
        &self.index
    }

    pub fn graph(&self) -> &RelationshipGraph {
        &self.graph
    }

    pub fn lazy(&self) -> &LazyLoader {
        &self.lazy
    }

    pub fn evictor(&self) -> &Evictor {
        &self.evictor
    }

    pub fn preload(&self) -> &Arc<PreloadOrchestrator> {
        &self.preload
    }

    pub fn reports(&self) -> &ReportCache {
        &self.reports
    }

    pub fn jobs(&self) -> &Arc<JobTracker> {
        &self.jobs
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connect the KV client and restore the persisted usage snapshot.
    pub async fn connect(&self) -> bool {
        let connected = self.client.connect().await;
        if connected {
            let restored = self.usage.load(&self.client).await;
            if restored > 0 {
                info!(restored, "Restored usage counters");
            }
        }
        connected
    }

    /// Persist usage counters and disconnect.
    pub async fn shutdown(&self) {
        if !self.usage.persist(&self.client).await {
            debug!("Usage snapshot not persisted");
        }
        self.client.disconnect().await;
    }

    // =========================================================================
    // Preload
    // =========================================================================

    /// Start a full preload in the background, or join the one running.
    pub fn trigger_preload(&self, triggered_by: &str) -> Result<(PreloadJob, bool)> {
        let (job, is_new) = self.jobs.start_job(JobKind::FullPreload, triggered_by);
        if !is_new {
            debug!(job_id = %job.id, "Joined running preload");
            return Ok((job, false));
        }

        let handle = self.jobs.handle(&job.id)?;
        let preload = self.preload.clone();
        let triggered_by = triggered_by.to_string();
        tokio::spawn(async move {
            if let Err(e) = preload
                .preload_all_with_progress(&triggered_by, &handle)
                .await
            {
                warn!(job_id = handle.id(), error = %e, "Background preload failed");
            }
        });
        Ok((job, true))
    }

    /// Preload unless the cache is already warm. Waits for the run to end.
    ///
    /// Returns whether a preload ran.
    pub async fn ensure_warm(&self, triggered_by: &str) -> Result<bool> {
        if self.preload.is_cache_warm().await {
            return Ok(false);
        }

        let (job, _) = self.trigger_preload(triggered_by)?;
        self.wait_for_job(&job.id).await?;
        Ok(true)
    }

    /// Run a full preload in the caller's task and wait for it. Joins the
    /// run already in flight instead of starting a second one.
    pub async fn preload_now(&self, triggered_by: &str) -> Result<PreloadJob> {
        let (job, is_new) = self.jobs.start_job(JobKind::FullPreload, triggered_by);
        if is_new {
            let handle = self.jobs.handle(&job.id)?;
            self.preload
                .preload_all_with_progress(triggered_by, &handle)
                .await?;
        } else {
            debug!(job_id = %job.id, "Waiting on running preload");
        }
        self.wait_for_job(&job.id).await
    }

    /// Wait for a job to reach a terminal state. Anything but completion is
    /// an error.
    async fn wait_for_job(&self, id: &str) -> Result<PreloadJob> {
        let mut rx = self.jobs.subscribe(id)?;
        let done = rx
            .wait_for(|j| j.status.is_terminal())
            .await
            .map_err(|_| Error::Internal(format!("job {} dropped", id)))?
            .clone();

        match done.status {
            JobStatus::Completed => Ok(done),
            _ => Err(Error::Internal(format!(
                "preload {} ended {:?}: {}",
                done.id,
                done.status,
                done.error.unwrap_or_default()
            ))),
        }
    }

    pub async fn is_cache_warm(&self) -> bool {
        self.preload.is_cache_warm().await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Entity by id: preloaded entry first, then the lazy tier, then the
    /// source.
    pub async fn get_entity(&self, entity_type: EntityType, id: &str) -> Result<Option<Value>> {
        if let Some(value) = self.client.get_json::<Value>(&entity_key(entity_type, id)).await {
            self.usage.record(entity_type, id);
            self.client.metrics().record_hit(Namespace::Cache);
            return Ok(Some(value));
        }
        self.client.metrics().record_miss(Namespace::Cache);

        let source = self.source.clone();
        self.lazy
            .lazy_load(entity_type, id, || async move {
                source.fetch_entity(entity_type, id).await
            })
            .await
    }

    /// Typed variant of [`get_entity`](Self::get_entity).
    pub async fn get<T: Entity>(&self, id: &str) -> Result<Option<T>> {
        Ok(self
            .get_entity(T::TYPE, id)
            .await?
            .map(serde_json::from_value)
            .transpose()?)
    }

    pub async fn search(
        &self,
        entity_type: EntityType,
        index_key: &str,
        value: &str,
    ) -> Result<Vec<Value>> {
        self.index.search_by_index(entity_type, index_key, value).await
    }

    pub async fn children(
        &self,
        parent_type: EntityType,
        parent_id: &str,
        child_type: EntityType,
    ) -> Vec<Value> {
        self.graph
            .get_children(parent_type, parent_id, child_type)
            .await
    }

    /// Attendance facts in pages of `batch_size`.
    pub fn stream_attendance(
        &self,
        batch_size: usize,
    ) -> impl Stream<Item = Result<Vec<AttendanceRecord>>> + Send + 'static {
        let source = self.source.clone();
        self.lazy.streaming_load(
            move |offset, limit| {
                let source = source.clone();
                async move { source.fetch_attendance_page(offset, limit).await }
            },
            batch_size,
        )
    }

    // =========================================================================
    // Maintenance Support
    // =========================================================================

    /// Re-fetch the `n` most accessed entities into the lazy tier.
    ///
    /// Runs as a `Warmup` job; returns the number of entries written, or 0
    /// when another warm-up is already running.
    #[instrument(skip(self))]
    pub async fn rewarm_top(&self, n: usize) -> Result<usize> {
        let (job, is_new) = self.jobs.start_job(JobKind::Warmup, "maintenance");
        if !is_new {
            debug!(job_id = %job.id, "Warm-up already running");
            return Ok(0);
        }
        let handle = self.jobs.handle(&job.id)?;

        let top = self.usage.top_accessed(n);
        handle.begin_step("warmup", top.len() as u64);
        let mut written = 0;
        for (key, counter) in &top {
            if handle.is_cancelled() {
                break;
            }
            let Some((entity_type, id)) = parse_usage_key(key) else {
                handle.advance(1);
                continue;
            };
            match self.source.fetch_entity(entity_type, id).await {
                Ok(Some(value)) => {
                    let ttl = self.usage.ttl_for_count(counter.access_count);
                    if self.client.set_json(&lazy_key(entity_type, id), &value, ttl).await {
                        written += 1;
                    }
                }
                Ok(None) => debug!(key, "Hot entity no longer in source"),
                Err(e) => {
                    handle.fail(&e.to_string());
                    return Err(e);
                }
            }
            handle.advance(1);
        }
        handle.complete_step();
        handle.complete();

        info!(candidates = top.len(), written, "Re-warmed hot entities");
        Ok(written)
    }

    /// Memory, key distribution and usage summary.
    pub async fn performance_report(&self, started: Instant) -> PerformanceReport {
        let memory = self.client.memory_info().await.unwrap_or_default();
        let mut keys_by_namespace = BTreeMap::new();
        for namespace in Namespace::ALL {
            let count = self.client.keys(&namespace.pattern()).await.len() as u64;
            keys_by_namespace.insert(namespace.prefix().to_string(), count);
        }
        let analysis = self.usage.analyze(Default::default());

        PerformanceReport {
            generated_at: Utc::now(),
            memory_used_bytes: memory.used_bytes,
            keys_by_namespace,
            hit_ratio: self.client.metrics().overall_hit_ratio(),
            tracked_keys: analysis.total_tracked,
            hot_keys: analysis.hot.len(),
            cold_keys: analysis.cold_count,
            evicted_keys: self.client.metrics().keys_evicted(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Cache status for the ops surface. Catalog errors degrade to empty
    /// fields.
    pub async fn status(&self) -> CacheStatus {
        let metadata = self.catalog.list_metadata().await.unwrap_or_else(|e| {
            warn!(error = %e, "Cannot list cache metadata");
            Vec::new()
        });
        CacheStatus {
            backend: self.client.backend_name(),
            enabled: self.client.is_enabled(),
            connected: self.client.is_connected(),
            warm: self.preload.is_cache_warm().await,
            memory: self.client.memory_info().await,
            metadata,
            index_entries: self.index.count().await.unwrap_or_default(),
            relationships: self.graph.count().await.unwrap_or_default(),
            tracked_usage_keys: self.usage.len(),
            metrics: self.client.metrics().snapshot(),
            reports: self.reports.stats(),
            latest_preload: self.jobs.latest(JobKind::FullPreload),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
