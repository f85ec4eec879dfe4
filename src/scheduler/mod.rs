//! Maintenance Scheduler
//!
//! Background tasks that keep the KV tier bounded and the hot set warm:
//!
//! - **Quick cleanup** - drop managed keys about to expire
//! - **Deep cleanup** - sweep lazy/search/report keys with no or short TTL
//! - **Memory optimization** - evict when usage crosses the threshold
//! - **Usage analysis** - hot/warm/cold classification
//! - **Nightly optimization** - deep cleanup, re-warm, optimize, persist
//! - **Health check** - ping, reconnect, memory warnings
//!
//! Every task is idempotent. Failures are logged and counted, never
//! propagated to the loop.

pub mod health;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::{interval_at, Instant as TokioInstant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{CacheService, EvictionOutcome, UsageAnalysis, UsageThresholds};
use crate::domain::ports::KeyTtl;
use crate::domain::model::chrono_duration;
use crate::error::{Error, Result};
use crate::kv::Namespace;
use crate::metrics::exporter;

pub use health::{HealthCheck, HealthCheckResult, HealthResponse, HealthStatus};

// =============================================================================
// Configuration
// =============================================================================

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub quick_cleanup_interval: Duration,
    /// Quick cleanup removes keys expiring sooner than this
    pub quick_cleanup_ttl: Duration,
    pub deep_cleanup_interval: Duration,
    /// Deep cleanup removes keys expiring sooner than this
    pub deep_cleanup_ttl: Duration,
    pub memory_interval: Duration,
    pub usage_analysis_interval: Duration,
    pub health_check_interval: Duration,
    /// Daily nightly-optimization time, UTC
    pub nightly_at: NaiveTime,
    /// Entities re-warmed by the nightly run
    pub rewarm_top: usize,
    pub thresholds: UsageThresholds,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            quick_cleanup_interval: Duration::from_secs(5 * 60),
            quick_cleanup_ttl: Duration::from_secs(60),
            deep_cleanup_interval: Duration::from_secs(60 * 60),
            deep_cleanup_ttl: Duration::from_secs(300),
            memory_interval: Duration::from_secs(15 * 60),
            usage_analysis_interval: Duration::from_secs(6 * 60 * 60),
            health_check_interval: Duration::from_secs(60),
            nightly_at: NaiveTime::from_hms_opt(2, 0, 0).unwrap_or_default(),
            rewarm_top: 100,
            thresholds: UsageThresholds::default(),
        }
    }
}

/// Namespaces quick cleanup sweeps.
const QUICK_CLEANUP_NAMESPACES: [Namespace; 4] = [
    Namespace::Cache,
    Namespace::Lazy,
    Namespace::Search,
    Namespace::Report,
];

/// Namespaces deep cleanup sweeps.
const DEEP_CLEANUP_NAMESPACES: [Namespace; 3] =
    [Namespace::Lazy, Namespace::Search, Namespace::Report];

// =============================================================================
// Tasks
// =============================================================================

/// Maintenance task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceTask {
    QuickCleanup,
    DeepCleanup,
    MemoryOptimization,
    UsageAnalysis,
    NightlyOptimization,
    HealthCheck,
}

impl MaintenanceTask {
    pub const ALL: [MaintenanceTask; 6] = [
        MaintenanceTask::QuickCleanup,
        MaintenanceTask::DeepCleanup,
        MaintenanceTask::MemoryOptimization,
        MaintenanceTask::UsageAnalysis,
        MaintenanceTask::NightlyOptimization,
        MaintenanceTask::HealthCheck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceTask::QuickCleanup => "quick_cleanup",
            MaintenanceTask::DeepCleanup => "deep_cleanup",
            MaintenanceTask::MemoryOptimization => "memory_optimization",
            MaintenanceTask::UsageAnalysis => "usage_analysis",
            MaintenanceTask::NightlyOptimization => "nightly_optimization",
            MaintenanceTask::HealthCheck => "health_check",
        }
    }
}

impl std::fmt::Display for MaintenanceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-task run counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskStats {
    pub runs: u64,
    pub failures: u64,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_duration_ms: u64,
    /// Summary of the last successful run
    pub last_outcome: Option<String>,
    pub last_error: Option<String>,
}

/// Scheduler status for the ops surface.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub tasks: BTreeMap<MaintenanceTask, TaskStats>,
    pub last_analysis: Option<UsageAnalysis>,
    pub last_eviction: Option<EvictionOutcome>,
    pub next_nightly_at: DateTime<Utc>,
}

/// Next occurrence of `at` (UTC) strictly after `now`.
pub fn next_daily(at: NaiveTime, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Maintenance scheduler
pub struct MaintenanceScheduler {
    service: Arc<CacheService>,
    config: SchedulerConfig,
    stats: DashMap<MaintenanceTask, TaskStats>,
    last_analysis: RwLock<Option<UsageAnalysis>>,
    last_eviction: RwLock<Option<EvictionOutcome>>,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl MaintenanceScheduler {
    pub fn new(service: Arc<CacheService>, config: SchedulerConfig) -> Self {
        Self {
            service,
            config,
            stats: DashMap::new(),
            last_analysis: RwLock::new(None),
            last_eviction: RwLock::new(None),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run every task on its schedule until [`shutdown`](Self::shutdown).
    pub async fn run(self: Arc<Self>) {
        info!("Starting maintenance scheduler with {:?}", self.config);
        self.running.store(true, Ordering::SeqCst);

        let mut quick = ticker(self.config.quick_cleanup_interval);
        let mut deep = ticker(self.config.deep_cleanup_interval);
        let mut memory = ticker(self.config.memory_interval);
        let mut usage = ticker(self.config.usage_analysis_interval);
        let mut health = ticker(self.config.health_check_interval);
        let nightly = tokio::time::sleep(self.until_nightly());
        tokio::pin!(nightly);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Maintenance scheduler shutting down");
                    break;
                }
                _ = quick.tick() => self.run_task(MaintenanceTask::QuickCleanup).await,
                _ = deep.tick() => self.run_task(MaintenanceTask::DeepCleanup).await,
                _ = memory.tick() => self.run_task(MaintenanceTask::MemoryOptimization).await,
                _ = usage.tick() => self.run_task(MaintenanceTask::UsageAnalysis).await,
                _ = health.tick() => self.run_task(MaintenanceTask::HealthCheck).await,
                () = &mut nightly => {
                    self.run_task(MaintenanceTask::NightlyOptimization).await;
                    nightly.as_mut().reset(TokioInstant::now() + self.until_nightly());
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop the loop and persist usage counters.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if self.service.usage().persist(self.service.client()).await {
            info!("Persisted usage snapshot on shutdown");
        }
    }

    fn until_nightly(&self) -> Duration {
        let now = Utc::now();
        (next_daily(self.config.nightly_at, now) - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Run one task now, recording its outcome.
    pub async fn run_task(&self, task: MaintenanceTask) {
        let started_at = Utc::now();
        let started = Instant::now();
        let result = self.execute(task).await;
        let elapsed = started.elapsed();

        let mut stats = self.stats.entry(task).or_default();
        stats.runs += 1;
        stats.last_started_at = Some(started_at);
        stats.last_duration_ms = elapsed.as_millis() as u64;
        match result {
            Ok(outcome) => {
                debug!(%task, duration_ms = stats.last_duration_ms, outcome = %outcome, "Maintenance task finished");
                stats.last_outcome = Some(outcome);
                stats.last_error = None;
                exporter::MAINTENANCE_RUNS
                    .with_label_values(&[task.as_str(), "ok"])
                    .inc();
            }
            Err(e) => {
                error!(%task, error = %e, "Maintenance task failed");
                stats.failures += 1;
                stats.last_error = Some(e.to_string());
                exporter::MAINTENANCE_RUNS
                    .with_label_values(&[task.as_str(), "error"])
                    .inc();
            }
        }
    }

    async fn execute(&self, task: MaintenanceTask) -> Result<String> {
        match task {
            MaintenanceTask::QuickCleanup => {
                let deleted = self
                    .cleanup(&QUICK_CLEANUP_NAMESPACES, self.config.quick_cleanup_ttl, false)
                    .await;
                Ok(format!("deleted {} keys", deleted))
            }
            MaintenanceTask::DeepCleanup => {
                let deleted = self
                    .cleanup(&DEEP_CLEANUP_NAMESPACES, self.config.deep_cleanup_ttl, true)
                    .await;
                Ok(format!("deleted {} keys", deleted))
            }
            MaintenanceTask::MemoryOptimization => self.optimize_memory().await,
            MaintenanceTask::UsageAnalysis => Ok(self.analyze_usage()),
            MaintenanceTask::NightlyOptimization => self.nightly().await,
            MaintenanceTask::HealthCheck => self.health_check().await,
        }
    }

    /// Delete keys expiring within `threshold`, plus keys without expiry when
    /// `drop_persistent` is set. Reconciles the namespace registry with what
    /// is left.
    async fn cleanup(&self, namespaces: &[Namespace], threshold: Duration, drop_persistent: bool) -> u64 {
        let client = self.service.client();
        let mut deleted = 0;
        for namespace in namespaces {
            let keys = client.keys(&namespace.pattern()).await;
            let mut doomed = Vec::new();
            let mut live = HashSet::with_capacity(keys.len());
            for key in keys {
                let expiring = match client.ttl(&key).await {
                    Some(KeyTtl::Expires(ttl)) => ttl < threshold,
                    Some(KeyTtl::Persistent) => drop_persistent,
                    Some(KeyTtl::Missing) => false,
                    None => false,
                };
                if expiring {
                    doomed.push(key);
                } else {
                    live.insert(key);
                }
            }
            if !doomed.is_empty() {
                deleted += client.del(&doomed).await;
            }
            if namespace.is_tracked() {
                let (added, dropped) = client.registry().reconcile(*namespace, &live);
                if added > 0 || dropped > 0 {
                    debug!(%namespace, added, dropped, "Reconciled registry with backend");
                }
            }
        }
        if deleted > 0 {
            info!(deleted, drop_persistent, "Cleaned up expiring keys");
        }
        deleted
    }

    #[instrument(skip(self))]
    async fn optimize_memory(&self) -> Result<String> {
        let client = self.service.client();
        let Some(info) = client.memory_info().await else {
            return Ok("memory info unavailable".to_string());
        };
        let policy = self.service.evictor().policy();
        let ratio = policy.usage_ratio(&info);
        if policy.is_fragmented(&info) {
            warn!(
                fragmentation = info.fragmentation_ratio,
                "KV memory fragmentation is high"
            );
        }
        if !policy.should_optimize(&info) {
            return Ok(format!("usage {:.1}%, no action", ratio * 100.0));
        }

        let outcome = self.service.evictor().evict_now().await;
        *self.last_eviction.write() = Some(outcome.clone());
        Ok(format!(
            "usage {:.1}%, evicted {} of {} lazy keys",
            ratio * 100.0,
            outcome.evicted,
            outcome.candidates
        ))
    }

    fn analyze_usage(&self) -> String {
        let analysis = self.service.usage().analyze(self.config.thresholds);
        let summary = format!(
            "{} tracked, {} hot, {} warm, {} cold",
            analysis.total_tracked,
            analysis.hot.len(),
            analysis.warm_count,
            analysis.cold_count
        );
        for recommendation in &analysis.recommendations {
            info!(%recommendation, "Usage analysis");
        }
        *self.last_analysis.write() = Some(analysis);
        summary
    }

    #[instrument(skip(self))]
    async fn nightly(&self) -> Result<String> {
        let started = Instant::now();
        let cleaned = self
            .cleanup(&DEEP_CLEANUP_NAMESPACES, self.config.deep_cleanup_ttl, true)
            .await;
        let rewarmed = match self.service.rewarm_top(self.config.rewarm_top).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Nightly re-warm failed");
                0
            }
        };
        let memory = self.optimize_memory().await?;
        let persisted = self.service.usage().persist(self.service.client()).await;

        let report = self.service.performance_report(started).await;
        self.service
            .catalog()
            .append_performance_report(report)
            .await?;

        Ok(format!(
            "cleaned {}, re-warmed {}, {}, usage persisted: {}",
            cleaned, rewarmed, memory, persisted
        ))
    }

    async fn health_check(&self) -> Result<String> {
        let client = self.service.client();
        if !client.is_enabled() {
            return Ok("bypass mode".to_string());
        }
        if !client.ping().await {
            warn!("KV backend did not answer ping, reconnecting");
            if !client.reconnect().await {
                return Err(Error::BackendUnavailable(
                    "reconnect after failed ping".to_string(),
                ));
            }
        }
        if let Some(info) = client.memory_info().await {
            let policy = self.service.evictor().policy();
            if policy.should_warn(&info) {
                warn!(
                    used = info.used_bytes,
                    ratio = policy.usage_ratio(&info),
                    "KV memory usage is high"
                );
            }
        }
        Ok("ok".to_string())
    }

    pub fn status(&self) -> SchedulerStatus {
        let tasks = MaintenanceTask::ALL
            .into_iter()
            .map(|task| {
                let stats = self.stats.get(&task).map(|s| s.clone()).unwrap_or_default();
                (task, stats)
            })
            .collect();
        SchedulerStatus {
            running: self.is_running(),
            tasks,
            last_analysis: self.last_analysis.read().clone(),
            last_eviction: self.last_eviction.read().clone(),
            next_nightly_at: Utc::now() + chrono_duration(self.until_nightly()),
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = interval_at(TokioInstant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LoggingEventPublisher, MemoryCatalog, MemoryKvStore, MemorySourceStore};
    use crate::cache::EvictionPolicy;
    use crate::config::CacheConfig;
    use crate::domain::ports::CatalogStore;
    use crate::domain::{Employee, EntityType};
    use chrono::TimeZone;

    struct Fixture {
        store: Arc<MemoryKvStore>,
        catalog: Arc<MemoryCatalog>,
        service: Arc<CacheService>,
    }

    async fn fixture(eviction: EvictionPolicy) -> Fixture {
        let store = Arc::new(MemoryKvStore::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let source = Arc::new(MemorySourceStore::new());
        for i in 0..3 {
            source.upsert_employee(Employee {
                id: format!("E{}", i),
                employee_number: format!("N-{}", i),
                name: format!("Employee {}", i),
                email: None,
                designation: None,
                division_id: None,
                section_id: None,
                is_active: true,
            });
        }
        let service = Arc::new(CacheService::new(
            CacheConfig {
                eviction,
                ..Default::default()
            },
            store.clone(),
            source,
            catalog.clone(),
            Arc::new(LoggingEventPublisher::new()),
        ));
        service.connect().await;
        Fixture {
            store,
            catalog,
            service,
        }
    }

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.quick_cleanup_interval, Duration::from_secs(300));
        assert_eq!(config.deep_cleanup_interval, Duration::from_secs(3600));
        assert_eq!(config.nightly_at, NaiveTime::from_hms_opt(2, 0, 0).unwrap());
        assert_eq!(config.rewarm_top, 100);
    }

    #[test]
    fn test_next_daily() {
        let at = NaiveTime::from_hms_opt(2, 0, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap();
        assert_eq!(
            next_daily(at, before),
            Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap()
        );
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
        assert_eq!(
            next_daily(at, after),
            Utc.with_ymd_and_hms(2024, 3, 2, 2, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_quick_cleanup_drops_expiring_keys() {
        let f = fixture(EvictionPolicy::default()).await;
        let client = f.service.client();
        client.set_ex("lazy:employee:E0", "{}", Duration::from_secs(30)).await;
        client.set_ex("lazy:employee:E1", "{}", Duration::from_secs(600)).await;
        client.sadd("rel:division:D1:sections", &["S1".to_string()]).await;

        let scheduler = MaintenanceScheduler::new(f.service.clone(), SchedulerConfig::default());
        scheduler.run_task(MaintenanceTask::QuickCleanup).await;

        assert_eq!(client.get("lazy:employee:E0").await, None);
        assert!(client.get("lazy:employee:E1").await.is_some());
        assert_eq!(client.scard("rel:division:D1:sections").await, 1);
        assert_eq!(client.registry().len(Namespace::Lazy), 1);

        let stats = &scheduler.status().tasks[&MaintenanceTask::QuickCleanup];
        assert_eq!(stats.runs, 1);
        assert_eq!(stats.last_outcome.as_deref(), Some("deleted 1 keys"));
    }

    #[tokio::test]
    async fn test_deep_cleanup_drops_persistent_keys() {
        let f = fixture(EvictionPolicy::default()).await;
        let client = f.service.client();
        client.set_ex("search:employee:name:ada", "[]", Duration::from_secs(120)).await;
        client.set_ex("report:summary:x", "{}", Duration::from_secs(3600)).await;
        client.sadd("report:orphan", &["x".to_string()]).await;
        client.set_ex("cache:employee:E0", "{}", Duration::from_secs(10)).await;

        let scheduler = MaintenanceScheduler::new(f.service.clone(), SchedulerConfig::default());
        scheduler.run_task(MaintenanceTask::DeepCleanup).await;

        assert_eq!(client.get("search:employee:name:ada").await, None);
        assert!(client.smembers("report:orphan").await.is_empty());
        assert!(client.get("report:summary:x").await.is_some());
        assert!(client.get("cache:employee:E0").await.is_some());
    }

    #[tokio::test]
    async fn test_memory_optimization_evicts_over_threshold() {
        let f = fixture(EvictionPolicy::with_ceiling(1)).await;
        for i in 0..3 {
            f.service.get_entity(EntityType::Employee, &format!("E{}", i)).await.unwrap();
        }

        let scheduler = MaintenanceScheduler::new(f.service.clone(), SchedulerConfig::default());
        scheduler.run_task(MaintenanceTask::MemoryOptimization).await;

        let eviction = scheduler.status().last_eviction.unwrap();
        assert!(eviction.evicted >= 1);
        assert_eq!(f.store.len(), 3 - eviction.evicted as usize);
    }

    #[tokio::test]
    async fn test_usage_analysis_is_stored() {
        let f = fixture(EvictionPolicy::default()).await;
        f.service.get_entity(EntityType::Employee, "E0").await.unwrap();

        let scheduler = MaintenanceScheduler::new(f.service.clone(), SchedulerConfig::default());
        scheduler.run_task(MaintenanceTask::UsageAnalysis).await;

        let analysis = scheduler.status().last_analysis.unwrap();
        assert_eq!(analysis.total_tracked, 1);
        assert_eq!(analysis.cold_count, 1);
    }

    #[tokio::test]
    async fn test_nightly_appends_performance_report() {
        let f = fixture(EvictionPolicy::default()).await;
        f.service.get_entity(EntityType::Employee, "E1").await.unwrap();

        let scheduler = MaintenanceScheduler::new(f.service.clone(), SchedulerConfig::default());
        scheduler.run_task(MaintenanceTask::NightlyOptimization).await;

        let reports = f.catalog.recent_performance_reports(1).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].tracked_keys, 1);
        assert!(f
            .service
            .client()
            .get(crate::kv::keys::USAGE_STATS_KEY)
            .await
            .is_some());
        assert_eq!(scheduler.status().tasks[&MaintenanceTask::NightlyOptimization].failures, 0);
    }

    #[tokio::test]
    async fn test_health_check_reconnects() {
        let f = fixture(EvictionPolicy::default()).await;
        let scheduler = MaintenanceScheduler::new(f.service.clone(), SchedulerConfig::default());

        f.store.set_unavailable(true);
        scheduler.run_task(MaintenanceTask::HealthCheck).await;
        assert_eq!(scheduler.status().tasks[&MaintenanceTask::HealthCheck].failures, 1);

        f.store.set_unavailable(false);
        scheduler.run_task(MaintenanceTask::HealthCheck).await;
        let stats = &scheduler.status().tasks[&MaintenanceTask::HealthCheck];
        assert_eq!(stats.runs, 2);
        assert!(stats.last_error.is_none());
        assert!(f.service.client().is_connected());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(EvictionPolicy::default()).await;
        let scheduler = Arc::new(MaintenanceScheduler::new(
            f.service.clone(),
            SchedulerConfig {
                health_check_interval: Duration::from_millis(5),
                ..Default::default()
            },
        ));

        let task = tokio::spawn(scheduler.clone().run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.shutdown().await;
        task.await.unwrap();

        assert!(!scheduler.is_running());
        assert!(scheduler.status().tasks[&MaintenanceTask::HealthCheck].runs >= 1);
    }
}
