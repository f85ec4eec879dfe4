//! Cache Client
//!
//! The single boundary between the cache layer and the KV backend. Backend
//! failures never escape: every operation returns a neutral value (`None`,
//! `false`, `0`, empty) when the cache is disabled, disconnected or failing,
//! and a failed command marks the client disconnected until the next
//! successful ping or reconnect.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::keys::Namespace;
use crate::adapters::MemoryKvStore;
use crate::domain::ports::{KeyTtl, KvBatch, KvOp, KvStore, MemoryInfo};
use crate::error::Result;
use crate::metrics::exporter;
use crate::metrics::CacheMetrics;

/// Keys deleted per `DEL` when sweeping a pattern.
const DELETE_CHUNK: usize = 500;

// =============================================================================
// Configuration
// =============================================================================

/// KV connection configuration
#[derive(Debug, Clone)]
pub struct KvConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    /// When false every operation is a no-op returning its neutral value
    pub enabled: bool,
    /// Bound on each connection attempt
    pub connect_timeout: Duration,
    /// Bound on each command
    pub command_timeout: Duration,
    /// Connection attempts after the first
    pub max_retries: u32,
    /// Delay multiplier between attempts
    pub retry_backoff: Duration,
    /// Upper bound on the delay between attempts
    pub retry_cap: Duration,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
            enabled: true,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(3),
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
            retry_cap: Duration::from_secs(2),
        }
    }
}

impl KvConfig {
    /// Configuration with caching turned off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Connection URL for the redis driver.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) if !password.is_empty() => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// Delay before the next attempt: `min(attempt * backoff, cap)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(attempt)
            .min(self.retry_cap)
    }
}

// =============================================================================
// Namespace Registry
// =============================================================================

/// Keys this process wrote into the tracked namespaces.
///
/// Lets hot paths (eviction, stats) enumerate lazy/search/report keys without
/// a backend-wide pattern scan. Entries may outlive their KV keys after TTL
/// expiry; maintenance sweeps reconcile them.
#[derive(Debug, Default)]
pub struct NamespaceRegistry {
    keys: DashMap<Namespace, DashSet<String>>,
}

impl NamespaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, key: &str) {
        if let Some(ns) = Namespace::of_key(key).filter(|ns| ns.is_tracked()) {
            self.keys.entry(ns).or_default().insert(key.to_string());
        }
    }

    pub fn untrack(&self, key: &str) {
        if let Some(ns) = Namespace::of_key(key) {
            if let Some(set) = self.keys.get(&ns) {
                set.remove(key);
            }
        }
    }

    pub fn keys(&self, namespace: Namespace) -> Vec<String> {
        self.keys
            .get(&namespace)
            .map(|set| set.iter().map(|k| k.key().clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self, namespace: Namespace) -> usize {
        self.keys.get(&namespace).map(|set| set.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.iter().all(|entry| entry.value().is_empty())
    }

    /// Make the tracked keys of a namespace exactly `live`. Returns
    /// `(added, dropped)`.
    pub fn reconcile(&self, namespace: Namespace, live: &HashSet<String>) -> (usize, usize) {
        let set = self.keys.entry(namespace).or_default();
        let before = set.len();
        set.retain(|key| live.contains(key));
        let dropped = before - set.len();
        let mut added = 0;
        for key in live {
            if set.insert(key.clone()) {
                added += 1;
            }
        }
        (added, dropped)
    }

    pub fn clear(&self) {
        self.keys.clear();
    }
}

// =============================================================================
// Client
// =============================================================================

/// Degrading KV client shared by every cache component.
pub struct CacheClient {
    store: Arc<dyn KvStore>,
    config: KvConfig,
    connected: AtomicBool,
    registry: NamespaceRegistry,
    metrics: Arc<CacheMetrics>,
}

impl CacheClient {
    /// Create a client. Call [`connect`](Self::connect) before use.
    pub fn new(store: Arc<dyn KvStore>, config: KvConfig) -> Self {
        Self {
            store,
            config,
            connected: AtomicBool::new(false),
            registry: NamespaceRegistry::new(),
            metrics: Arc::new(CacheMetrics::new()),
        }
    }

    /// A client that bypasses caching entirely.
    pub fn disabled() -> Self {
        Self::new(Arc::new(MemoryKvStore::new()), KvConfig::disabled())
    }

    pub fn with_metrics(mut self, metrics: Arc<CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &NamespaceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &KvConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.name()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Enabled and connected.
    pub fn is_available(&self) -> bool {
        self.config.enabled && self.is_connected()
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        exporter::KV_CONNECTED.set(i64::from(connected));
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connect with capped linear backoff. Returns whether the backend is
    /// reachable; failure leaves the client in degraded mode.
    #[instrument(skip(self), fields(backend = self.store.name()))]
    pub async fn connect(&self) -> bool {
        if !self.config.enabled {
            info!("KV cache disabled, running in bypass mode");
            return false;
        }

        let attempts = self.config.max_retries + 1;
        for attempt in 1..=attempts {
            match tokio::time::timeout(self.config.connect_timeout, self.store.ping()).await {
                Ok(Ok(())) => {
                    self.set_connected(true);
                    info!(attempt, "Connected to KV backend");
                    self.sync_registry().await;
                    return true;
                }
                Ok(Err(e)) => warn!(attempt, error = %e, "KV connect attempt failed"),
                Err(_) => warn!(
                    attempt,
                    "KV connect attempt timed out after {:?}", self.config.connect_timeout
                ),
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.backoff_delay(attempt)).await;
            }
        }

        self.set_connected(false);
        error!(
            "KV backend unreachable after {} attempts, continuing without cache",
            attempts
        );
        false
    }

    /// Rebuild the namespace registry from a scan of the backend, picking up
    /// keys written before this process started. Returns how many keys are
    /// tracked afterwards.
    pub async fn sync_registry(&self) -> usize {
        let mut tracked = 0;
        for namespace in Namespace::TRACKED {
            let live: HashSet<String> = self.keys(&namespace.pattern()).await.into_iter().collect();
            let (added, dropped) = self.registry.reconcile(namespace, &live);
            if added > 0 || dropped > 0 {
                debug!(%namespace, added, dropped, "Synced namespace registry");
            }
            tracked += live.len();
        }
        tracked
    }

    /// Mark the client disconnected and forget tracked keys.
    pub async fn disconnect(&self) {
        self.set_connected(false);
        self.registry.clear();
        info!(backend = self.store.name(), "Disconnected from KV backend");
    }

    pub async fn reconnect(&self) -> bool {
        self.metrics.record_reconnect();
        self.set_connected(false);
        self.connect().await
    }

    /// Probe the backend. A successful probe restores a disconnected client.
    pub async fn ping(&self) -> bool {
        if !self.config.enabled {
            return false;
        }

        match tokio::time::timeout(self.config.command_timeout, self.store.ping()).await {
            Ok(Ok(())) => {
                if !self.is_connected() {
                    info!("KV backend reachable again");
                    self.set_connected(true);
                }
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "KV ping failed");
                self.set_connected(false);
                false
            }
            Err(_) => {
                warn!("KV ping timed out");
                self.set_connected(false);
                false
            }
        }
    }

    /// Run one backend command under the availability gate and the command
    /// timeout. Any failure is logged and turned into `None`.
    async fn guard<T, F>(&self, operation: &'static str, command: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.is_available() {
            self.metrics.record_bypass();
            return None;
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.command_timeout, command).await;
        self.metrics.record_command_latency(started.elapsed());

        match outcome {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(operation, error = %e, "KV command failed, marking backend unavailable");
                self.metrics.record_kv_error(operation);
                self.set_connected(false);
                None
            }
            Err(_) => {
                warn!(
                    operation,
                    "KV command timed out after {:?}, marking backend unavailable",
                    self.config.command_timeout
                );
                self.metrics.record_kv_error(operation);
                self.set_connected(false);
                None
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    pub async fn get(&self, key: &str) -> Option<String> {
        self.guard("get", self.store.get(key)).await.flatten()
    }

    /// Read and decode a JSON payload. Undecodable payloads read as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(key, error = %e, "Discarding undecodable cache payload");
                None
            }
        }
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let written = self
            .guard("set", self.store.set_ex(key, value, ttl))
            .await
            .is_some();
        if written {
            self.registry.track(key);
        }
        written
    }

    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        match serde_json::to_string(value) {
            Ok(raw) => self.set_ex(key, &raw, ttl).await,
            Err(e) => {
                warn!(key, error = %e, "Failed to encode cache payload");
                false
            }
        }
    }

    /// Delete keys, returning how many existed.
    pub async fn del(&self, keys: &[String]) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        match self.guard("del", self.store.del(keys)).await {
            Some(deleted) => {
                for key in keys {
                    self.registry.untrack(key);
                }
                deleted
            }
            None => 0,
        }
    }

    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        self.guard("keys", self.store.keys(pattern))
            .await
            .unwrap_or_default()
    }

    pub async fn ttl(&self, key: &str) -> Option<KeyTtl> {
        self.guard("ttl", self.store.ttl(key)).await
    }

    pub async fn sadd(&self, key: &str, members: &[String]) -> u64 {
        if members.is_empty() {
            return 0;
        }
        self.guard("sadd", self.store.sadd(key, members))
            .await
            .unwrap_or(0)
    }

    pub async fn smembers(&self, key: &str) -> Vec<String> {
        self.guard("smembers", self.store.smembers(key))
            .await
            .unwrap_or_default()
    }

    pub async fn scard(&self, key: &str) -> u64 {
        self.guard("scard", self.store.scard(key)).await.unwrap_or(0)
    }

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> bool {
        self.guard("zadd", self.store.zadd(key, member, score))
            .await
            .is_some()
    }

    /// Submit a batch as one pipeline.
    pub async fn execute(&self, batch: KvBatch) -> bool {
        if batch.is_empty() {
            return self.is_available();
        }

        let written: Vec<String> = batch.written_keys().map(str::to_string).collect();
        let deleted: Vec<String> = batch
            .ops()
            .iter()
            .filter_map(|op| match op {
                KvOp::Del { keys } => Some(keys.clone()),
                _ => None,
            })
            .flatten()
            .collect();

        let applied = self.guard("pipeline", self.store.execute(batch)).await.is_some();
        if applied {
            for key in &deleted {
                self.registry.untrack(key);
            }
            for key in &written {
                self.registry.track(key);
            }
        }
        applied
    }

    pub async fn memory_info(&self) -> Option<MemoryInfo> {
        let info = self.guard("info", self.store.memory_info()).await?;
        exporter::KV_MEMORY_USED.set(i64::try_from(info.used_bytes).unwrap_or(i64::MAX));
        Some(info)
    }

    /// Delete every key matching a glob pattern, in chunks.
    pub async fn delete_pattern(&self, pattern: &str) -> u64 {
        let keys = self.keys(pattern).await;
        let mut deleted = 0;
        for chunk in keys.chunks(DELETE_CHUNK) {
            deleted += self.del(chunk).await;
        }
        if deleted > 0 {
            debug!(pattern, deleted, "Deleted keys by pattern");
        }
        deleted
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_client() -> (Arc<MemoryKvStore>, CacheClient) {
        let store = Arc::new(MemoryKvStore::new());
        let client = CacheClient::new(store.clone(), KvConfig::default());
        assert!(client.connect().await);
        (store, client)
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = KvConfig {
            retry_backoff: Duration::from_millis(300),
            retry_cap: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(config.backoff_delay(1), Duration::from_millis(300));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(900));
        assert_eq!(config.backoff_delay(10), Duration::from_secs(1));
    }

    #[test]
    fn test_url_with_password() {
        let config = KvConfig {
            password: Some("s3cret".to_string()),
            db: 2,
            ..Default::default()
        };
        assert_eq!(config.url(), "redis://:s3cret@127.0.0.1:6379/2");
        assert_eq!(KvConfig::default().url(), "redis://127.0.0.1:6379/0");
    }

    #[tokio::test]
    async fn test_disabled_client_returns_neutral_values() {
        let client = CacheClient::disabled();
        assert!(!client.connect().await);

        assert!(!client.set_ex("lazy:employee:1", "{}", Duration::from_secs(60)).await);
        assert_eq!(client.get("lazy:employee:1").await, None);
        assert_eq!(client.del(&["lazy:employee:1".to_string()]).await, 0);
        assert!(client.keys("*").await.is_empty());
        assert_eq!(client.scard("cache:division:all").await, 0);
        assert!(client.memory_info().await.is_none());
        assert!(!client.ping().await);
    }

    #[tokio::test]
    async fn test_failure_marks_disconnected_and_ping_recovers() {
        let (store, client) = connected_client().await;

        store.set_unavailable(true);
        assert_eq!(client.get("lazy:employee:1").await, None);
        assert!(!client.is_connected());
        assert_eq!(client.metrics().kv_errors(), 1);

        store.set_unavailable(false);
        assert!(client.ping().await);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_retries() {
        let store = Arc::new(MemoryKvStore::new());
        store.set_unavailable(true);
        let client = CacheClient::new(
            store,
            KvConfig {
                max_retries: 2,
                retry_backoff: Duration::from_millis(1),
                ..Default::default()
            },
        );

        assert!(!client.connect().await);
        assert!(!client.is_available());
    }

    #[tokio::test]
    async fn test_registry_tracks_written_keys() {
        let (_store, client) = connected_client().await;

        assert!(client.set_ex("lazy:employee:1", "{}", Duration::from_secs(60)).await);
        assert!(client.set_ex("cache:division:D1", "{}", Duration::from_secs(60)).await);
        assert_eq!(client.registry().keys(Namespace::Lazy), vec!["lazy:employee:1"]);
        assert_eq!(client.registry().len(Namespace::Cache), 0);

        client.del(&["lazy:employee:1".to_string()]).await;
        assert_eq!(client.registry().len(Namespace::Lazy), 0);
    }

    #[tokio::test]
    async fn test_json_round_trip_and_bad_payload() {
        let (_store, client) = connected_client().await;

        let value = serde_json::json!({"id": "D1", "name": "Ops"});
        assert!(client.set_json("lazy:division:D1", &value, Duration::from_secs(60)).await);
        let back: serde_json::Value = client.get_json("lazy:division:D1").await.unwrap();
        assert_eq!(back, value);

        client.set_ex("lazy:division:D2", "not json", Duration::from_secs(60)).await;
        let broken: Option<serde_json::Value> = client.get_json("lazy:division:D2").await;
        assert!(broken.is_none());
    }

    #[tokio::test]
    async fn test_delete_pattern() {
        let (_store, client) = connected_client().await;
        for i in 0..5 {
            client
                .set_ex(&format!("search:employee:name:{}", i), "[]", Duration::from_secs(60))
                .await;
        }
        client.set_ex("lazy:employee:1", "{}", Duration::from_secs(60)).await;

        assert_eq!(client.delete_pattern("search:*").await, 5);
        assert_eq!(client.keys("*").await, vec!["lazy:employee:1"]);
    }

    #[test]
    fn test_registry_reconcile() {
        let registry = NamespaceRegistry::new();
        registry.track("lazy:employee:1");
        registry.track("lazy:employee:2");

        let live: HashSet<String> = ["lazy:employee:2", "lazy:employee:3"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(registry.reconcile(Namespace::Lazy, &live), (1, 1));
        let mut keys = registry.keys(Namespace::Lazy);
        keys.sort();
        assert_eq!(keys, vec!["lazy:employee:2", "lazy:employee:3"]);
    }

    #[tokio::test]
    async fn test_connect_tracks_keys_already_in_backend() {
        let store = Arc::new(MemoryKvStore::new());
        store
            .set_ex("lazy:employee:1", "{}", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set_ex("report:daily:a", "{}", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set_ex("cache:employee:1", "{}", Duration::from_secs(60))
            .await
            .unwrap();

        let client = CacheClient::new(store, KvConfig::default());
        assert!(client.connect().await);
        assert_eq!(client.registry().keys(Namespace::Lazy), vec!["lazy:employee:1"]);
        assert_eq!(client.registry().len(Namespace::Report), 1);
        assert_eq!(client.registry().len(Namespace::Cache), 0);
    }
}
