//! Generic Report Cache
//!
//! Caches computed report payloads under explicit keys or under canonical
//! keys derived from the report type and its parameters:
//!
//! ```text
//! report:{type}:{from}:{to}:{division}:{section}:{sub_section}:{employee}:{grouping}
//! ```
//!
//! Absent parameters render as empty strings, so key derivation does not
//! depend on how the parameters were supplied. `%` and `:` inside a value are
//! percent-encoded so every key has exactly nine segments. Bulk invalidation builds a
//! partially wildcarded canonical key and deletes every match.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::domain::ports::SourceStore;
use crate::domain::ReportParams;
use crate::error::{Error, Result};
use crate::kv::keys::{encode_segment, glob_escape};
use crate::kv::{CacheClient, Namespace};

/// Default lifetime of a cached report.
pub const DEFAULT_REPORT_TTL: Duration = Duration::from_secs(3600);

/// Where a report lives in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKeySpec {
    /// Key used verbatim
    Explicit(String),
    /// Canonical key derived from type and parameters
    Derived {
        report_type: String,
        params: ReportParams,
    },
}

impl CacheKeySpec {
    pub fn explicit(key: impl Into<String>) -> Self {
        CacheKeySpec::Explicit(key.into())
    }

    pub fn derived(report_type: impl Into<String>, params: ReportParams) -> Self {
        CacheKeySpec::Derived {
            report_type: report_type.into(),
            params,
        }
    }

    pub fn key(&self) -> String {
        match self {
            CacheKeySpec::Explicit(key) => key.clone(),
            CacheKeySpec::Derived {
                report_type,
                params,
            } => generate_key(report_type, params),
        }
    }
}

/// Canonical report key.
pub fn generate_key(report_type: &str, params: &ReportParams) -> String {
    let fields: Vec<String> = params
        .canonical_fields()
        .iter()
        .map(|v| encode_segment(v))
        .collect();
    format!(
        "{}:{}:{}",
        Namespace::Report.prefix(),
        encode_segment(report_type),
        fields.join(":")
    )
}

/// One fixed dimension of a bulk invalidation pattern.
fn pattern_segment(value: &str) -> String {
    glob_escape(&encode_segment(value))
}

/// Lookup counters of the report namespace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReportCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub tracked_keys: usize,
}

/// Report cache
pub struct ReportCache {
    client: Arc<CacheClient>,
    source: Option<Arc<dyn SourceStore>>,
    default_ttl: Duration,
}

impl ReportCache {
    pub fn new(client: Arc<CacheClient>) -> Self {
        Self {
            client,
            source: None,
            default_ttl: DEFAULT_REPORT_TTL,
        }
    }

    /// Source used by [`compute_report`](Self::compute_report).
    pub fn with_source(mut self, source: Arc<dyn SourceStore>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn count_lookup(&self, hit: bool) {
        if hit {
            self.client.metrics().record_hit(Namespace::Report);
        } else {
            self.client.metrics().record_miss(Namespace::Report);
        }
    }

    /// Cached payload decoded as `T`.
    pub async fn get<T: DeserializeOwned>(&self, spec: &CacheKeySpec) -> Option<T> {
        let value = self.client.get_json(&spec.key()).await;
        self.count_lookup(value.is_some());
        value
    }

    /// Cached payload as raw text.
    pub async fn get_text(&self, spec: &CacheKeySpec) -> Option<String> {
        let value = self.client.get(&spec.key()).await;
        self.count_lookup(value.is_some());
        value
    }

    /// JSON-encode and store a payload. `None` uses the default TTL.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        spec: &CacheKeySpec,
        data: &T,
        ttl: Option<Duration>,
    ) -> bool {
        self.client
            .set_json(&spec.key(), data, ttl.unwrap_or(self.default_ttl))
            .await
    }

    pub async fn set_text(&self, spec: &CacheKeySpec, text: &str, ttl: Option<Duration>) -> bool {
        self.client
            .set_ex(&spec.key(), text, ttl.unwrap_or(self.default_ttl))
            .await
    }

    pub async fn clear(&self, spec: &CacheKeySpec) -> bool {
        self.client.del(&[spec.key()]).await > 0
    }

    /// Delete every report matching `pattern` (all reports when `None`).
    /// Patterns are confined to the report namespace.
    pub async fn clear_all(&self, pattern: Option<&str>) -> u64 {
        let prefix = format!("{}:", Namespace::Report.prefix());
        let pattern = match pattern {
            None => Namespace::Report.pattern(),
            Some(p) if p.starts_with(&prefix) => p.to_string(),
            Some(p) => format!("{}{}", prefix, p),
        };
        let deleted = self.client.delete_pattern(&pattern).await;
        debug!(pattern, deleted, "Cleared reports");
        deleted
    }

    /// Delete every report computed for exactly this date range.
    pub async fn clear_date_range(&self, from: &str, to: &str) -> u64 {
        self.clear_all(Some(&format!(
            "report:*:{}:{}:*:*:*:*:*",
            pattern_segment(from),
            pattern_segment(to)
        )))
        .await
    }

    /// Delete every report scoped to an organizational unit. `None`
    /// dimensions match anything.
    pub async fn clear_organization(
        &self,
        division_id: Option<&str>,
        section_id: Option<&str>,
        sub_section_id: Option<&str>,
    ) -> u64 {
        let dim = |v: Option<&str>| v.map(pattern_segment).unwrap_or_else(|| "*".to_string());
        self.clear_all(Some(&format!(
            "report:*:*:*:{}:{}:{}:*:*",
            dim(division_id),
            dim(section_id),
            dim(sub_section_id)
        )))
        .await
    }

    /// Cached payload, or `compute` it and cache the result.
    ///
    /// Only `compute` errors propagate.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        spec: &CacheKeySpec,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(cached) = self.get(spec).await {
            return Ok(cached);
        }
        let value = compute().await?;
        self.set(spec, &value, ttl).await;
        Ok(value)
    }

    /// Run the source's report query through the cache.
    #[instrument(skip(self, params))]
    pub async fn compute_report(
        &self,
        report_type: &str,
        params: &ReportParams,
        ttl: Option<Duration>,
    ) -> Result<Value> {
        let source = self
            .source
            .clone()
            .ok_or_else(|| Error::Config("report cache has no source store".to_string()))?;
        let spec = CacheKeySpec::derived(report_type, params.clone());
        self.get_or_compute(&spec, ttl, || async move {
            source.compute_report(report_type, params).await
        })
        .await
    }

    pub fn stats(&self) -> ReportCacheStats {
        let metrics = self.client.metrics();
        ReportCacheStats {
            hits: metrics.hits(Namespace::Report),
            misses: metrics.misses(Namespace::Report),
            hit_ratio: metrics.hit_ratio(Namespace::Report),
            tracked_keys: self.client.registry().len(Namespace::Report),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryKvStore, MemorySourceStore};
    use crate::kv::KvConfig;
    use serde_json::json;

    async fn cache() -> ReportCache {
        let client = Arc::new(CacheClient::new(
            Arc::new(MemoryKvStore::new()),
            KvConfig::default(),
        ));
        client.connect().await;
        ReportCache::new(client)
    }

    #[test]
    fn test_generate_key_layout() {
        let params = ReportParams::new()
            .date_range("2025-01-01", "2025-01-31")
            .division("D1")
            .grouping("designation");
        assert_eq!(
            generate_key("group", &params),
            "report:group:2025-01-01:2025-01-31:D1::::designation"
        );
        assert_eq!(generate_key("group", &ReportParams::new()), "report:group:::::::");
    }

    #[test]
    fn test_json_params_match_builder() {
        let from_json = ReportParams::from_json(&json!({"to_date": "2025-01-31", "from_date": "2025-01-01"}));
        let built = ReportParams::new().date_range("2025-01-01", "2025-01-31");
        assert_eq!(generate_key("group", &from_json), generate_key("group", &built));
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let reports = cache().await;
        let spec = CacheKeySpec::derived(
            "group",
            ReportParams::new().date_range("2025-01-01", "2025-01-07"),
        );
        let payload = json!({"rows": [{"status": "present", "count": 3}]});

        assert!(reports.set(&spec, &payload, Some(Duration::from_secs(300))).await);
        let back: Value = reports.get(&spec).await.unwrap();
        assert_eq!(back, payload);

        let same = CacheKeySpec::derived(
            "group",
            ReportParams::from_json(&json!({"from_date": "2025-01-01", "to_date": "2025-01-07"})),
        );
        assert_eq!(reports.get::<Value>(&same).await, Some(payload));
        assert_eq!(reports.stats().hits, 2);
    }

    #[tokio::test]
    async fn test_text_and_explicit_keys() {
        let reports = cache().await;
        let spec = CacheKeySpec::explicit("report:custom:monthly");
        assert!(reports.set_text(&spec, "csv,data", None).await);
        assert_eq!(reports.get_text(&spec).await.as_deref(), Some("csv,data"));
        assert!(reports.clear(&spec).await);
        assert_eq!(reports.get_text(&spec).await, None);
    }

    #[tokio::test]
    async fn test_clear_date_range_and_organization() {
        let reports = cache().await;
        let jan = ReportParams::new().date_range("2025-01-01", "2025-01-31");
        let feb = ReportParams::new().date_range("2025-02-01", "2025-02-28");

        for (ty, params) in [
            ("group", jan.clone().division("D1")),
            ("individual", jan.clone().division("D2")),
            ("group", feb.clone().division("D1").section("S1")),
        ] {
            reports
                .set(&CacheKeySpec::derived(ty, params), &json!({}), None)
                .await;
        }

        assert_eq!(reports.clear_date_range("2025-01-01", "2025-01-31").await, 2);
        assert_eq!(reports.clear_organization(Some("D1"), Some("S1"), None).await, 1);
        assert_eq!(reports.clear_all(None).await, 0);
    }

    #[tokio::test]
    async fn test_colons_in_ids_keep_dimensions_aligned() {
        let reports = cache().await;
        let jan = ReportParams::new().date_range("2025-01-01", "2025-01-31");
        let odd = CacheKeySpec::derived("group", jan.clone().division("org:D1").section("S1"));
        let plain = CacheKeySpec::derived("group", jan.clone().division("org"));
        assert_eq!(
            odd.key(),
            "report:group:2025-01-01:2025-01-31:org%3AD1:S1:::"
        );
        reports.set(&odd, &json!({}), None).await;
        reports.set(&plain, &json!({}), None).await;

        assert_eq!(reports.clear_organization(Some("org"), Some("D1"), None).await, 0);
        assert_eq!(reports.clear_organization(Some("org:D1"), None, None).await, 1);
        assert!(reports.get::<Value>(&plain).await.is_some());

        let shifted = CacheKeySpec::derived("group", ReportParams::new().division("2025-01-01:2025-01-31"));
        reports.set(&shifted, &json!({}), None).await;
        assert_eq!(reports.clear_date_range("2025-01-01", "2025-01-31").await, 1);
        assert!(reports.get::<Value>(&shifted).await.is_some());
    }

    #[tokio::test]
    async fn test_clear_all_is_confined_to_reports() {
        let reports = cache().await;
        reports
            .set(&CacheKeySpec::explicit("report:a"), &json!(1), None)
            .await;
        reports.client.set_ex("lazy:employee:1", "{}", Duration::from_secs(60)).await;

        assert_eq!(reports.clear_all(Some("*")).await, 1);
        assert!(reports.client.get("lazy:employee:1").await.is_some());
    }

    #[tokio::test]
    async fn test_get_or_compute_runs_once() {
        let reports = cache().await;
        let spec = CacheKeySpec::explicit("report:expensive");
        let mut calls = 0;
        for _ in 0..2 {
            let value: Value = reports
                .get_or_compute(&spec, None, || {
                    calls += 1;
                    async { Ok::<_, Error>(json!({"total": 7})) }
                })
                .await
                .unwrap();
            assert_eq!(value["total"], 7);
        }
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_compute_report_through_source() {
        let source = Arc::new(MemorySourceStore::new());
        source.set_report("summary", json!({"total": 42}));
        let reports = cache().await.with_source(source.clone());

        let params = ReportParams::new().division("D1");
        let first = reports.compute_report("summary", &params, None).await.unwrap();
        let second = reports.compute_report("summary", &params, None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(reports.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_disabled_backend_is_neutral() {
        let reports = ReportCache::new(Arc::new(CacheClient::disabled()));
        let spec = CacheKeySpec::explicit("report:x");
        assert!(!reports.set(&spec, &json!(1), None).await);
        assert_eq!(reports.get::<Value>(&spec).await, None);
        assert!(!reports.clear(&spec).await);
        assert_eq!(reports.clear_all(None).await, 0);
    }
}
