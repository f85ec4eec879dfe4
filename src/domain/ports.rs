//! Domain Ports (Port/Adapter Pattern)
//!
//! Trait abstractions for the external collaborators of the cache layer.
//! Infrastructure adapters implement these traits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  KvStore │ SourceStore │ CatalogStore │ EventPublisher │  │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  RedisKvStore │ MemoryKvStore │ MemorySourceStore   │    │
//! │  │  MemoryCatalog │ LoggingEventPublisher               │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::events::CacheEvent;
use super::model::{
    AttendanceRecord, CacheMetadata, Division, Employee, EntityType, IndexEntry,
    PerformanceReport, RelationshipEdge, ReportParams, Section, SyncLog,
};
use crate::error::Result;

// =============================================================================
// KV Store Port
// =============================================================================

/// One operation inside a pipelined batch.
#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    SetEx {
        key: String,
        value: String,
        ttl: Duration,
    },
    Del {
        keys: Vec<String>,
    },
    SAdd {
        key: String,
        members: Vec<String>,
    },
    SRem {
        key: String,
        members: Vec<String>,
    },
    ZAdd {
        key: String,
        member: String,
        score: f64,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

/// Ordered list of KV operations submitted as one pipeline.
///
/// Operations are applied in insertion order, so a payload added before its
/// set membership is visible first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KvBatch {
    ops: Vec<KvOp>,
}

impl KvBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ex(&mut self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) -> &mut Self {
        self.ops.push(KvOp::SetEx {
            key: key.into(),
            value: value.into(),
            ttl,
        });
        self
    }

    pub fn del(&mut self, keys: Vec<String>) -> &mut Self {
        if !keys.is_empty() {
            self.ops.push(KvOp::Del { keys });
        }
        self
    }

    pub fn sadd(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        if !members.is_empty() {
            self.ops.push(KvOp::SAdd {
                key: key.into(),
                members,
            });
        }
        self
    }

    pub fn srem(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        if !members.is_empty() {
            self.ops.push(KvOp::SRem {
                key: key.into(),
                members,
            });
        }
        self
    }

    pub fn zadd(&mut self, key: impl Into<String>, member: impl Into<String>, score: f64) -> &mut Self {
        self.ops.push(KvOp::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
        });
        self
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.ops.push(KvOp::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[KvOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<KvOp> {
        self.ops
    }

    /// Keys written by `SETEX` in this batch.
    pub fn written_keys(&self) -> impl Iterator<Item = &str> {
        self.ops.iter().filter_map(|op| match op {
            KvOp::SetEx { key, .. } => Some(key.as_str()),
            _ => None,
        })
    }
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist
    Missing,
    /// Key exists without expiry
    Persistent,
    /// Key expires after the given duration
    Expires(Duration),
}

/// Memory telemetry reported by the KV backend.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct MemoryInfo {
    /// Bytes currently used
    pub used_bytes: u64,
    /// Configured maximum (0 = unlimited)
    pub max_bytes: u64,
    /// RSS / used ratio
    pub fragmentation_ratio: f64,
}

impl MemoryInfo {
    /// Effective ceiling: the backend maximum, else the fallback.
    pub fn effective_max(&self, fallback: u64) -> u64 {
        if self.max_bytes > 0 {
            self.max_bytes
        } else {
            fallback
        }
    }

    /// Used / ceiling, 0.0 when no ceiling is known.
    pub fn usage_ratio(&self, fallback: u64) -> f64 {
        let max = self.effective_max(fallback);
        if max == 0 {
            0.0
        } else {
            self.used_bytes as f64 / max as f64
        }
    }
}

/// Port for the key/value cache backend.
///
/// Implementations return errors freely; `CacheClient` is the boundary that
/// converts them into neutral values.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Round-trip liveness probe (also establishes the connection).
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64>;

    /// Glob-style key scan.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn scard(&self, key: &str) -> Result<u64>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Submit a batch as one pipeline.
    async fn execute(&self, batch: KvBatch) -> Result<()>;

    async fn memory_info(&self) -> Result<MemoryInfo>;
}

// =============================================================================
// Source Store Port
// =============================================================================

/// Port for the relational source-of-truth. Read-only.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// All active divisions.
    async fn list_divisions(&self) -> Result<Vec<Division>>;

    /// All active sections.
    async fn list_sections(&self) -> Result<Vec<Section>>;

    /// All active employees.
    async fn list_employees(&self) -> Result<Vec<Employee>>;

    /// One row by natural id, as JSON.
    async fn fetch_entity(
        &self,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<serde_json::Value>>;

    /// A page of attendance facts ordered by natural id.
    async fn fetch_attendance_page(&self, offset: usize, limit: usize)
        -> Result<Vec<AttendanceRecord>>;

    /// Run a computed report query.
    async fn compute_report(
        &self,
        report_type: &str,
        params: &ReportParams,
    ) -> Result<serde_json::Value>;

    /// Check if the source store is reachable.
    async fn health_check(&self) -> Result<bool>;
}

// =============================================================================
// Catalog Port
// =============================================================================

/// Port for the durable index / relationship / metadata tables.
///
/// Upserts are last-write-wins keyed by natural identifiers and must tolerate
/// concurrent writers.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Upsert index rows, returning how many were written.
    async fn upsert_index_entries(&self, entries: &[IndexEntry]) -> Result<usize>;

    /// Case-insensitive substring match on `index_value`.
    async fn search_index(
        &self,
        entity_type: EntityType,
        index_key: &str,
        search_value: &str,
        limit: usize,
    ) -> Result<Vec<IndexEntry>>;

    /// Remove every index row of one entity.
    async fn delete_index_entries(&self, entity_type: EntityType, entity_id: &str) -> Result<u64>;

    async fn count_index_entries(&self) -> Result<usize>;

    async fn clear_index(&self) -> Result<u64>;

    async fn upsert_relationships(&self, edges: &[RelationshipEdge]) -> Result<usize>;

    async fn list_relationships(&self) -> Result<Vec<RelationshipEdge>>;

    /// Remove every edge whose child is `(child_type, child_id)`.
    async fn delete_relationships_for_child(
        &self,
        child_type: EntityType,
        child_id: &str,
    ) -> Result<u64>;

    async fn count_relationships(&self) -> Result<usize>;

    async fn clear_relationships(&self) -> Result<u64>;

    async fn upsert_metadata(&self, metadata: CacheMetadata) -> Result<()>;

    async fn get_metadata(&self, entity_type: &str) -> Result<Option<CacheMetadata>>;

    async fn list_metadata(&self) -> Result<Vec<CacheMetadata>>;

    /// Flip every row to invalid and bump its version. Returns rows touched.
    async fn invalidate_metadata(&self) -> Result<u64>;

    /// Append a sync log, returning its assigned id.
    async fn append_sync_log(&self, log: SyncLog) -> Result<u64>;

    async fn update_sync_log(&self, log: &SyncLog) -> Result<()>;

    /// Most recent logs first.
    async fn recent_sync_logs(&self, limit: usize) -> Result<Vec<SyncLog>>;

    async fn append_performance_report(&self, report: PerformanceReport) -> Result<()>;

    async fn recent_performance_reports(&self, limit: usize) -> Result<Vec<PerformanceReport>>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing cache events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a cache event.
    async fn publish(&self, event: CacheEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<CacheEvent>) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_preserves_order() {
        let mut batch = KvBatch::new();
        batch
            .set_ex("cache:division:D1", "{}", Duration::from_secs(60))
            .sadd("cache:division:all", vec!["D1".to_string()]);

        assert_eq!(batch.len(), 2);
        assert!(matches!(batch.ops()[0], KvOp::SetEx { .. }));
        assert!(matches!(batch.ops()[1], KvOp::SAdd { .. }));
        assert_eq!(batch.written_keys().collect::<Vec<_>>(), vec!["cache:division:D1"]);
    }

    #[test]
    fn test_batch_skips_empty_membership_ops() {
        let mut batch = KvBatch::new();
        batch.sadd("set", vec![]).srem("set", vec![]).del(vec![]);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_memory_usage_ratio() {
        let info = MemoryInfo {
            used_bytes: 800,
            max_bytes: 0,
            fragmentation_ratio: 1.0,
        };
        assert_eq!(info.effective_max(1000), 1000);
        assert!((info.usage_ratio(1000) - 0.8).abs() < f64::EPSILON);
        assert_eq!(info.usage_ratio(0), 0.0);

        let bounded = MemoryInfo {
            max_bytes: 1600,
            ..info
        };
        assert!((bounded.usage_ratio(1000) - 0.5).abs() < f64::EPSILON);
    }
}
