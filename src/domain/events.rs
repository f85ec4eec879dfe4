//! Domain Events
//!
//! Immutable records of significant occurrences in the cache layer.
//!
//! # Usage
//!
//! Events are used for:
//! - Audit trails of preload runs
//! - Decoupling the orchestrator from whoever watches it
//!
//! # Example
//!
//! ```ignore
//! let event = CacheEvent::preload_started("job-1", "scheduler");
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event representing a significant occurrence in the cache layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CacheEvent {
    // =========================================================================
    // Preload Events
    // =========================================================================
    /// A full preload was started.
    PreloadStarted {
        sync_id: u64,
        triggered_by: String,
        timestamp: DateTime<Utc>,
    },

    /// One preload step finished.
    PreloadStepCompleted {
        sync_id: u64,
        step: String,
        records: u64,
        indexes: u64,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A full preload completed successfully.
    PreloadCompleted {
        sync_id: u64,
        records_synced: u64,
        indexes_built: u64,
        relationships: u64,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A preload failed; earlier steps were kept.
    PreloadFailed {
        sync_id: u64,
        step: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Invalidation Events
    // =========================================================================
    /// All preloaded state was invalidated.
    CacheInvalidated {
        keys_deleted: u64,
        metadata_rows: u64,
        timestamp: DateTime<Utc>,
    },

    /// A single entity was refreshed from the source.
    EntityRefreshed {
        entity_type: String,
        entity_id: String,
        removed: bool,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Memory Events
    // =========================================================================
    /// Lazy entries were evicted under memory pressure.
    EvictionPerformed {
        evicted: u64,
        before_bytes: u64,
        after_bytes: u64,
        timestamp: DateTime<Utc>,
    },
}

impl CacheEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CacheEvent::PreloadStarted { timestamp, .. } => *timestamp,
            CacheEvent::PreloadStepCompleted { timestamp, .. } => *timestamp,
            CacheEvent::PreloadCompleted { timestamp, .. } => *timestamp,
            CacheEvent::PreloadFailed { timestamp, .. } => *timestamp,
            CacheEvent::CacheInvalidated { timestamp, .. } => *timestamp,
            CacheEvent::EntityRefreshed { timestamp, .. } => *timestamp,
            CacheEvent::EvictionPerformed { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::PreloadStarted { .. } => "PreloadStarted",
            CacheEvent::PreloadStepCompleted { .. } => "PreloadStepCompleted",
            CacheEvent::PreloadCompleted { .. } => "PreloadCompleted",
            CacheEvent::PreloadFailed { .. } => "PreloadFailed",
            CacheEvent::CacheInvalidated { .. } => "CacheInvalidated",
            CacheEvent::EntityRefreshed { .. } => "EntityRefreshed",
            CacheEvent::EvictionPerformed { .. } => "EvictionPerformed",
        }
    }

    /// Get the sync run id if applicable.
    pub fn sync_id(&self) -> Option<u64> {
        match self {
            CacheEvent::PreloadStarted { sync_id, .. }
            | CacheEvent::PreloadStepCompleted { sync_id, .. }
            | CacheEvent::PreloadCompleted { sync_id, .. }
            | CacheEvent::PreloadFailed { sync_id, .. } => Some(*sync_id),
            _ => None,
        }
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl CacheEvent {
    pub fn preload_started(sync_id: u64, triggered_by: &str) -> Self {
        CacheEvent::PreloadStarted {
            sync_id,
            triggered_by: triggered_by.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn preload_step_completed(
        sync_id: u64,
        step: &str,
        records: u64,
        indexes: u64,
        duration_ms: u64,
    ) -> Self {
        CacheEvent::PreloadStepCompleted {
            sync_id,
            step: step.to_string(),
            records,
            indexes,
            duration_ms,
            timestamp: Utc::now(),
        }
    }

    pub fn preload_completed(
        sync_id: u64,
        records_synced: u64,
        indexes_built: u64,
        relationships: u64,
        duration_ms: u64,
    ) -> Self {
        CacheEvent::PreloadCompleted {
            sync_id,
            records_synced,
            indexes_built,
            relationships,
            duration_ms,
            timestamp: Utc::now(),
        }
    }

    pub fn preload_failed(sync_id: u64, step: &str, reason: &str) -> Self {
        CacheEvent::PreloadFailed {
            sync_id,
            step: step.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn cache_invalidated(keys_deleted: u64, metadata_rows: u64) -> Self {
        CacheEvent::CacheInvalidated {
            keys_deleted,
            metadata_rows,
            timestamp: Utc::now(),
        }
    }

    pub fn entity_refreshed(entity_type: &str, entity_id: &str, removed: bool) -> Self {
        CacheEvent::EntityRefreshed {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            removed,
            timestamp: Utc::now(),
        }
    }

    pub fn eviction_performed(evicted: u64, before_bytes: u64, after_bytes: u64) -> Self {
        CacheEvent::EvictionPerformed {
            evicted,
            before_bytes,
            after_bytes,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_and_sync_id() {
        let event = CacheEvent::preload_failed(7, "sections", "timeout");
        assert_eq!(event.event_type(), "PreloadFailed");
        assert_eq!(event.sync_id(), Some(7));

        let event = CacheEvent::cache_invalidated(10, 3);
        assert_eq!(event.sync_id(), None);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = CacheEvent::preload_started(1, "admin");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"PreloadStarted\""));

        let back: CacheEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "PreloadStarted");
    }
}
