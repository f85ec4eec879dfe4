//! rostercache - Cache Orchestration for HR/Attendance Reporting
//!
//! A multi-tier caching engine between a relational source of truth and the
//! request handlers of an HR/attendance application. Provides O(1) entity
//! lookups, secondary indexes, relationship traversal, usage-driven eviction
//! and asynchronous bulk preloading with progress tracking.
//!
//! # Architecture
//!
//! ```text
//! Request handlers
//!       │
//!       ▼
//! CacheService ── LazyLoader / ReportCache / IndexRegistry / RelationshipGraph
//!       │                 │
//!       │                 ▼
//!       │           CacheClient (KV, degrades to bypass)
//!       ▼
//! PreloadOrchestrator ──► JobTracker        MaintenanceScheduler (background)
//!       │
//!       ▼
//! SourceStore (read-only)   CatalogStore (index / edges / metadata / logs)
//! ```
//!
//! A KV outage never fails a request: every cache read degrades to a miss
//! and every write to a no-op, and reads fall through to the source.
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`cache`] - Preload, lazy loading, indexes, relationships, eviction, jobs
//! - [`config`] - Configuration structs and TTL override parsing
//! - [`domain`] - Entities, catalog rows, ports and events
//! - [`error`] - Error types
//! - [`kv`] - Key namespaces and the degrading KV client
//! - [`metrics`] - Cache counters and Prometheus series
//! - [`scheduler`] - Maintenance tasks and health checks

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod kv;
pub mod metrics;
pub mod scheduler;

// Re-export commonly used types
pub use cache::{CacheKeySpec, CacheService, JobKind, JobStatus, PreloadJob};
pub use config::{CacheConfig, TtlConfig};
pub use error::{Error, Result};
pub use kv::{CacheClient, KvConfig, Namespace};
pub use scheduler::{MaintenanceScheduler, SchedulerConfig};
