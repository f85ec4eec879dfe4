//! Cache Components
//!
//! Everything between request handlers and the KV tier.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── CacheService ─────────────────────────────┐
//! │  LazyLoader   ReportCache   IndexRegistry   RelationshipGraph         │
//! │  PreloadOrchestrator ──► JobTracker         UsageTracker ──► Evictor  │
//! └────────────────────────────────┬──────────────────────────────────────┘
//!                                  ▼
//!                   CacheClient (kv)  +  CatalogStore / SourceStore ports
//! ```
//!
//! - **Policy** (`policy.rs`) - Dynamic TTL tiers and eviction thresholds
//! - **Usage** (`usage.rs`) - Access counters with snapshot/restore
//! - **Evictor** (`evictor.rs`) - Usage-ranked eviction of lazy entries
//! - **Lazy** (`lazy.rs`) - Get-or-fetch and paged streaming
//! - **Index** (`index.rs`) - Secondary attribute lookup
//! - **Relationships** (`relationships.rs`) - Parent to child traversal
//! - **Jobs** (`jobs.rs`) - Single-flight progress tracking
//! - **Report** (`report.rs`) - Computed report payloads
//! - **Preload** (`preload.rs`) - Full bulk load and invalidation
//! - **Service** (`service.rs`) - Wiring and the request-facing facade

pub mod evictor;
pub mod index;
pub mod jobs;
pub mod lazy;
pub mod policy;
pub mod preload;
mod proptest;
pub mod relationships;
pub mod report;
pub mod service;
pub mod usage;

pub use evictor::{EvictionOutcome, Evictor};
pub use index::IndexRegistry;
pub use jobs::{JobHandle, JobKind, JobStatus, JobTracker, PreloadJob};
pub use lazy::LazyLoader;
pub use policy::{DynamicTtlPolicy, EvictionPolicy};
pub use preload::{InvalidationReport, PreloadConfig, PreloadOrchestrator, PreloadReport, StepReport};
pub use relationships::{MirrorSync, RelationshipGraph};
pub use report::{generate_key, CacheKeySpec, ReportCache, ReportCacheStats};
pub use service::{CacheService, CacheStatus};
pub use usage::{UsageAnalysis, UsageCounter, UsageSnapshot, UsageThresholds, UsageTracker};
