//! Domain Layer
//!
//! Core types and port traits of the cache layer.
//!
//! # Architecture
//!
//! - **Model** (`model.rs`) - Entities, report parameters and catalog rows
//! - **Ports** (`ports.rs`) - Trait abstractions for external dependencies
//! - **Events** (`events.rs`) - Cache events for audit and decoupling
//!
//! # Usage
//!
//! ```ignore
//! use rostercache::domain::ports::{KvStore, SourceStore};
//!
//! async fn warm<K, S>(kv: &K, source: &S) -> Result<()>
//! where
//!     K: KvStore,
//!     S: SourceStore,
//! {
//!     let divisions = source.list_divisions().await?;
//!     // ...
//! }
//! ```

pub mod events;
pub mod model;
pub mod ports;

pub use events::CacheEvent;
pub use model::{
    AttendanceRecord, CacheMetadata, Division, Employee, Entity, EntityType, IndexEntry,
    Indexed, ParentLink, PerformanceReport, RelationshipEdge, ReportParams, Section, SyncLog,
    SyncStatus, RELATIONSHIP_COLLECTION,
};
pub use ports::{
    CatalogStore, EventPublisher, KeyTtl, KvBatch, KvOp, KvStore, MemoryInfo, SourceStore,
};
