//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  KvStore │ SourceStore │ CatalogStore │ EventPublisher     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ RedisKvStore │ MemoryKvStore │ MemorySourceStore           │ │
//! │  │ MemoryCatalog │ LoggingEventPublisher                      │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use rostercache::adapters::{MemorySourceStore, RedisKvStore};
//! use rostercache::kv::{CacheClient, KvConfig};
//!
//! let config = KvConfig::default();
//! let store = Arc::new(RedisKvStore::new(&config)?);
//! let client = CacheClient::new(store, config);
//! client.connect().await;
//! ```

mod memory_catalog;
mod memory_kv;
mod memory_source;
mod redis_kv;

pub use memory_catalog::MemoryCatalog;
pub use memory_kv::MemoryKvStore;
pub use memory_source::{MemorySourceStore, SourceSnapshot};
pub use redis_kv::{parse_memory_info, RedisKvStore};

mod event_publisher;
pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
