//! KV Tier
//!
//! Key namespaces and the degrading client every cache component talks to.
//!
//! # Architecture
//!
//! - **Keys** (`keys.rs`) - Namespace enum, key builders, glob helpers
//! - **Client** (`client.rs`) - `CacheClient` lifecycle, neutral-value
//!   commands and the in-process namespace registry

pub mod client;
pub mod keys;

pub use client::{CacheClient, KvConfig, NamespaceRegistry};
pub use keys::{glob_escape, glob_match, Namespace};
