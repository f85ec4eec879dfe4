//! Cache Configuration
//!
//! Plain configuration structs with defaults. The binary fills them from CLI
//! flags and environment variables.

use std::collections::HashMap;
use std::time::Duration;

use crate::cache::policy::{DynamicTtlPolicy, EvictionPolicy};
use crate::cache::index::DEFAULT_SEARCH_LIMIT;
use crate::cache::preload::PreloadConfig;
use crate::cache::report::DEFAULT_REPORT_TTL;
use crate::domain::EntityType;
use crate::error::{Error, Result};
use crate::kv::KvConfig;

/// Fixed TTLs for preloaded entries.
#[derive(Debug, Clone, PartialEq)]
pub struct TtlConfig {
    /// TTL for types without an override
    pub default_ttl: Duration,
    /// Per-type TTLs
    pub overrides: HashMap<EntityType, Duration>,
    /// Memoised search results
    pub search_ttl: Duration,
    /// Relationship mirror sets
    pub relationship_ttl: Duration,
}

impl Default for TtlConfig {
    fn default() -> Self {
        let overrides = HashMap::from([
            (EntityType::Division, Duration::from_secs(86_400)),
            (EntityType::Section, Duration::from_secs(86_400)),
            (EntityType::Employee, Duration::from_secs(3600)),
        ]);
        Self {
            default_ttl: Duration::from_secs(3600),
            overrides,
            search_ttl: Duration::from_secs(300),
            relationship_ttl: Duration::from_secs(86_400),
        }
    }
}

impl TtlConfig {
    pub fn for_type(&self, entity_type: EntityType) -> Duration {
        self.overrides
            .get(&entity_type)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    /// Merge `type=seconds` pairs over the current overrides.
    pub fn with_overrides(mut self, spec: &str) -> Result<Self> {
        self.overrides.extend(parse_overrides(spec)?);
        Ok(self)
    }
}

/// Parse `division=86400,employee=3600`.
pub fn parse_overrides(spec: &str) -> Result<HashMap<EntityType, Duration>> {
    let mut overrides = HashMap::new();
    for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (ty, secs) = pair
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("Expected type=seconds, got '{}'", pair)))?;
        let ty: EntityType = ty.parse()?;
        let secs: u64 = secs
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("Invalid TTL seconds in '{}'", pair)))?;
        if secs == 0 {
            return Err(Error::Config(format!("TTL must be positive in '{}'", pair)));
        }
        overrides.insert(ty, Duration::from_secs(secs));
    }
    Ok(overrides)
}

/// Everything the cache service needs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub kv: KvConfig,
    pub ttl: TtlConfig,
    pub preload: PreloadConfig,
    pub dynamic_ttl: DynamicTtlPolicy,
    pub eviction: EvictionPolicy,
    /// Bound on matched rows per index search
    pub search_limit: usize,
    /// Default TTL for computed reports
    pub report_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kv: KvConfig::default(),
            ttl: TtlConfig::default(),
            preload: PreloadConfig::default(),
            dynamic_ttl: DynamicTtlPolicy::standard(),
            eviction: EvictionPolicy::default(),
            search_limit: DEFAULT_SEARCH_LIMIT,
            report_ttl: DEFAULT_REPORT_TTL,
        }
    }
}
