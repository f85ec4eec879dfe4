//! Health Checks
//!
//! Liveness and readiness probes for the ops server, plus component checks
//! against the KV backend, the source store and the catalog.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::cache::CacheService;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    /// Serving, with a component falling back
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Healthy or degraded
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Result of one component check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl HealthCheckResult {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            duration_ms: 0,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Worst status across checks
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    pub version: String,
    pub uptime_seconds: u64,
}

impl HealthResponse {
    pub fn new(checks: Vec<HealthCheckResult>, uptime: Duration) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checks,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }
}

/// Probe state for the ops server.
pub struct HealthCheck {
    start_time: Instant,
    live: AtomicBool,
    ready: AtomicBool,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthCheck {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    /// Set once startup (connect, optional preload) has finished.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Run every component check.
    ///
    /// A missing KV backend only degrades: reads fall through to the source.
    pub async fn check_all(&self, service: &CacheService) -> HealthResponse {
        let checks = vec![
            check_kv(service).await,
            check_source(service).await,
            check_catalog(service).await,
            check_warm(service).await,
        ];
        HealthResponse::new(checks, self.uptime())
    }
}

async fn check_kv(service: &CacheService) -> HealthCheckResult {
    let started = Instant::now();
    let client = service.client();
    let result = if !client.is_enabled() {
        HealthCheckResult::degraded("kv", "caching disabled, bypass mode")
    } else if !client.ping().await {
        HealthCheckResult::degraded("kv", "backend unreachable, bypass mode")
    } else {
        match client.memory_info().await {
            Some(info) if service.evictor().policy().should_warn(&info) => {
                let ratio = service.evictor().policy().usage_ratio(&info);
                HealthCheckResult::degraded("kv", format!("memory at {:.0}%", ratio * 100.0))
            }
            _ => HealthCheckResult::healthy("kv"),
        }
    };
    result.with_duration(started.elapsed())
}

async fn check_source(service: &CacheService) -> HealthCheckResult {
    let started = Instant::now();
    let result = match service.source().health_check().await {
        Ok(true) => HealthCheckResult::healthy("source"),
        Ok(false) => HealthCheckResult::unhealthy("source", "source store not ready"),
        Err(e) => HealthCheckResult::unhealthy("source", e.to_string()),
    };
    result.with_duration(started.elapsed())
}

async fn check_catalog(service: &CacheService) -> HealthCheckResult {
    let started = Instant::now();
    let result = match service.catalog().list_metadata().await {
        Ok(_) => HealthCheckResult::healthy("catalog"),
        Err(e) => HealthCheckResult::unhealthy("catalog", e.to_string()),
    };
    result.with_duration(started.elapsed())
}

async fn check_warm(service: &CacheService) -> HealthCheckResult {
    if service.is_cache_warm().await {
        HealthCheckResult::healthy("preload")
    } else {
        HealthCheckResult::degraded("preload", "cache not warm")
    }
}
