//! Error types for the cache orchestration layer

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache orchestration layer
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // KV Backend Errors
    // =========================================================================
    /// KV connect/command failure. Recovered inside `CacheClient`, never
    /// surfaced by cache-facing APIs.
    #[error("KV backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Redis driver error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // =========================================================================
    // Source / Catalog Errors
    // =========================================================================
    /// Source-of-truth query failed during a miss-fill or preload
    #[error("Source store unavailable: {0}")]
    SourceUnavailable(String),

    /// Durable index/relationship/metadata table failure
    #[error("Catalog error: {0}")]
    Catalog(String),

    // =========================================================================
    // Preload Errors
    // =========================================================================
    /// A preload step failed; earlier steps keep their cache state
    #[error("Preload step '{step}' failed: {reason}")]
    PreloadStepFailed { step: String, reason: String },

    /// The cache was invalidated while a preload was running
    #[error("Preload superseded by invalidation (generation {started} -> {current})")]
    PreloadSuperseded { started: u64, current: u64 },

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(String),

    // =========================================================================
    // General Errors
    // =========================================================================
    /// Payload (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error originates from the KV tier.
    ///
    /// KV tier errors are always recovered locally (log + neutral value).
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            Error::BackendUnavailable(_) | Error::Redis(_) | Error::Timeout(_)
        )
    }
}
