//! rostercache operator binary
//!
//! Wires the cache service over Redis, starts the maintenance scheduler and
//! serves the ops endpoints.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         rostercache                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  Ops server  │───▶│ CacheService │◀───│ Maintenance  │       │
//! │  │ (health,     │    │ (preload,    │    │  Scheduler   │       │
//! │  │  metrics)    │    │  lookups)    │    │              │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rostercache::adapters::{
    InMemoryEventCollector, LoggingEventPublisher, MemoryCatalog, MemorySourceStore, RedisKvStore,
};
use rostercache::cache::{EvictionPolicy, PreloadConfig};
use rostercache::domain::ports::SourceStore;
use rostercache::domain::CacheEvent;
use rostercache::metrics::exporter;
use rostercache::scheduler::HealthCheck;
use rostercache::{
    CacheConfig, CacheService, Error, KvConfig, MaintenanceScheduler, Result, SchedulerConfig,
    TtlConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// rostercache - cache orchestration for HR/attendance reporting
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Redis host
    #[arg(long, env = "REDIS_HOST", default_value = "127.0.0.1")]
    redis_host: String,

    /// Redis port
    #[arg(long, env = "REDIS_PORT", default_value = "6379")]
    redis_port: u16,

    /// Redis password
    #[arg(long, env = "REDIS_PASSWORD")]
    redis_password: Option<String>,

    /// Redis database index
    #[arg(long, env = "REDIS_DB", default_value = "0")]
    redis_db: i64,

    /// Enable the KV tier (false runs every lookup against the source)
    #[arg(long, env = "CACHE_ENABLED", default_value_t = true, action = ArgAction::Set)]
    cache_enabled: bool,

    /// TTL for preloaded entries without a per-type override
    #[arg(long, env = "CACHE_DEFAULT_TTL_SECONDS", default_value = "3600")]
    default_ttl_seconds: u64,

    /// Per-type TTL overrides, e.g. `division=86400,employee=3600`
    #[arg(long, env = "CACHE_TTL_OVERRIDES")]
    ttl_overrides: Option<String>,

    /// Connect timeout in milliseconds
    #[arg(long, env = "REDIS_CONNECT_TIMEOUT_MS", default_value = "5000")]
    connect_timeout_ms: u64,

    /// Command timeout in milliseconds
    #[arg(long, env = "REDIS_COMMAND_TIMEOUT_MS", default_value = "3000")]
    command_timeout_ms: u64,

    /// Connection attempts after the first
    #[arg(long, env = "REDIS_MAX_RETRIES", default_value = "3")]
    max_retries: u32,

    /// Backoff multiplier between attempts in milliseconds
    #[arg(long, env = "REDIS_BACKOFF_MS", default_value = "200")]
    backoff_ms: u64,

    /// Upper bound on the retry delay in milliseconds
    #[arg(long, env = "REDIS_RETRY_CAP_MS", default_value = "2000")]
    retry_cap_ms: u64,

    /// Memory ceiling for eviction when Redis reports no maxmemory
    #[arg(long, env = "CACHE_MEMORY_CEILING_MB", default_value = "512")]
    memory_ceiling_mb: u64,

    /// Rows per preload pipeline
    #[arg(long, env = "PRELOAD_BATCH_SIZE", default_value = "500")]
    preload_batch_size: usize,

    /// Run a full preload at startup
    #[arg(long, env = "PRELOAD_ON_START")]
    preload_on_start: bool,

    /// JSON snapshot backing the bundled source adapter
    #[arg(long, env = "SOURCE_SNAPSHOT")]
    source_snapshot: Option<PathBuf>,

    /// Ops server bind address
    #[arg(long, env = "OPS_ADDR", default_value = "0.0.0.0:8080")]
    ops_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn cache_config(&self) -> Result<CacheConfig> {
        let kv = KvConfig {
            host: self.redis_host.clone(),
            port: self.redis_port,
            password: self.redis_password.clone(),
            db: self.redis_db,
            enabled: self.cache_enabled,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.backoff_ms),
            retry_cap: Duration::from_millis(self.retry_cap_ms),
        };

        let mut ttl = TtlConfig {
            default_ttl: Duration::from_secs(self.default_ttl_seconds),
            ..Default::default()
        };
        if let Some(overrides) = &self.ttl_overrides {
            ttl = ttl.with_overrides(overrides)?;
        }

        if self.preload_batch_size == 0 {
            return Err(Error::Config("PRELOAD_BATCH_SIZE must be positive".to_string()));
        }

        Ok(CacheConfig {
            kv,
            ttl,
            preload: PreloadConfig {
                batch_size: self.preload_batch_size,
                ..Default::default()
            },
            eviction: EvictionPolicy::with_ceiling_mb(self.memory_ceiling_mb),
            ..Default::default()
        })
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = args.cache_config()?;
    info!("Starting rostercache");
    info!("  Redis: {}:{} db {}", config.kv.host, config.kv.port, config.kv.db);
    info!("  Cache enabled: {}", config.kv.enabled);
    info!("  Preload batch size: {}", config.preload.batch_size);
    info!("  Memory ceiling: {} MB", args.memory_ceiling_mb);

    let source: Arc<dyn SourceStore> = match &args.source_snapshot {
        Some(path) => Arc::new(MemorySourceStore::from_json_file(path)?),
        None => {
            warn!("No SOURCE_SNAPSHOT given, serving an empty source store");
            Arc::new(MemorySourceStore::new())
        }
    };
    let store = Arc::new(RedisKvStore::new(&config.kv)?);
    let history = Arc::new(InMemoryEventCollector::with_capacity(EVENT_HISTORY));

    let service = Arc::new(CacheService::new(
        config,
        store,
        source,
        Arc::new(MemoryCatalog::new()),
        Arc::new(LoggingEventPublisher::new().with_history(history.clone())),
    ));

    if !service.connect().await {
        warn!("Running without KV cache; lookups go to the source store");
    }

    let health = Arc::new(HealthCheck::new());
    let scheduler = Arc::new(MaintenanceScheduler::new(
        service.clone(),
        SchedulerConfig::default(),
    ));
    tokio::spawn(scheduler.clone().run());

    let state = Arc::new(OpsState {
        service: service.clone(),
        scheduler: scheduler.clone(),
        health: health.clone(),
        history,
    });
    let ops_addr = args.ops_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_ops_server(&ops_addr, state).await {
            error!("Ops server error: {}", e);
        }
    });

    if args.preload_on_start {
        match service.ensure_warm("startup").await {
            Ok(true) => info!("Startup preload completed"),
            Ok(false) => info!("Cache already warm"),
            Err(e) => error!("Startup preload failed: {}", e),
        }
    }
    health.set_ready(true);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    health.set_ready(false);
    scheduler.shutdown().await;
    service.client().disconnect().await;

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "redis=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Ops Server
// =============================================================================

/// Cache events kept for `/events` and `/status`.
const EVENT_HISTORY: usize = 256;

/// Events shown on `/status`.
const STATUS_EVENTS: usize = 10;

struct OpsState {
    service: Arc<CacheService>,
    scheduler: Arc<MaintenanceScheduler>,
    health: Arc<HealthCheck>,
    history: Arc<InMemoryEventCollector>,
}

type OpsResponse = Response<Full<Bytes>>;

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> OpsResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn text(status: StatusCode, body: &'static str) -> OpsResponse {
    respond(status, "text/plain; charset=utf-8", body)
}

fn json<T: Serialize>(status: StatusCode, body: &T) -> OpsResponse {
    match serde_json::to_vec(body) {
        Ok(bytes) => respond(status, "application/json", bytes),
        Err(e) => {
            error!("Failed to encode response: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "encoding error")
        }
    }
}

#[derive(Serialize)]
struct StatusBody {
    cache: rostercache::cache::CacheStatus,
    scheduler: rostercache::scheduler::SchedulerStatus,
    recent_events: Vec<CacheEvent>,
}

#[derive(Serialize)]
struct PreloadAccepted {
    job: rostercache::PreloadJob,
    is_new: bool,
}

async fn handle(
    state: Arc<OpsState>,
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<OpsResponse, Infallible> {
    let path = req.uri().path().to_string();
    let response = match (req.method(), path.as_str()) {
        (&Method::GET, "/healthz") | (&Method::GET, "/livez") => {
            if state.health.is_live() {
                text(StatusCode::OK, "ok")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "not live")
            }
        }
        (&Method::GET, "/readyz") => {
            let report = state.health.check_all(&state.service).await;
            let status = if state.health.is_ready() && report.status.is_operational() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json(status, &report)
        }
        (&Method::GET, "/metrics") => match exporter::render() {
            Ok((content_type, body)) => respond(StatusCode::OK, &content_type, body),
            Err(e) => {
                error!("Failed to render metrics: {}", e);
                text(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
            }
        },
        (&Method::GET, "/status") => {
            let body = StatusBody {
                cache: state.service.status().await,
                scheduler: state.scheduler.status(),
                recent_events: state.history.recent(STATUS_EVENTS),
            };
            json(StatusCode::OK, &body)
        }
        (&Method::GET, "/events") => json(StatusCode::OK, &state.history.recent(EVENT_HISTORY)),
        (&Method::POST, "/preload") => match state.service.trigger_preload("ops") {
            Ok((job, is_new)) => json(StatusCode::ACCEPTED, &PreloadAccepted { job, is_new }),
            Err(e) => {
                error!("Failed to start preload: {}", e);
                text(StatusCode::INTERNAL_SERVER_ERROR, "preload not started")
            }
        },
        (&Method::GET, p) if p.starts_with("/jobs/") => {
            let id = &p["/jobs/".len()..];
            match state.service.jobs().get_job(id) {
                Ok(job) => json(StatusCode::OK, &job),
                Err(_) => text(StatusCode::NOT_FOUND, "job not found"),
            }
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn run_ops_server(addr: &str, state: Arc<OpsState>) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid ops server address: {}", e)))?;

    let listener = TcpListener::bind(addr).await?;
    info!("Ops server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(state.clone(), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Ops server connection error: {}", e);
            }
        });
    }
}
