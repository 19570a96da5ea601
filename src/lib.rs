//! OnGarde — intercepting security proxy for AI agent traffic.
//!
//! Sits between agents and LLM providers (OpenAI-compatible and Anthropic
//! Messages APIs), scans every request and response for leaked credentials,
//! PII, prompt injection and dangerous commands, and either forwards the
//! traffic byte-for-byte or blocks it with a structured error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::routing::get;
use axum::Router;

pub mod allowlist;
pub mod audit;
pub mod auth;
pub mod config;
pub mod constants;
pub mod dashboard;
pub mod errors;
pub mod health;
pub mod models;
pub mod proxy;
pub mod scanner;
pub mod utils;

use allowlist::loader::AllowlistLoader;
use audit::AuditBackend;
use health::{ScanLatencyTracker, StreamingMetrics};
use scanner::calibration::CalibrationResult;
use scanner::engine::EngineThresholds;
use scanner::worker::{EntityScanner, NlpWorker};

/// Shared application state passed to handlers.
pub struct AppState {
    pub config: config::Config,
    pub upstream: proxy::upstream::UpstreamClient,
    /// NLP worker handle; `None` in lite mode or after a failed startup.
    pub worker: Option<Arc<NlpWorker>>,
    /// Calibration report, immutable after startup.
    pub calibration: CalibrationResult,
    /// Calibrated routing thresholds (written once before ready).
    pub thresholds: EngineThresholds,
    pub allowlist: Arc<AllowlistLoader>,
    pub audit: Option<Arc<dyn AuditBackend>>,
    pub latency: ScanLatencyTracker,
    pub streaming: Arc<StreamingMetrics>,
    ready: AtomicBool,
}

impl AppState {
    pub fn new(
        config: config::Config,
        upstream: proxy::upstream::UpstreamClient,
        worker: Option<Arc<NlpWorker>>,
        calibration: CalibrationResult,
        allowlist: Arc<AllowlistLoader>,
        audit: Option<Arc<dyn AuditBackend>>,
    ) -> Self {
        Self {
            config,
            upstream,
            worker,
            calibration,
            thresholds: EngineThresholds::conservative(),
            allowlist,
            audit,
            latency: ScanLatencyTracker::default(),
            streaming: Arc::new(StreamingMetrics::default()),
            ready: AtomicBool::new(false),
        }
    }

    /// Open the readiness gate. Called exactly once, after calibration has
    /// been installed and before the listener accepts traffic.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// The entity-detection seam handed to the scan pipeline.
    pub fn entity_scanner(&self) -> Option<Arc<dyn EntityScanner>> {
        self.worker
            .clone()
            .map(|worker| worker as Arc<dyn EntityScanner>)
    }
}

/// Assemble the router: health endpoints plus the catch-all proxy handler,
/// with the body-size cap applied before anything else sees the request.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/health/scanner", get(health::health_scanner))
        .fallback(axum::routing::any(proxy::handler::proxy_handler))
        .layer(axum::middleware::from_fn(proxy::middleware::body_size_limit))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
