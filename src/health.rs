//! Health trackers and endpoints.
//!
//! Two rolling-window trackers feed `/health` and `/health/scanner`:
//!
//! - [`ScanLatencyTracker`] — last 100 full-scan durations (avg, p99).
//! - [`StreamingMetrics`] — active-stream gauge plus last 100 per-window
//!   scan durations.
//!
//! Both report `p99 = 0.0` until 10 samples exist; a p99 over a tiny sample
//! set misleads more than it informs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::config::ScannerMode;
use crate::errors::AppError;
use crate::AppState;

const DEFAULT_WINDOW: usize = 100;
const MIN_P99_SAMPLES: usize = 10;

#[derive(Debug)]
struct RollingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn record(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn avg(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    fn p99(&self) -> f64 {
        if self.samples.len() < MIN_P99_SAMPLES {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((sorted.len() as f64 * 0.99) as usize)
            .saturating_sub(1)
            .min(sorted.len() - 1);
        sorted[idx]
    }

    fn count(&self) -> usize {
        self.samples.len()
    }
}

/// Rolling window of full-scan latencies.
#[derive(Debug)]
pub struct ScanLatencyTracker {
    window: Mutex<RollingWindow>,
}

impl Default for ScanLatencyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl ScanLatencyTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: Mutex::new(RollingWindow::new(window)),
        }
    }

    pub fn record(&self, duration_ms: f64) {
        if let Ok(mut w) = self.window.lock() {
            w.record(duration_ms);
        }
    }

    pub fn avg_ms(&self) -> f64 {
        self.window.lock().map(|w| w.avg()).unwrap_or(0.0)
    }

    pub fn p99_ms(&self) -> f64 {
        self.window.lock().map(|w| w.p99()).unwrap_or(0.0)
    }

    pub fn count(&self) -> usize {
        self.window.lock().map(|w| w.count()).unwrap_or(0)
    }
}

/// Active-stream gauge and per-window scan latency tracker.
#[derive(Debug)]
pub struct StreamingMetrics {
    active: AtomicU64,
    window: Mutex<RollingWindow>,
}

impl Default for StreamingMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl StreamingMetrics {
    pub fn new(window: usize) -> Self {
        Self {
            active: AtomicU64::new(0),
            window: Mutex::new(RollingWindow::new(window)),
        }
    }

    pub fn stream_opened(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the gauge, saturating at zero.
    pub fn stream_closed(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn active_count(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn record_window_scan(&self, duration_ms: f64) {
        if let Ok(mut w) = self.window.lock() {
            w.record(duration_ms);
        }
    }

    pub fn window_avg_ms(&self) -> f64 {
        self.window.lock().map(|w| w.avg()).unwrap_or(0.0)
    }

    pub fn window_p99_ms(&self) -> f64 {
        self.window.lock().map(|w| w.p99()).unwrap_or(0.0)
    }

    pub fn window_count(&self) -> usize {
        self.window.lock().map(|w| w.count()).unwrap_or(0)
    }
}

/// RAII guard pairing `stream_opened` with a guaranteed `stream_closed`,
/// so every exit path (normal completion, abort, panic) decrements the gauge.
pub struct StreamGuard {
    metrics: Arc<StreamingMetrics>,
}

impl StreamGuard {
    pub fn open(metrics: Arc<StreamingMetrics>) -> Self {
        metrics.stream_opened();
        Self { metrics }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.metrics.stream_closed();
    }
}

// ── Endpoints ─────────────────────────────────────────────────

/// `GET /health` — 503 until the readiness gate opens, then a status body.
pub async fn health(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    if !state.is_ready() {
        return Err(AppError::NotReady);
    }

    let scanner_healthy = match state.config.scanner.mode {
        ScannerMode::Lite => true,
        ScannerMode::Full => !state.config.scanner.nlp_enabled() || state.worker.is_some(),
    };

    Ok(Json(json!({
        "status": if scanner_healthy { "ok" } else { "degraded" },
        "proxy": "running",
        "scanner": if scanner_healthy { "healthy" } else { "error" },
        "scanner_mode": match state.config.scanner.mode {
            ScannerMode::Full => "full",
            ScannerMode::Lite => "lite",
        },
        "avg_scan_ms": state.latency.avg_ms(),
        "streaming_active": state.streaming.active_count(),
        "audit_path": state.config.audit_path().display().to_string(),
    })))
}

/// `GET /health/scanner` — calibration report + latency trackers.
pub async fn health_scanner(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    if !state.is_ready() {
        return Err(AppError::NotReady);
    }

    let calibration = &state.calibration;
    let measurements: serde_json::Map<String, serde_json::Value> = calibration
        .measurements
        .iter()
        .map(|(size, p99)| (size.to_string(), json!(p99)))
        .collect();

    Ok(Json(json!({
        "worker_available": state.worker.is_some(),
        "calibration": {
            "tier": calibration.tier.as_str(),
            "sync_cap": state.thresholds.sync_cap(),
            "timeout_ms": state.thresholds.timeout().as_millis() as u64,
            "measurements": measurements,
            "ok": calibration.ok,
            "fallback_reason": calibration.fallback_reason.clone(),
        },
        "scan_latency": {
            "avg_ms": state.latency.avg_ms(),
            "p99_ms": state.latency.p99_ms(),
            "count": state.latency.count(),
        },
        "streaming": {
            "active": state.streaming.active_count(),
            "window_scan_avg_ms": state.streaming.window_avg_ms(),
            "window_scan_p99_ms": state.streaming.window_p99_ms(),
            "window_scan_count": state.streaming.window_count(),
        },
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_tracker_avg() {
        let tracker = ScanLatencyTracker::default();
        assert_eq!(tracker.avg_ms(), 0.0);
        tracker.record(10.0);
        tracker.record(20.0);
        assert_eq!(tracker.avg_ms(), 15.0);
    }

    #[test]
    fn test_p99_zero_under_ten_samples() {
        let tracker = ScanLatencyTracker::default();
        for _ in 0..9 {
            tracker.record(5.0);
        }
        assert_eq!(tracker.p99_ms(), 0.0);
        tracker.record(5.0);
        assert!(tracker.p99_ms() > 0.0);
    }

    #[test]
    fn test_p99_picks_high_sample() {
        let tracker = ScanLatencyTracker::default();
        for _ in 0..99 {
            tracker.record(1.0);
        }
        tracker.record(100.0);
        assert!(tracker.p99_ms() >= 1.0);
        assert!(tracker.avg_ms() < 5.0);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let tracker = ScanLatencyTracker::new(3);
        tracker.record(100.0);
        tracker.record(1.0);
        tracker.record(1.0);
        tracker.record(1.0); // evicts 100.0
        assert_eq!(tracker.avg_ms(), 1.0);
        assert_eq!(tracker.count(), 3);
    }

    #[test]
    fn test_streaming_gauge_never_negative() {
        let metrics = StreamingMetrics::default();
        metrics.stream_closed();
        assert_eq!(metrics.active_count(), 0);
        metrics.stream_opened();
        metrics.stream_opened();
        metrics.stream_closed();
        assert_eq!(metrics.active_count(), 1);
    }

    #[test]
    fn test_stream_guard_decrements_on_drop() {
        let metrics = Arc::new(StreamingMetrics::default());
        {
            let _guard = StreamGuard::open(metrics.clone());
            assert_eq!(metrics.active_count(), 1);
        }
        assert_eq!(metrics.active_count(), 0);
    }

    #[test]
    fn test_window_scan_metrics() {
        let metrics = StreamingMetrics::default();
        for i in 0..12 {
            metrics.record_window_scan(i as f64);
        }
        assert_eq!(metrics.window_count(), 12);
        assert!(metrics.window_avg_ms() > 0.0);
        assert!(metrics.window_p99_ms() > 0.0);
    }
}
