//! NLP worker lifecycle: startup, warmup, smoke test, calibration, shutdown.
//!
//! Startup sequence (runs before the readiness gate opens):
//!   0. Lite mode or no worker command → skip entirely, conservative fallback.
//!   1. Spawn the worker subprocess and send `init` with the entity set.
//!   2. Warmup: 15 scans (5 sizes × 3 iterations) of benign prose, so JIT
//!      and first-call latency spikes are burned off before production
//!      traffic. Individual warmup failures are logged, never fatal.
//!   3. Smoke test: one scan with a generous timeout decides availability.
//!   4. Calibration measures hardware p99 and derives routing thresholds.
//!
//! Failure never aborts startup: every path degrades to (no worker,
//! conservative fallback) and the proxy runs regex-only.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ScannerConfig;
use crate::scanner::calibration::{run_calibration, CalibrationResult};
use crate::scanner::worker::{EntityScanner, NlpWorker};

/// Warmup sizes and repetitions — 15 scans total.
const WARMUP_SIZES: [usize; 5] = [100, 200, 300, 500, 1000];
const WARMUP_ITERATIONS: usize = 3;

/// Generous budget for init (model load on slow disks) and the smoke test.
const INIT_TIMEOUT: Duration = Duration::from_secs(60);
const SMOKE_TEST_TIMEOUT: Duration = Duration::from_secs(30);

const WARMUP_TEMPLATE: &str = "The quick brown fox jumps over the lazy dog. \
Alice went to the market to buy fresh vegetables and fruits. \
Bob called his colleague to discuss the quarterly report. \
The conference is scheduled for next Tuesday in the main meeting room. \
Please review the attached document and provide feedback by Friday. ";

fn make_warmup_text(size: usize) -> String {
    WARMUP_TEMPLATE.chars().cycle().take(size).collect()
}

/// Bring up the NLP worker and calibrate. Never fails — on any problem the
/// worker is absent and the calibration result is the conservative fallback.
pub async fn startup_scan_worker(
    scanner: &ScannerConfig,
) -> (Option<Arc<NlpWorker>>, CalibrationResult) {
    // Step 0: lite mode / no worker command → regex-only.
    if !scanner.nlp_enabled() {
        tracing::info!("NLP worker disabled (lite mode or no worker_cmd) — regex-only scanning");
        return (
            None,
            CalibrationResult::conservative_fallback("NLP worker intentionally disabled"),
        );
    }

    let entity_set = scanner.effective_entity_set();
    tracing::info!(entities = ?entity_set, cmd = ?scanner.worker_cmd, "starting NLP worker");

    // Step 1: spawn + init.
    let worker = match NlpWorker::spawn(&scanner.worker_cmd) {
        Ok(w) => Arc::new(w),
        Err(e) => {
            tracing::error!(error = %e, "NLP worker spawn failed");
            return (
                None,
                CalibrationResult::conservative_fallback(format!("worker spawn failed: {e}")),
            );
        }
    };

    match tokio::time::timeout(INIT_TIMEOUT, worker.init(&entity_set)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(error = %e, "NLP worker init failed — worker unavailable");
            worker.shutdown().await;
            return (
                None,
                CalibrationResult::conservative_fallback(format!("worker init failed: {e}")),
            );
        }
        Err(_) => {
            tracing::error!("NLP worker init timed out — worker unavailable");
            worker.shutdown().await;
            return (
                None,
                CalibrationResult::conservative_fallback("worker init timed out"),
            );
        }
    }

    // Step 2: warmup. Eliminates first-call latency spikes before the
    // calibration probes measure steady-state cost.
    let mut warmed = 0usize;
    for size in WARMUP_SIZES {
        let text = make_warmup_text(size);
        for iteration in 0..WARMUP_ITERATIONS {
            match worker.scan(&text).await {
                Ok(_) => warmed += 1,
                Err(e) => {
                    tracing::warn!(size, iteration, error = %e, "warmup scan failed (non-fatal)");
                }
            }
        }
    }
    tracing::info!(warmed, "NLP worker warmup complete");

    // Step 3: smoke test — availability decision.
    match tokio::time::timeout(SMOKE_TEST_TIMEOUT, worker.scan("smoke test")).await {
        Ok(Ok(_)) => tracing::info!("NLP worker smoke test passed"),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "NLP worker smoke test failed — worker unavailable");
            worker.shutdown().await;
            return (
                None,
                CalibrationResult::conservative_fallback(format!("smoke test failed: {e}")),
            );
        }
        Err(_) => {
            tracing::error!("NLP worker smoke test timed out — worker unavailable");
            worker.shutdown().await;
            return (
                None,
                CalibrationResult::conservative_fallback("smoke test timed out"),
            );
        }
    }

    // Step 4: calibration. A calibration failure keeps the worker usable.
    let calibration = run_calibration(worker.as_ref() as &dyn EntityScanner).await;
    (Some(worker), calibration)
}

/// Effective thresholds after operator overrides. Explicit config values
/// always win over measurements.
pub fn effective_thresholds(
    calibration: &CalibrationResult,
    scanner: &ScannerConfig,
) -> (usize, Duration) {
    let sync_cap = scanner.sync_cap_override.unwrap_or(calibration.sync_cap);
    let timeout = scanner
        .timeout_ms_override
        .map(Duration::from_millis)
        .unwrap_or(calibration.timeout);
    (sync_cap, timeout)
}

/// Graceful worker shutdown, called from the server shutdown path.
pub async fn shutdown_scan_worker(worker: Option<&Arc<NlpWorker>>) {
    if let Some(worker) = worker {
        tracing::info!("shutting down NLP worker...");
        worker.shutdown().await;
    }
}
