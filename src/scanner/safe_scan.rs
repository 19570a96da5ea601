//! Scan gate — the fail-safe atomic wrapper.
//!
//! `scan_or_block()` is the ONLY entry point for scan operations in the
//! proxy handler. Its invariants define the gate:
//!
//!   - ALWAYS returns a `ScanResult`; never fails, never panics outward.
//!   - Bounded time: the whole pipeline runs under a 60 ms safety-net
//!     deadline (≥ the calibrated per-operation NLP timeout).
//!   - Fail-closed: a pipeline error, a panic, or the global deadline all
//!     produce a BLOCK. Errors map to `SCANNER_ERROR`, deadlines to
//!     `SCANNER_TIMEOUT`, both `CRITICAL`. These are HTTP 400 policy
//!     blocks, not 500s — a scanner that cannot answer must not open a
//!     bypass window.
//!   - Allowlist matching runs only on policy BLOCK results — never on
//!     ALLOW, never on the error paths.
//!   - Elapsed wall time is recorded into the latency tracker on every
//!     outcome; tracker failures never affect the result.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use tokio::time::Instant;

use crate::allowlist::loader::AllowlistLoader;
use crate::allowlist::matcher::apply_allowlist;
use crate::constants::SCANNER_GLOBAL_TIMEOUT;
use crate::health::ScanLatencyTracker;
use crate::models::scan::{Action, ScanResult};
use crate::scanner::engine::{scan_request, EngineThresholds, ScanError};
use crate::scanner::worker::EntityScanner;

/// Run the scan pipeline under the fail-safe gate.
pub async fn scan_or_block(
    content: &str,
    scanner: Option<Arc<dyn EntityScanner>>,
    thresholds: &EngineThresholds,
    scan_id: &str,
    latency: Option<&ScanLatencyTracker>,
    allowlist: Option<&AllowlistLoader>,
) -> ScanResult {
    let pipeline = scan_request(content, scanner, thresholds, scan_id);
    gate(pipeline, content, scan_id, latency, allowlist).await
}

/// The gate itself, generic over the pipeline future so failure modes can
/// be exercised in tests without a live worker.
pub(crate) async fn gate<F>(
    pipeline: F,
    content: &str,
    scan_id: &str,
    latency: Option<&ScanLatencyTracker>,
    allowlist: Option<&AllowlistLoader>,
) -> ScanResult
where
    F: Future<Output = Result<ScanResult, ScanError>>,
{
    let t0 = Instant::now();

    let outcome = tokio::time::timeout(
        SCANNER_GLOBAL_TIMEOUT,
        std::panic::AssertUnwindSafe(pipeline).catch_unwind(),
    )
    .await;
    record_latency(latency, t0);

    let result = match outcome {
        // Global deadline expired — slow scanners must not open a bypass window.
        Err(_) => {
            tracing::error!(
                scan_id,
                timeout_ms = SCANNER_GLOBAL_TIMEOUT.as_millis() as u64,
                "global scanner timeout — blocking"
            );
            return ScanResult::system_block(scan_id, "SCANNER_TIMEOUT");
        }
        // The pipeline panicked. Fail closed.
        Ok(Err(_panic)) => {
            tracing::error!(scan_id, "scan pipeline panicked — blocking");
            return ScanResult::system_block(scan_id, "SCANNER_ERROR");
        }
        Ok(Ok(Err(ScanError::Timeout))) => {
            tracing::error!(scan_id, "NLP scan timeout — blocking");
            return ScanResult::system_block(scan_id, "SCANNER_TIMEOUT");
        }
        Ok(Ok(Err(ScanError::Worker(e)))) => {
            tracing::error!(scan_id, error = %e, "scanner failure — blocking");
            return ScanResult::system_block(scan_id, "SCANNER_ERROR");
        }
        Ok(Ok(Ok(result))) => result,
    };

    // Allowlist check: BLOCK results only. Error paths returned above and
    // never reach here — scanner faults are not suppressible.
    if result.action == Action::Block {
        if let Some(loader) = allowlist {
            let entries = loader.entries();
            if !entries.is_empty() {
                return apply_allowlist(result, content, &entries);
            }
        }
    }

    result
}

fn record_latency(tracker: Option<&ScanLatencyTracker>, t0: Instant) {
    if let Some(tracker) = tracker {
        tracker.record(t0.elapsed().as_secs_f64() * 1000.0);
    }
}
