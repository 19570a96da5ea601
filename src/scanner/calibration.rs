//! Startup hardware calibration for the NLP path.
//!
//! Rather than assuming a particular host, the proxy measures actual NLP
//! latency at startup and derives its routing thresholds from the numbers.
//! Probes run before the readiness gate opens; a calibration failure falls
//! back to conservative defaults and never aborts startup.
//!
//! Algorithm:
//!   1. Scan clean text at sizes {200, 500, 1000} chars, 5 iterations each
//!      (per-probe timeout 200 ms; expiry records the sentinel max value).
//!   2. p99 per size — with 5 samples the max is the conservative estimate.
//!   3. `sync_cap` = largest size whose p99 ≤ 30 ms; 0 if even 200 chars
//!      misses the target (advisory-only mode).
//!   4. `timeout` = p99 at sync_cap × 1.5, clamped to [25 ms, 60 ms].
//!   5. Tier: fast (p99@1000 ≤ 20 ms), standard (≤ 30 ms), slow
//!      (sync_cap = 500), minimal (sync_cap = 0).

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::constants::{
    CALIBRATION_ITERATIONS, CALIBRATION_PROBE_TIMEOUT, CALIBRATION_SIZES, CALIBRATION_TARGET_MS,
    CALIBRATION_TIMEOUT_MULTIPLIER, DEFAULT_NLP_SYNC_CAP, NLP_TIMEOUT_FALLBACK, NLP_TIMEOUT_MAX,
    NLP_TIMEOUT_MIN,
};
use crate::scanner::worker::EntityScanner;

// Clean prose with no PII — probes raw NLP cost without tripping detectors.
const CALIBRATION_TEXT_TEMPLATE: &str = "The quick brown fox jumps over the lazy dog. \
Alice went to the market to buy fresh vegetables and fruits. \
Bob called his colleague to discuss the quarterly report. \
The conference is scheduled for next Tuesday in the main meeting room. \
Please review the attached document and provide your feedback by Friday. \
Our team is working on improving the user experience for the next release. \
The weather forecast shows sunny skies for the entire week ahead. \
She completed the training course and received her certification last month. ";

/// Generate calibration text of exactly `size` characters.
pub fn make_calibration_text(size: usize) -> String {
    CALIBRATION_TEXT_TEMPLATE
        .chars()
        .cycle()
        .take(size)
        .collect()
}

/// Coarse hardware classification derived from measured latencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Fast,
    Standard,
    Slow,
    Minimal,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Standard => "standard",
            Tier::Slow => "slow",
            Tier::Minimal => "minimal",
        }
    }
}

/// Result of startup calibration. Created once, then immutable for the
/// process lifetime.
#[derive(Debug, Clone)]
pub struct CalibrationResult {
    /// Max input length (chars) routed to synchronous NLP. 0 = advisory-only.
    pub sync_cap: usize,
    /// Per-operation NLP timeout.
    pub timeout: Duration,
    pub tier: Tier,
    /// size → measured p99 (ms). Missing size = not measured.
    pub measurements: BTreeMap<usize, f64>,
    pub ok: bool,
    pub fallback_reason: Option<String>,
}

impl CalibrationResult {
    /// Conservative fallback used when calibration fails: a small sync cap
    /// and the maximum timeout are safe on any hardware — slow hosts just
    /// route more inputs to the advisory path.
    pub fn conservative_fallback(reason: impl Into<String>) -> Self {
        Self {
            sync_cap: DEFAULT_NLP_SYNC_CAP,
            timeout: NLP_TIMEOUT_FALLBACK,
            tier: Tier::Minimal,
            measurements: BTreeMap::new(),
            ok: false,
            fallback_reason: Some(reason.into()),
        }
    }
}

/// Derive thresholds from measurements. Pure — separated from the probing
/// I/O so it can be tested without a live worker.
pub fn derive_thresholds(measurements: &BTreeMap<usize, f64>) -> CalibrationResult {
    // Step 1: largest size whose p99 meets the target.
    let mut sync_cap = 0usize;
    for &size in CALIBRATION_SIZES.iter() {
        if let Some(&p99) = measurements.get(&size) {
            if p99 <= CALIBRATION_TARGET_MS {
                sync_cap = size;
            }
        }
    }

    // Step 2: timeout from the p99 at the effective cap (smallest measured
    // size when advisory-only), clamped to the configured bounds.
    let reference_p99 = if sync_cap > 0 {
        measurements.get(&sync_cap).copied()
    } else {
        CALIBRATION_SIZES
            .iter()
            .find_map(|size| measurements.get(size).copied())
    };
    let timeout = match reference_p99 {
        Some(p99_ms) => {
            let derived_us = (p99_ms * CALIBRATION_TIMEOUT_MULTIPLIER * 1000.0).round() as u64;
            Duration::from_micros(derived_us).clamp(NLP_TIMEOUT_MIN, NLP_TIMEOUT_MAX)
        }
        None => NLP_TIMEOUT_MAX,
    };

    // Step 3: tier from the 1000-char p99.
    let p99_1000 = measurements.get(&1000).copied();
    let tier = if sync_cap == 0 {
        Tier::Minimal
    } else {
        match p99_1000 {
            None => {
                if sync_cap < 1000 {
                    Tier::Slow
                } else {
                    Tier::Standard
                }
            }
            Some(p) if p <= 20.0 => Tier::Fast,
            Some(p) if p <= 30.0 => Tier::Standard,
            Some(_) => Tier::Slow,
        }
    };

    CalibrationResult {
        sync_cap,
        timeout,
        tier,
        measurements: measurements.clone(),
        ok: true,
        fallback_reason: None,
    }
}

/// Probe the live worker and derive thresholds for this hardware. Runs
/// before the readiness gate; any failure yields the conservative fallback.
pub async fn run_calibration(scanner: &dyn EntityScanner) -> CalibrationResult {
    let mut measurements: BTreeMap<usize, f64> = BTreeMap::new();

    tracing::info!(
        sizes = ?CALIBRATION_SIZES,
        iterations = CALIBRATION_ITERATIONS,
        target_ms = CALIBRATION_TARGET_MS,
        "NLP calibration starting"
    );

    for &size in CALIBRATION_SIZES.iter() {
        let text = make_calibration_text(size);
        let mut latencies_ms: Vec<f64> = Vec::with_capacity(CALIBRATION_ITERATIONS);

        for iteration in 0..CALIBRATION_ITERATIONS {
            let t0 = Instant::now();
            match tokio::time::timeout(CALIBRATION_PROBE_TIMEOUT, scanner.scan(&text)).await {
                Ok(Ok(_)) => {
                    latencies_ms.push(t0.elapsed().as_secs_f64() * 1000.0);
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        size,
                        iteration,
                        error = %e,
                        "calibration probe failed — using conservative fallback"
                    );
                    return CalibrationResult::conservative_fallback(format!(
                        "calibration probe failed: {e}"
                    ));
                }
                Err(_) => {
                    // Probe timeout: record the sentinel max so this size
                    // reads as over-target.
                    latencies_ms.push(CALIBRATION_PROBE_TIMEOUT.as_secs_f64() * 1000.0);
                    tracing::debug!(size, iteration, "calibration probe timed out");
                }
            }
        }

        measurements.insert(size, p99_of(&mut latencies_ms));
    }

    let result = derive_thresholds(&measurements);
    tracing::info!(
        tier = result.tier.as_str(),
        sync_cap = result.sync_cap,
        timeout_ms = result.timeout.as_millis() as u64,
        measurements = ?result.measurements,
        "NLP calibration complete"
    );
    result
}

/// p99 of a sample set; with fewer than 10 samples the max is the
/// conservative estimate (an optimistic outlier must not set the threshold).
fn p99_of(latencies_ms: &mut [f64]) -> f64 {
    latencies_ms.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if latencies_ms.is_empty() {
        return 0.0;
    }
    let idx = if latencies_ms.len() >= 10 {
        ((latencies_ms.len() as f64) * 0.99) as usize
    } else {
        latencies_ms.len() - 1
    };
    latencies_ms[idx.min(latencies_ms.len() - 1)]
}
