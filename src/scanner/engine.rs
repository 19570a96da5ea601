//! Internal scan pipeline.
//!
//! `scan_request()` is called only from the safe-scan gate (`safe_scan`) —
//! never directly from proxy code. Pipeline, in strict order:
//!
//!   1. Hard input cap (truncate beyond 8192 chars).
//!   2. Regex fast path — always runs, synchronous, sub-millisecond.
//!   3. NLP routing by the calibrated sync cap: short inputs scan
//!      synchronously under the per-operation timeout; longer inputs (or a
//!      zero cap) spawn an advisory background task that never gates the
//!      request.
//!   4. ALLOW.
//!
//! Thresholds are written exactly once at startup via `update_calibration`
//! (before the readiness gate opens) and read without locking afterwards —
//! the write-once/read-many discipline is enforced by lifecycle ordering.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::constants::{DEFAULT_NLP_SYNC_CAP, NLP_TIMEOUT_FALLBACK};
use crate::models::scan::{Action, RiskLevel, ScanResult};
use crate::scanner::regex_engine::{
    apply_input_cap, make_redacted_excerpt, make_suppression_hint, regex_scan,
};
use crate::scanner::worker::{EntityRecord, EntityScanner, WorkerError};

/// Advisory scans get 3× the sync budget — they run in the background and
/// only enrich the audit trail.
const ADVISORY_TIMEOUT_MULTIPLIER: u32 = 3;

/// Failures the safe-scan gate maps to system rule ids.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The synchronous NLP scan exceeded the calibrated per-operation
    /// timeout — maps to `SCANNER_TIMEOUT` (a policy block, not a 500).
    #[error("NLP scan exceeded the calibrated timeout")]
    Timeout,

    /// Worker failure (uninitialized, I/O, protocol) — maps to `SCANNER_ERROR`.
    #[error("NLP worker failure: {0}")]
    Worker(#[from] WorkerError),
}

/// Calibrated routing thresholds. Written once at startup, then read-only.
#[derive(Debug)]
pub struct EngineThresholds {
    sync_cap: AtomicUsize,
    timeout_us: AtomicU64,
}

impl Default for EngineThresholds {
    fn default() -> Self {
        Self::conservative()
    }
}

impl EngineThresholds {
    /// Conservative pre-calibration defaults.
    pub fn conservative() -> Self {
        Self {
            sync_cap: AtomicUsize::new(DEFAULT_NLP_SYNC_CAP),
            timeout_us: AtomicU64::new(NLP_TIMEOUT_FALLBACK.as_micros() as u64),
        }
    }

    /// Install calibration results. Must run before the proxy accepts
    /// traffic — never during request handling.
    pub fn update_calibration(&self, sync_cap: usize, timeout: Duration) {
        self.sync_cap.store(sync_cap, Ordering::Release);
        self.timeout_us
            .store(timeout.as_micros() as u64, Ordering::Release);
        tracing::info!(
            sync_cap,
            timeout_ms = timeout.as_millis() as u64,
            "engine thresholds updated from calibration"
        );
    }

    pub fn sync_cap(&self) -> usize {
        self.sync_cap.load(Ordering::Acquire)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_micros(self.timeout_us.load(Ordering::Acquire))
    }
}

/// Run the scan pipeline. Returns `Err` only for NLP-path faults, which the
/// safe-scan gate maps to `SCANNER_TIMEOUT` / `SCANNER_ERROR` blocks.
pub async fn scan_request(
    text: &str,
    scanner: Option<Arc<dyn EntityScanner>>,
    thresholds: &EngineThresholds,
    scan_id: &str,
) -> Result<ScanResult, ScanError> {
    // Step 1: hard input cap — precedes all scanning logic.
    let mut truncated = false;
    let capped = apply_input_cap(text, &mut truncated);
    if truncated {
        tracing::warn!(scan_id, original_chars = text.chars().count(), "input truncated to hard cap");
    }

    // Step 2: regex fast path. Runs at full speed on every calibration tier.
    let regex_result = regex_scan(&capped);
    if regex_result.is_block {
        let redacted = regex_result
            .match_span
            .and_then(|span| make_redacted_excerpt(&capped, span));
        let rule_id = regex_result.rule_id.unwrap_or("SCANNER_ERROR");
        let hint = make_suppression_hint(rule_id, regex_result.matched_slug.unwrap_or("unknown"));
        return Ok(ScanResult {
            action: Action::Block,
            scan_id: scan_id.to_string(),
            rule_id: Some(rule_id.to_string()),
            risk_level: regex_result.risk_level,
            redacted_excerpt: redacted,
            suppression_hint: hint,
            test: regex_result.test,
            allowlist_rule_id: None,
        });
    }

    // Step 3: NLP routing by calibrated sync cap.
    if let Some(scanner) = scanner {
        let sync_cap = thresholds.sync_cap();
        let char_count = capped.chars().count();
        if sync_cap > 0 && char_count > 0 && char_count <= sync_cap {
            return nlp_sync_scan(&capped, scanner.as_ref(), thresholds.timeout(), scan_id).await;
        } else if char_count > 0 {
            spawn_advisory_scan(capped, scanner, thresholds.timeout(), scan_id.to_string());
        }
    }

    // Step 4: ALLOW.
    Ok(ScanResult::allow(scan_id))
}

/// Synchronous NLP gate. Timeout expiry propagates as `ScanError::Timeout`
/// to the safe-scan gate (→ `SCANNER_TIMEOUT` block).
async fn nlp_sync_scan(
    text: &str,
    scanner: &dyn EntityScanner,
    timeout: Duration,
    scan_id: &str,
) -> Result<ScanResult, ScanError> {
    let entities = tokio::time::timeout(timeout, scanner.scan(text))
        .await
        .map_err(|_| ScanError::Timeout)??;

    if entities.is_empty() {
        return Ok(ScanResult::allow(scan_id));
    }
    Ok(make_entity_block_result(&entities, text, scan_id))
}

/// Advisory background scan for long inputs (or the minimal tier). The
/// result enriches the audit trail; it never gates the request.
fn spawn_advisory_scan(
    text: String,
    scanner: Arc<dyn EntityScanner>,
    sync_timeout: Duration,
    scan_id: String,
) {
    let advisory_timeout = sync_timeout * ADVISORY_TIMEOUT_MULTIPLIER;
    tokio::spawn(async move {
        match tokio::time::timeout(advisory_timeout, scanner.scan(&text)).await {
            Ok(Ok(entities)) if !entities.is_empty() => {
                let types: Vec<&str> = entities.iter().map(|e| e.entity_type.as_str()).collect();
                tracing::info!(
                    %scan_id,
                    entities = ?types,
                    "advisory NLP scan detected PII in long input"
                );
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::debug!(%scan_id, error = %e, "advisory NLP scan error");
            }
            Err(_) => {
                tracing::debug!(%scan_id, "advisory NLP scan timed out");
            }
        }
    });
}

/// Convert detected entities into a BLOCK result. The highest-confidence
/// entity is the primary detection; its span drives the redacted excerpt.
pub(crate) fn make_entity_block_result(
    entities: &[EntityRecord],
    text: &str,
    scan_id: &str,
) -> ScanResult {
    let Some(primary) = entities.iter().max_by(|a, b| {
        a.score
            .partial_cmp(&b.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    }) else {
        return ScanResult::allow(scan_id);
    };
    let rule_id = format!("PRESIDIO_{}", primary.entity_type);

    let redacted = entity_excerpt(text, primary.start, primary.end);
    let suppression_hint =
        make_suppression_hint(&rule_id, &primary.entity_type.to_lowercase());

    ScanResult {
        action: Action::Block,
        scan_id: scan_id.to_string(),
        rule_id: Some(rule_id),
        risk_level: Some(RiskLevel::High),
        redacted_excerpt: redacted,
        suppression_hint,
        test: false,
        allowlist_rule_id: None,
    }
}

/// Excerpt around an entity span. Entity offsets are char positions (they
/// cross the worker boundary as analyzer offsets, not byte indexes).
fn entity_excerpt(text: &str, start: usize, end: usize) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    if start > end || end > chars.len() {
        return None;
    }
    let context = 20;
    let excerpt_start = start.saturating_sub(context);
    let excerpt_end = (end + context).min(chars.len());

    let before: String = chars[excerpt_start..start].iter().collect();
    let after: String = chars[end..excerpt_end].iter().collect();
    let excerpt = format!("{before}[REDACTED]{after}");
    Some(excerpt.chars().take(100).collect())
}
