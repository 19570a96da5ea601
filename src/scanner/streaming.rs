//! Streaming window scanner and SSE abort sequence.
//!
//! SSE content is accumulated into 512-char windows; each full window is
//! scanned with the regex engine only (NLP runs advisorily over the full
//! buffer, off this path). Per-window scan latency is recorded into the
//! streaming metrics tracker.
//!
//! On a BLOCK the stream emits the abort sequence — two in-memory byte
//! chunks, total emission well under a millisecond:
//!
//!   1. `data: [DONE]\n\n` — terminates the stream for vanilla SSE clients.
//!   2. `event: ongarde_block\ndata: {json}\n\n` — block details for
//!      OnGarde-aware clients. Unknown event types are silently discarded
//!      per SSE semantics, so plain clients are unaffected.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::time::Instant;

use crate::constants::STREAM_WINDOW_CHARS;
use crate::health::StreamingMetrics;
use crate::models::scan::{Action, RiskLevel, ScanResult};
use crate::scanner::regex_engine::{make_redacted_excerpt, make_suppression_hint, regex_scan};

/// Window-buffered scanner state for one SSE stream.
pub struct StreamingScanner {
    scan_id: String,
    window: String,
    /// Entire extracted content, fed to the advisory NLP scan.
    pub full_buffer: String,
    /// Completed window scans.
    pub window_count: usize,
    /// Byte-approximated token count of forwarded content (±20%).
    pub tokens_delivered: u64,
    pub aborted: bool,
    metrics: Option<Arc<StreamingMetrics>>,
}

impl StreamingScanner {
    pub fn new(scan_id: impl Into<String>, metrics: Option<Arc<StreamingMetrics>>) -> Self {
        Self {
            scan_id: scan_id.into(),
            window: String::new(),
            full_buffer: String::new(),
            window_count: 0,
            tokens_delivered: 0,
            aborted: false,
            metrics,
        }
    }

    /// Feed extracted SSE text content. Returns a scan result when the
    /// accumulated window reached its size and was scanned: the window
    /// either passed (ALLOW — held messages may be released) or blocked.
    /// Returns `None` while the window is still filling.
    pub fn add_content(&mut self, content: &str) -> Option<ScanResult> {
        if content.is_empty() {
            return None;
        }
        self.window.push_str(content);
        self.full_buffer.push_str(content);
        // ~4 bytes per token: the documented byte-approximation.
        self.tokens_delivered += (content.len() / 4) as u64;

        if self.window.chars().count() >= STREAM_WINDOW_CHARS {
            Some(self.scan_window())
        } else {
            None
        }
    }

    /// Scan whatever remains in the window at stream end.
    pub fn flush(&mut self) -> Option<ScanResult> {
        if self.window.is_empty() {
            return None;
        }
        Some(self.scan_window())
    }

    fn scan_window(&mut self) -> ScanResult {
        let t0 = Instant::now();
        let result = regex_scan(&self.window);
        if let Some(metrics) = &self.metrics {
            metrics.record_window_scan(t0.elapsed().as_secs_f64() * 1000.0);
        }
        self.window_count += 1;

        if result.is_block {
            self.aborted = true;
            // The blocked window is never forwarded — take it back out of
            // the delivered estimate.
            self.tokens_delivered = self
                .tokens_delivered
                .saturating_sub((self.window.len() / 4) as u64);

            let redacted = result
                .match_span
                .and_then(|span| make_redacted_excerpt(&self.window, span));
            let rule_id = result.rule_id.unwrap_or("SCANNER_ERROR");
            let hint = make_suppression_hint(rule_id, result.matched_slug.unwrap_or("unknown"));
            let blocked = ScanResult {
                action: Action::Block,
                scan_id: self.scan_id.clone(),
                rule_id: Some(rule_id.to_string()),
                risk_level: result.risk_level,
                redacted_excerpt: redacted,
                suppression_hint: hint,
                test: result.test,
                allowlist_rule_id: None,
            };
            self.window.clear();
            return blocked;
        }

        self.window.clear();
        ScanResult::allow(self.scan_id.clone())
    }
}

// ── Abort sequence ────────────────────────────────────────────

/// JSON payload of the `ongarde_block` SSE event.
#[derive(Debug, Serialize)]
pub struct StreamAbortPayload {
    pub scan_id: String,
    pub rule_id: String,
    /// Never null — defaults to CRITICAL when the result carries no level.
    pub risk_level: String,
    pub tokens_delivered: u64,
    /// ISO-8601 UTC.
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redacted_excerpt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppression_hint: Option<String>,
}

impl StreamAbortPayload {
    pub fn from_result(scan_result: &ScanResult, tokens_delivered: u64) -> Self {
        Self {
            scan_id: scan_result.scan_id.clone(),
            rule_id: scan_result
                .rule_id
                .clone()
                .unwrap_or_else(|| "SCANNER_ERROR".to_string()),
            risk_level: scan_result
                .risk_level
                .unwrap_or(RiskLevel::Critical)
                .as_str()
                .to_string(),
            tokens_delivered,
            timestamp: chrono::Utc::now().to_rfc3339(),
            redacted_excerpt: scan_result.redacted_excerpt.clone(),
            suppression_hint: scan_result.suppression_hint.clone(),
        }
    }
}

/// Build the two-chunk abort sequence. Pure in-memory byte construction.
pub fn abort_sequence(scan_result: &ScanResult, tokens_delivered: u64) -> [Bytes; 2] {
    let payload = StreamAbortPayload::from_result(scan_result, tokens_delivered);
    let json = serde_json::to_string(&payload).unwrap_or_else(|_| {
        // Payload is plain strings and numbers; serialization cannot
        // realistically fail, but the abort must still close the stream.
        format!("{{\"scan_id\":\"{}\"}}", payload.scan_id)
    });

    tracing::info!(
        scan_id = %payload.scan_id,
        rule_id = %payload.rule_id,
        risk_level = %payload.risk_level,
        tokens_delivered,
        "stream aborted"
    );

    [
        Bytes::from_static(b"data: [DONE]\n\n"),
        Bytes::from(format!("event: ongarde_block\ndata: {json}\n\n")),
    ]
}
