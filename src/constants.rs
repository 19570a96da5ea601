//! Shared size limits and numeric caps.
//!
//! Every size or timing constant used across modules lives here — no magic
//! numbers scattered through the scanner or proxy code.

use std::time::Duration;

// ── Request / response size limits ────────────────────────────

/// Maximum allowed request body size. Bodies over this limit receive
/// HTTP 413 before the scan gate or any upstream contact.
pub const MAX_REQUEST_BODY_BYTES: usize = 1_048_576; // 1 MB

/// Response buffer threshold. Upstream responses with a declared
/// Content-Length above this are routed to the streaming scan path
/// instead of being buffered in memory.
pub const MAX_RESPONSE_BUFFER_BYTES: usize = 524_288; // 512 KB

// ── Scanner size constants ────────────────────────────────────

/// Hard truncation cap applied to text before scanning. Inputs longer than
/// this are truncated (on a char boundary) before regex and NLP scans run.
pub const INPUT_HARD_CAP: usize = 8_192; // chars

/// Default NLP sync-vs-advisory threshold, used only when calibration fails.
pub const DEFAULT_NLP_SYNC_CAP: usize = 500; // chars

// ── Safe-scan gate ────────────────────────────────────────────

/// Global safety-net timeout for the entire scan pipeline.
/// Must be ≥ the calibrated per-operation NLP timeout ceiling.
pub const SCANNER_GLOBAL_TIMEOUT: Duration = Duration::from_millis(60);

// ── Calibration ───────────────────────────────────────────────

/// Input sizes probed during startup calibration, smallest first.
pub const CALIBRATION_SIZES: [usize; 3] = [200, 500, 1000];

/// Iterations per size during calibration (5 × 3 sizes = 15 probes total).
pub const CALIBRATION_ITERATIONS: usize = 5;

/// p99 latency target: sizes whose measured p99 stays at or under this
/// threshold are eligible for the synchronous NLP path.
pub const CALIBRATION_TARGET_MS: f64 = 30.0;

/// Multiplier applied to the measured p99 to derive the per-operation timeout.
pub const CALIBRATION_TIMEOUT_MULTIPLIER: f64 = 1.5;

/// Bounds for the derived per-operation NLP timeout.
pub const NLP_TIMEOUT_MIN: Duration = Duration::from_millis(25);
pub const NLP_TIMEOUT_MAX: Duration = Duration::from_millis(60);

/// Conservative fallback timeout when calibration fails.
pub const NLP_TIMEOUT_FALLBACK: Duration = Duration::from_millis(60);

/// Per-probe timeout during calibration. Generous (5× target) so slow
/// hardware can still be measured; expiry records a sentinel max value.
pub const CALIBRATION_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

// ── Streaming scanner ─────────────────────────────────────────

/// Window size for SSE content scanning. Smaller windows abort faster,
/// larger windows amortise the regex call — measure both before changing.
pub const STREAM_WINDOW_CHARS: usize = 512;
