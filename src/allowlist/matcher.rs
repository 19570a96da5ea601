//! Allowlist matching for scan results.
//!
//! `apply_allowlist()` checks a BLOCK result against the loaded entries.
//! First matching entry wins and rewrites the result to ALLOW_SUPPRESSED,
//! preserving every original field. It never fails: any internal error
//! returns the original BLOCK unchanged — the conservative direction.

use regex::Regex;

use crate::allowlist::loader::AllowlistEntry;
use crate::models::scan::{is_system_rule, Action, ScanResult};

/// Check a scan result against allowlist entries.
///
/// Matching criteria, per entry in declaration order:
///   1. `entry.rule_id` equals the result's rule id.
///   2. When `entry.pattern` is set, the pattern must also match the
///      request content; a regex failure logs and skips the entry
///      (keeping the block).
///
/// Results that are not BLOCKs, and system rule ids, pass through
/// unchanged regardless of entries.
pub fn apply_allowlist(
    scan_result: ScanResult,
    content: &str,
    entries: &[AllowlistEntry],
) -> ScanResult {
    if scan_result.action != Action::Block || entries.is_empty() {
        return scan_result;
    }

    let Some(rule_id) = scan_result.rule_id.clone() else {
        // A BLOCK without a rule id is malformed; do not suppress it.
        return scan_result;
    };

    // Scanner faults are never suppressible, even if an operator lists one.
    if is_system_rule(&rule_id) {
        return scan_result;
    }

    for entry in entries {
        if entry.rule_id != rule_id {
            continue;
        }

        if let Some(pattern) = &entry.pattern {
            match Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(content) {
                        continue;
                    }
                }
                Err(e) => {
                    // Validated at load time, so this is unexpected; treat
                    // as no-match and keep blocking.
                    tracing::error!(
                        rule_id = %entry.rule_id,
                        pattern = %pattern,
                        error = %e,
                        "allowlist pattern failed at match time — keeping BLOCK"
                    );
                    continue;
                }
            }
        }

        tracing::info!(
            rule_id = %rule_id,
            allowlist_rule_id = %entry.rule_id,
            note = entry.note.as_deref().unwrap_or(""),
            has_pattern = entry.pattern.is_some(),
            "allowlist suppressed block"
        );
        return scan_result.suppressed(entry.rule_id.clone());
    }

    scan_result
}
