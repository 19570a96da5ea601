//! Scan pipeline result types.
//!
//! `ScanResult` is the universal return value of the scan pipeline. Its
//! invariants are load-bearing for the whole proxy:
//!
//! - `action == Block` ⇒ `rule_id` is set.
//! - `action == AllowSuppressed` ⇒ both `rule_id` and `allowlist_rule_id` are set.
//! - `redacted_excerpt` never contains the raw matched credential.
//! - System rule ids (`SCANNER_*`, `QUOTA_EXCEEDED`) never carry a
//!   `suppression_hint` — scanner faults are not operator-suppressible.

use serde::{Deserialize, Serialize};

/// Rule ids reserved for scanner faults. These are never suppressible: the
/// allowlist matcher refuses to match them even if an operator lists one.
pub const SYSTEM_RULE_IDS: [&str; 4] = [
    "SCANNER_ERROR",
    "SCANNER_TIMEOUT",
    "QUOTA_EXCEEDED",
    "SCANNER_UNAVAILABLE",
];

/// True when `rule_id` names a scanner fault rather than a policy rule.
pub fn is_system_rule(rule_id: &str) -> bool {
    SYSTEM_RULE_IDS.contains(&rule_id)
}

/// Scan decision for a request or response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Allow,
    Block,
    AllowSuppressed,
}

/// Severity attached to a matched rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Critical,
    High,
    Medium,
    Low,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Critical => "CRITICAL",
            RiskLevel::High => "HIGH",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::Low => "LOW",
        }
    }
}

/// The universal scan-pipeline return value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub action: Action,
    /// ULID bound at proxy entry; propagated into logs, audit, headers.
    pub scan_id: String,
    /// Matched rule (policy rule, `PRESIDIO_<TYPE>` entity rule, or system rule).
    pub rule_id: Option<String>,
    pub risk_level: Option<RiskLevel>,
    /// ≤ 100 chars; the matched span is replaced with a masking placeholder.
    pub redacted_excerpt: Option<String>,
    /// Parseable allowlist snippet naming `rule_id`. Always `None` for
    /// system rule ids.
    pub suppression_hint: Option<String>,
    /// True when the match was the pre-registered well-known test credential.
    pub test: bool,
    /// Set only on `AllowSuppressed`: the allowlist entry that matched.
    pub allowlist_rule_id: Option<String>,
}

impl ScanResult {
    /// Clean ALLOW result.
    pub fn allow(scan_id: impl Into<String>) -> Self {
        Self {
            action: Action::Allow,
            scan_id: scan_id.into(),
            rule_id: None,
            risk_level: None,
            redacted_excerpt: None,
            suppression_hint: None,
            test: false,
            allowlist_rule_id: None,
        }
    }

    /// BLOCK result for a scanner fault (`SCANNER_ERROR` / `SCANNER_TIMEOUT`).
    /// Carries no excerpt and no suppression hint.
    pub fn system_block(scan_id: impl Into<String>, rule_id: &str) -> Self {
        Self {
            action: Action::Block,
            scan_id: scan_id.into(),
            rule_id: Some(rule_id.to_string()),
            risk_level: Some(RiskLevel::Critical),
            redacted_excerpt: None,
            suppression_hint: None,
            test: false,
            allowlist_rule_id: None,
        }
    }

    /// Rewrite a BLOCK into ALLOW_SUPPRESSED, preserving every original
    /// field and recording the allowlist entry that matched.
    pub fn suppressed(mut self, allowlist_rule_id: impl Into<String>) -> Self {
        self.action = Action::AllowSuppressed;
        self.allowlist_rule_id = Some(allowlist_rule_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_has_no_rule_fields() {
        let r = ScanResult::allow("01ARZ3NDEKTSV4RRFFQ69G5FAV");
        assert_eq!(r.action, Action::Allow);
        assert!(r.rule_id.is_none());
        assert!(r.risk_level.is_none());
        assert!(!r.test);
    }

    #[test]
    fn test_system_block_is_critical_with_no_hint() {
        let r = ScanResult::system_block("01ARZ3NDEKTSV4RRFFQ69G5FAV", "SCANNER_TIMEOUT");
        assert_eq!(r.action, Action::Block);
        assert_eq!(r.rule_id.as_deref(), Some("SCANNER_TIMEOUT"));
        assert_eq!(r.risk_level, Some(RiskLevel::Critical));
        assert!(r.suppression_hint.is_none());
    }

    #[test]
    fn test_suppressed_preserves_original_fields() {
        let mut r = ScanResult::allow("01ARZ3NDEKTSV4RRFFQ69G5FAV");
        r.action = Action::Block;
        r.rule_id = Some("CREDENTIAL_DETECTED".into());
        r.risk_level = Some(RiskLevel::Critical);
        r.redacted_excerpt = Some("ctx [REDACTED] ctx".into());

        let s = r.suppressed("CREDENTIAL_DETECTED");
        assert_eq!(s.action, Action::AllowSuppressed);
        assert_eq!(s.rule_id.as_deref(), Some("CREDENTIAL_DETECTED"));
        assert_eq!(s.allowlist_rule_id.as_deref(), Some("CREDENTIAL_DETECTED"));
        assert_eq!(s.redacted_excerpt.as_deref(), Some("ctx [REDACTED] ctx"));
    }

    #[test]
    fn test_system_rule_set() {
        assert!(is_system_rule("SCANNER_ERROR"));
        assert!(is_system_rule("SCANNER_TIMEOUT"));
        assert!(is_system_rule("QUOTA_EXCEEDED"));
        assert!(is_system_rule("SCANNER_UNAVAILABLE"));
        assert!(!is_system_rule("CREDENTIAL_DETECTED"));
        assert!(!is_system_rule("PRESIDIO_US_SSN"));
    }

    #[test]
    fn test_action_serializes_screaming_snake() {
        assert_eq!(serde_json::to_string(&Action::Allow).unwrap(), "\"ALLOW\"");
        assert_eq!(
            serde_json::to_string(&Action::AllowSuppressed).unwrap(),
            "\"ALLOW_SUPPRESSED\""
        );
        assert_eq!(
            serde_json::to_string(&RiskLevel::Critical).unwrap(),
            "\"CRITICAL\""
        );
    }
}
