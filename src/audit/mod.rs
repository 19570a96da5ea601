//! Audit event model and backend interface.
//!
//! Every BLOCK and ALLOW_SUPPRESSED decision emits an audit event; clean
//! ALLOW request events are not recorded. Emission is fire-and-forget: the
//! write runs in a detached task and a failing audit backend never affects
//! the request's response path.

pub mod jsonl;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::scan::{Action, ScanResult};

/// Whether the scanned content was the inbound request or the upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Request,
    Response,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub scan_id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub action: Action,
    pub direction: Direction,
    pub rule_id: Option<String>,
    pub risk_level: Option<String>,
    pub redacted_excerpt: Option<String>,
    pub allowlist_rule_id: Option<String>,
    pub test: bool,
    /// Streaming only: byte-approximated token count forwarded before abort.
    pub tokens_delivered: Option<u64>,
    /// Entity types reported by an advisory NLP scan, when one ran.
    pub advisory_entities: Option<Vec<String>>,
}

impl AuditEvent {
    /// Build an event from a scan result. `tokens_delivered` applies to
    /// streaming aborts only.
    pub fn from_scan(
        result: &ScanResult,
        user_id: &str,
        direction: Direction,
        tokens_delivered: Option<u64>,
    ) -> Self {
        Self {
            scan_id: result.scan_id.clone(),
            timestamp: Utc::now(),
            user_id: user_id.to_string(),
            action: result.action,
            direction,
            rule_id: result.rule_id.clone(),
            risk_level: result.risk_level.map(|r| r.as_str().to_string()),
            redacted_excerpt: result.redacted_excerpt.clone(),
            allowlist_rule_id: result.allowlist_rule_id.clone(),
            test: result.test,
            tokens_delivered,
            advisory_entities: None,
        }
    }
}

/// Filter for querying stored audit events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub action: Option<Action>,
    pub rule_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl EventFilter {
    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(action) = self.action {
            if event.action != action {
                return false;
            }
        }
        if let Some(ref rule_id) = self.rule_id {
            if event.rule_id.as_deref() != Some(rule_id.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        true
    }
}

/// Storage interface for audit events.
#[async_trait]
pub trait AuditBackend: Send + Sync {
    async fn log_event(&self, event: AuditEvent) -> anyhow::Result<()>;
    async fn query_events(&self, filter: EventFilter) -> anyhow::Result<Vec<AuditEvent>>;
    async fn count_events(&self, filter: EventFilter) -> anyhow::Result<u64>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// Fire-and-forget emission. Spawns a detached task; a backend failure is
/// logged and otherwise ignored.
pub fn emit(backend: Option<&Arc<dyn AuditBackend>>, event: AuditEvent) {
    let Some(backend) = backend else {
        return;
    };
    let backend = backend.clone();
    tokio::spawn(async move {
        if let Err(e) = backend.log_event(event).await {
            tracing::error!(error = %e, "audit write failed (non-fatal)");
        }
    });
}

/// Emit an event for a request-direction scan result. ALLOW events generate
/// no audit trail entry; BLOCK and ALLOW_SUPPRESSED always do.
pub fn emit_request_event(
    backend: Option<&Arc<dyn AuditBackend>>,
    result: &ScanResult,
    user_id: &str,
) {
    if result.action == Action::Allow {
        return;
    }
    emit(
        backend,
        AuditEvent::from_scan(result, user_id, Direction::Request, None),
    );
}
