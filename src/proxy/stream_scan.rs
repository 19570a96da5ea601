//! Streaming response scan path.
//!
//! SSE bytes from the upstream are parsed into complete messages. Messages
//! without text content (role deltas, stops, `[DONE]`) forward immediately;
//! content messages are held while the active 512-char window is scanned
//! and released only once the window passes — a blocked window is never
//! forwarded. Up to one window (~128 tokens) can reach the agent before an
//! abort is possible; that bound is the documented trade-off of the
//! window model.
//!
//! One advisory NLP task is spawned after the first complete window over
//! the full accumulated buffer. If it reports entities while the stream is
//! open, an abort flag trips and the forwarding loop emits the abort
//! sequence between chunks. The task is cancelled on every stream exit.
//!
//! Bytes forwarded to the agent, discounting any abort suffix, are a
//! byte-identical prefix of the upstream response.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::audit::{AuditBackend, AuditEvent, Direction};
use crate::health::{StreamGuard, StreamingMetrics};
use crate::models::scan::{Action, RiskLevel, ScanResult};
use crate::scanner::streaming::{abort_sequence, StreamingScanner};
use crate::scanner::worker::EntityScanner;

/// Advisory budget is generous — it never gates the response.
const ADVISORY_STREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the streaming task needs from app state.
pub struct StreamScanContext {
    pub scan_id: String,
    pub user_id: String,
    pub worker: Option<Arc<dyn EntityScanner>>,
    pub audit: Option<Arc<dyn AuditBackend>>,
    pub metrics: Arc<StreamingMetrics>,
}

/// Wrap an upstream SSE response in the scanning forwarder. The returned
/// body yields scanned bytes; the work runs in a detached task bridged
/// through a channel.
pub fn stream_scan_body(upstream: reqwest::Response, ctx: StreamScanContext) -> Body {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    tokio::spawn(run_stream_scan(upstream, ctx, tx));
    Body::from_stream(ReceiverStream::new(rx))
}

/// Cancels the advisory task on drop so no exit path leaks it.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_stream_scan(
    upstream: reqwest::Response,
    ctx: StreamScanContext,
    tx: tokio::sync::mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    // Gauge increments here and decrements on every exit path via Drop.
    let _guard = StreamGuard::open(ctx.metrics.clone());

    let mut scanner = StreamingScanner::new(&ctx.scan_id, Some(ctx.metrics.clone()));
    let abort_flag = Arc::new(AtomicBool::new(false));
    let advisory_entities: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let mut advisory_task: Option<AbortOnDrop> = None;

    let mut sse_buffer = String::new();
    // Messages awaiting their window's verdict, in arrival order.
    let mut held: Vec<Bytes> = Vec::new();
    let mut byte_stream = upstream.bytes_stream();

    tracing::info!(scan_id = %ctx.scan_id, "stream scan started");

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                // Mid-stream upstream failure: the prefix already forwarded
                // stands; surface the break to the agent.
                tracing::warn!(scan_id = %ctx.scan_id, error = %e, "upstream stream failed mid-flight");
                let _ = tx
                    .send(Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        e.to_string(),
                    )))
                    .await;
                return;
            }
        };

        // Advisory verdicts are applied between chunks.
        if abort_flag.load(Ordering::Acquire) && !scanner.aborted {
            scanner.aborted = true;
            let entities = advisory_entities.lock().map(|e| e.clone()).unwrap_or_default();
            let result = ScanResult {
                action: Action::Block,
                scan_id: ctx.scan_id.clone(),
                rule_id: Some("PRESIDIO_STREAM_ADVISORY".to_string()),
                risk_level: Some(RiskLevel::High),
                redacted_excerpt: None,
                suppression_hint: None,
                test: false,
                allowlist_rule_id: None,
            };
            emit_stream_audit(&ctx, &result, scanner.tokens_delivered, Some(entities));
            send_abort(&tx, &result, scanner.tokens_delivered).await;
            return;
        }

        sse_buffer.push_str(&String::from_utf8_lossy(&chunk));

        // Process complete SSE messages. Content messages are held until
        // their window completes a successful scan; metadata messages pass
        // straight through only when nothing is held ahead of them, so the
        // forwarded bytes stay an exact prefix of the upstream bytes.
        let mut blocked: Option<ScanResult> = None;

        while let Some(split) = sse_buffer.find("\n\n") {
            let message: String = sse_buffer.drain(..split + 2).collect();
            let content = extract_content_from_sse_message(message.trim_end_matches("\n\n"));

            if content.is_empty() {
                if held.is_empty() {
                    if tx.send(Ok(Bytes::from(message))).await.is_err() {
                        tracing::debug!(scan_id = %ctx.scan_id, "agent disconnected during stream");
                        return;
                    }
                } else {
                    held.push(Bytes::from(message));
                }
                continue;
            }

            let window_result = scanner.add_content(&content);
            held.push(Bytes::from(message));

            match window_result {
                Some(result) if result.action == Action::Block => {
                    blocked = Some(result);
                    break;
                }
                Some(_) => {
                    // Window passed — release everything held, in order.
                    for bytes in held.drain(..) {
                        if tx.send(Ok(bytes)).await.is_err() {
                            tracing::debug!(scan_id = %ctx.scan_id, "agent disconnected during stream");
                            return;
                        }
                    }
                }
                None => {}
            }

            // One advisory task per stream, after the first full window.
            if scanner.window_count == 1
                && advisory_task.is_none()
                && !scanner.full_buffer.is_empty()
            {
                if let Some(worker) = ctx.worker.clone() {
                    advisory_task = Some(AbortOnDrop(spawn_advisory(
                        scanner.full_buffer.clone(),
                        worker,
                        ctx.scan_id.clone(),
                        abort_flag.clone(),
                        advisory_entities.clone(),
                    )));
                }
            }
        }

        if let Some(result) = blocked {
            // The offending window — and anything held behind it — is
            // never forwarded.
            held.clear();
            emit_stream_audit(&ctx, &result, scanner.tokens_delivered, None);
            send_abort(&tx, &result, scanner.tokens_delivered).await;
            return;
        }
    }

    // Upstream closed. Scan the trailing partial message plus any
    // unfinished window before releasing the remainder.
    if !sse_buffer.is_empty() {
        let content = extract_content_from_sse_message(&sse_buffer);
        if !content.is_empty() {
            scanner.add_content(&content);
        }
    }
    if let Some(result) = scanner.flush() {
        if result.action == Action::Block {
            held.clear();
            emit_stream_audit(&ctx, &result, scanner.tokens_delivered, None);
            send_abort(&tx, &result, scanner.tokens_delivered).await;
            return;
        }
    }
    for bytes in held.drain(..) {
        if tx.send(Ok(bytes)).await.is_err() {
            return;
        }
    }
    if !sse_buffer.is_empty() {
        let _ = tx.send(Ok(Bytes::from(sse_buffer))).await;
    }

    // Clean completion.
    let entities = advisory_entities.lock().map(|e| e.clone()).unwrap_or_default();
    let allow = ScanResult::allow(ctx.scan_id.clone());
    emit_stream_audit(
        &ctx,
        &allow,
        scanner.tokens_delivered,
        if entities.is_empty() { None } else { Some(entities) },
    );
    tracing::info!(
        scan_id = %ctx.scan_id,
        windows_scanned = scanner.window_count,
        tokens_delivered = scanner.tokens_delivered,
        "stream scan complete"
    );
}

async fn send_abort(
    tx: &tokio::sync::mpsc::Sender<Result<Bytes, std::io::Error>>,
    result: &ScanResult,
    tokens_delivered: u64,
) {
    for bytes in abort_sequence(result, tokens_delivered) {
        if tx.send(Ok(bytes)).await.is_err() {
            return;
        }
    }
}

fn emit_stream_audit(
    ctx: &StreamScanContext,
    result: &ScanResult,
    tokens_delivered: u64,
    advisory_entities: Option<Vec<String>>,
) {
    // Streaming completion events are recorded for ALLOW too — the
    // tokens_delivered figure is the observability payload.
    let mut event = AuditEvent::from_scan(
        result,
        &ctx.user_id,
        Direction::Response,
        Some(tokens_delivered),
    );
    event.advisory_entities = advisory_entities;
    crate::audit::emit(ctx.audit.as_ref(), event);
}

fn spawn_advisory(
    buffer: String,
    scanner: Arc<dyn EntityScanner>,
    scan_id: String,
    abort_flag: Arc<AtomicBool>,
    entities_slot: Arc<Mutex<Vec<String>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::time::timeout(ADVISORY_STREAM_TIMEOUT, scanner.scan(&buffer)).await {
            Ok(Ok(entities)) if !entities.is_empty() => {
                let types: Vec<String> =
                    entities.iter().map(|e| e.entity_type.clone()).collect();
                tracing::info!(%scan_id, entities = ?types, "advisory NLP detected PII in stream");
                if let Ok(mut slot) = entities_slot.lock() {
                    *slot = types;
                }
                abort_flag.store(true, Ordering::Release);
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::debug!(%scan_id, error = %e, "advisory stream scan error");
            }
            Err(_) => {
                tracing::debug!(%scan_id, "advisory stream scan timed out");
            }
        }
    })
}

/// Extract text content from one SSE message block. Supports both wire
/// formats:
///
/// - OpenAI: `data: {"choices":[{"delta":{"content":"…"}}]}`
/// - Anthropic: `data: {"type":"content_block_delta","delta":{"type":"text_delta","text":"…"}}`
///
/// Role deltas, stops, `[DONE]` and unparseable payloads yield `""`.
pub fn extract_content_from_sse_message(message: &str) -> String {
    let mut data_line: Option<&str> = None;
    for line in message.split('\n') {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("data:") {
            data_line = Some(rest.trim());
            break;
        }
    }

    let Some(data) = data_line else {
        return String::new();
    };
    if data.is_empty() || data == "[DONE]" {
        return String::new();
    }

    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) else {
        return String::new();
    };

    // OpenAI: choices[0].delta.content
    if let Some(choices) = parsed.get("choices").and_then(|c| c.as_array()) {
        if let Some(content) = choices
            .first()
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
        {
            return content.to_string();
        }
        return String::new();
    }

    // Anthropic: content_block_delta with a text_delta
    if parsed.get("type").and_then(|t| t.as_str()) == Some("content_block_delta") {
        if let Some(delta) = parsed.get("delta") {
            if delta.get("type").and_then(|t| t.as_str()) == Some("text_delta") {
                if let Some(text) = delta.get("text").and_then(|t| t.as_str()) {
                    return text.to_string();
                }
            }
        }
    }

    String::new()
}
