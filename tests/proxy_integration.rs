//! End-to-end proxy tests against mock upstreams.
//!
//! These drive the real router (scan gate, header discipline, response
//! routing) with wiremock standing in for the LLM providers. The failure
//! mode separation is the core property under test: policy blocks are 400
//! with `X-OnGarde-Block: true`, connectivity failures are 502 without it,
//! and the two never mix.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ongarde::allowlist::loader::{AllowlistEntry, AllowlistLoader};
use ongarde::config::Config;
use ongarde::proxy::upstream::UpstreamClient;
use ongarde::scanner::calibration::CalibrationResult;
use ongarde::{build_router, AppState};

const ANTHROPIC_KEY_BODY: &str = r#"{"messages":[{"role":"user","content":"sk-ant-REDACTED"}]}"#;
const CLEAN_BODY: &str = r#"{"messages":[{"role":"user","content":"What is the capital of France?"}]}"#;

struct TestHarness {
    app: Router,
    state: Arc<AppState>,
}

fn harness(openai: &str, anthropic: &str) -> TestHarness {
    harness_with(openai, anthropic, Vec::new(), None)
}

fn harness_with(
    openai: &str,
    anthropic: &str,
    allowlist_entries: Vec<AllowlistEntry>,
    api_key: Option<&str>,
) -> TestHarness {
    let mut config = Config::default();
    config.upstream.openai = openai.to_string();
    config.upstream.anthropic = anthropic.to_string();
    config.auth.api_key = api_key.map(String::from);

    let allowlist = Arc::new(AllowlistLoader::default());
    allowlist.install_entries(allowlist_entries);

    let state = Arc::new(AppState::new(
        config,
        UpstreamClient::new().expect("client"),
        None,
        CalibrationResult::conservative_fallback("test harness"),
        allowlist,
        None,
    ));
    state.mark_ready();
    TestHarness {
        app: build_router(state.clone()),
        state,
    }
}

fn post(path: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn assert_ulid(value: &str) {
    assert_eq!(value.len(), 26, "scan id must be a 26-char ULID: {value}");
    assert!(
        value
            .chars()
            .all(|c| "0123456789ABCDEFGHJKMNPQRSTVWXYZ".contains(c)),
        "scan id must be Crockford base32: {value}"
    );
}

// ── Scenario: credential in request body ──────────────────────

#[tokio::test]
async fn test_credential_request_is_blocked_without_upstream_contact() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(&server.uri(), &server.uri());
    let response = h
        .app
        .oneshot(post("/v1/chat/completions", ANTHROPIC_KEY_BODY))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers().get("x-ongarde-block").unwrap(), "true");
    let scan_id = response
        .headers()
        .get("x-ongarde-scan-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_ulid(&scan_id);

    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "policy_violation");
    assert_eq!(body["ongarde"]["blocked"], true);
    assert_eq!(body["ongarde"]["rule_id"], "CREDENTIAL_DETECTED");
    assert_eq!(body["ongarde"]["risk_level"], "CRITICAL");
    assert_eq!(body["ongarde"]["scan_id"], scan_id);

    // The raw credential never appears anywhere in the response body.
    let raw = serde_json::to_string(&body).unwrap();
    assert!(!raw.contains("sk-ant-api03-"));

    // The suppression hint parses and names the matched rule.
    let hint = body["ongarde"]["suppression_hint"].as_str().unwrap();
    let parsed: serde_yaml::Value = serde_yaml::from_str(hint).unwrap();
    assert_eq!(
        parsed["allowlist"][0]["rule_id"].as_str(),
        Some("CREDENTIAL_DETECTED")
    );

    assert!(server.received_requests().await.unwrap().is_empty());
}

// ── Scenario: clean request forwards byte-identically ─────────

#[tokio::test]
async fn test_clean_request_forwarded_with_scan_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": "mocked"})))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server.uri(), &server.uri());
    let response = h
        .app
        .oneshot(post("/v1/chat/completions", CLEAN_BODY))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-ongarde-block").is_none());
    let body = body_json(response).await;
    assert_eq!(body["result"], "mocked");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    // Byte identity: the upstream saw exactly the agent's body.
    assert_eq!(received[0].body, CLEAN_BODY.as_bytes());
    // Scan id injected upstream with the ULID shape.
    let scan_id = received[0]
        .headers
        .get("x-ongarde-scan-id")
        .expect("scan id header")
        .to_str()
        .unwrap();
    assert_ulid(scan_id);
}

// ── Scenario: test credential surfaces test=true ──────────────

#[tokio::test]
async fn test_onboarding_test_credential() {
    let server = MockServer::start().await;
    let h = harness(&server.uri(), &server.uri());
    let response = h
        .app
        .oneshot(post(
            "/v1/chat/completions",
            r#"{"content":"sk-ongarde-test-fake-key-12345"}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["ongarde"]["test"], true);
    let excerpt = body["ongarde"]["redacted_excerpt"].as_str().unwrap();
    assert!(!excerpt.contains("sk-ongarde-test-fake-key-12345"));
}

// ── Scenario: dangerous command ───────────────────────────────

#[tokio::test]
async fn test_dangerous_command_blocked() {
    let server = MockServer::start().await;
    let h = harness(&server.uri(), &server.uri());
    let response = h
        .app
        .oneshot(post("/v1/chat/completions", r#"{"content":"rm -rf /"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["ongarde"]["rule_id"], "DANGEROUS_COMMAND_DETECTED");
}

// ── Scenario: upstream unreachable ────────────────────────────

#[tokio::test]
async fn test_upstream_refused_is_502_without_block_header() {
    // Nothing listens on port 1.
    let h = harness("http://127.0.0.1:1", "http://127.0.0.1:1");
    let response = h
        .app
        .oneshot(post("/v1/chat/completions", CLEAN_BODY))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(response.headers().get("x-ongarde-block").is_none());
    assert!(response.headers().get("x-ongarde-scan-id").is_some());

    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "upstream_unavailable");
    assert_eq!(body["error"]["message"], "Upstream LLM provider unavailable");
}

// ── Routing, path guard, limits ───────────────────────────────

#[tokio::test]
async fn test_messages_path_routes_to_anthropic() {
    let openai = MockServer::start().await;
    let anthropic = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .expect(1)
        .mount(&anthropic)
        .await;

    let h = harness(&openai.uri(), &anthropic.uri());
    let response = h.app.oneshot(post("/v1/messages", CLEAN_BODY)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(openai.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_non_v1_path_is_404_with_no_upstream_contact() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(&server.uri(), &server.uri());
    for uri in ["/metrics", "/v2/chat", "/admin"] {
        let response = h
            .app
            .clone()
            .oneshot(post(uri, CLEAN_BODY))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn test_oversized_body_is_413_with_contract_body() {
    let server = MockServer::start().await;
    let h = harness(&server.uri(), &server.uri());
    let big = "x".repeat(1_048_577);
    let response = h.app.oneshot(post("/v1/chat/completions", &big)).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = body_json(response).await;
    assert_eq!(
        body["error"]["message"],
        "Request body too large. Maximum size: 1MB"
    );
    assert_eq!(body["error"]["code"], "payload_too_large");
    assert!(server.received_requests().await.unwrap().is_empty());
}

// ── Authentication ────────────────────────────────────────────

#[tokio::test]
async fn test_auth_required_when_key_configured() {
    let server = MockServer::start().await;
    let h = harness_with(&server.uri(), &server.uri(), Vec::new(), Some("ong-secret"));

    let unauthenticated = h
        .app
        .clone()
        .oneshot(post("/v1/chat/completions", CLEAN_BODY))
        .await
        .unwrap();
    assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);
    assert!(server.received_requests().await.unwrap().is_empty());

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(&server)
        .await;
    let mut request = post("/v1/chat/completions", CLEAN_BODY);
    request
        .headers_mut()
        .insert("x-ongarde-key", "ong-secret".parse().unwrap());
    let authenticated = h.app.oneshot(request).await.unwrap();
    assert_eq!(authenticated.status(), StatusCode::OK);

    // The key is consumed at the boundary, never forwarded upstream.
    let received = server.received_requests().await.unwrap();
    assert!(received[0].headers.get("x-ongarde-key").is_none());
}

// ── Allowlist suppression ─────────────────────────────────────

#[tokio::test]
async fn test_allowlisted_block_forwards_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let entries = vec![AllowlistEntry {
        rule_id: "CREDENTIAL_DETECTED".into(),
        note: Some("onboarding fixture".into()),
        pattern: None,
        scope: "global".into(),
    }];
    let h = harness_with(&server.uri(), &server.uri(), entries, None);
    let response = h
        .app
        .oneshot(post(
            "/v1/chat/completions",
            r#"{"content":"sk-ongarde-test-fake-key-12345"}"#,
        ))
        .await
        .unwrap();

    // Suppressed: the request reaches the upstream instead of blocking.
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

// ── Response-side scanning (buffered path) ────────────────────

#[tokio::test]
async fn test_response_body_with_credential_is_blocked() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            serde_json::json!({"choices":[{"message":{"content":"your key is sk-ongarde-test-fake-key-12345"}}]}),
        ))
        .mount(&server)
        .await;

    let h = harness(&server.uri(), &server.uri());
    let response = h
        .app
        .oneshot(post("/v1/chat/completions", CLEAN_BODY))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers().get("x-ongarde-block").unwrap(), "true");
    let body = body_json(response).await;
    // The upstream body is discarded; only block metadata goes back.
    assert!(!serde_json::to_string(&body)
        .unwrap()
        .contains("sk-ongarde-test-fake-key-12345"));
}

#[tokio::test]
async fn test_upstream_error_status_passes_through() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .insert_header("x-ratelimit-remaining-requests", "0")
                .set_body_json(serde_json::json!({"error": {"message": "rate limited"}})),
        )
        .mount(&server)
        .await;

    let h = harness(&server.uri(), &server.uri());
    let response = h
        .app
        .oneshot(post("/v1/chat/completions", CLEAN_BODY))
        .await
        .unwrap();

    // 429 passes through with its rate-limit headers intact — no 502
    // rewrite, no block header.
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get("x-ongarde-block").is_none());
    assert_eq!(response.headers().get("retry-after").unwrap(), "7");
    assert_eq!(
        response
            .headers()
            .get("x-ratelimit-remaining-requests")
            .unwrap(),
        "0"
    );
}

// ── Readiness gate ────────────────────────────────────────────

#[tokio::test]
async fn test_not_ready_returns_503() {
    let config = Config::default();
    let state = Arc::new(AppState::new(
        config,
        UpstreamClient::new().unwrap(),
        None,
        CalibrationResult::conservative_fallback("test"),
        Arc::new(AllowlistLoader::default()),
        None,
    ));
    // mark_ready() deliberately not called.
    let app = build_router(state);

    let proxy = app
        .clone()
        .oneshot(post("/v1/chat/completions", CLEAN_BODY))
        .await
        .unwrap();
    assert_eq!(proxy.status(), StatusCode::SERVICE_UNAVAILABLE);

    let health = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_health_reports_after_ready() {
    let server = MockServer::start().await;
    let h = harness(&server.uri(), &server.uri());
    let response = h
        .app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["proxy"], "running");
    assert_eq!(body["scanner_mode"], "full");
    assert!(h.state.is_ready());
}

#[tokio::test]
async fn test_health_scanner_exposes_calibration() {
    let server = MockServer::start().await;
    let h = harness(&server.uri(), &server.uri());
    let response = h
        .app
        .oneshot(Request::get("/health/scanner").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["worker_available"], false);
    assert_eq!(body["calibration"]["tier"], "minimal");
    assert_eq!(body["calibration"]["ok"], false);
    assert_eq!(body["calibration"]["sync_cap"], 500);
}
