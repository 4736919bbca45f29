//! Probe clients against a mock HTTP backend.

mod common;

use std::time::Duration;

use serde_json::json;

use common::*;
use dual_health::health::types::{ErrorKind, Protocol, ProtocolPayload};
use dual_health::protocol::{CapabilityProbeClient, ProbeClient, RestProbeClient};

fn base(addr: std::net::SocketAddr) -> String {
    format!("http://{addr}")
}

#[tokio::test]
async fn rest_probe_reports_status_and_json_body() {
    let addr = start_http_backend(|req| {
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/health");
        MockResponse::json(200, json!({"status": "ok", "uptime": 12}))
    })
    .await;
    let target = target_at("api", &base(addr), Duration::from_secs(2), Duration::from_secs(2));

    let result = RestProbeClient::new().invoke(&target, &lease(Protocol::Rest).await, None).await;

    assert!(result.success, "unexpected failure: {:?}", result.error);
    assert_eq!(result.protocol, Protocol::Rest);
    assert_eq!(
        result.payload,
        ProtocolPayload::Rest {
            status_code: Some(200),
            body: Some(json!({"status": "ok", "uptime": 12})),
        }
    );
}

#[tokio::test]
async fn rest_probe_non_success_status_is_http_error() {
    let addr = start_http_backend(|_| MockResponse::text(503, "maintenance")).await;
    let target = target_at("api", &base(addr), Duration::from_secs(2), Duration::from_secs(2));

    let result = RestProbeClient::new().invoke(&target, &lease(Protocol::Rest).await, None).await;

    assert!(!result.success);
    assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Http);
    match result.payload {
        ProtocolPayload::Rest { status_code, body } => {
            assert_eq!(status_code, Some(503));
            assert_eq!(body, Some(json!("maintenance")));
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
async fn rest_probe_sends_bearer_token() {
    let addr = start_http_backend(|req| match req.headers.get("authorization").map(String::as_str) {
        Some("Bearer s3cret") => MockResponse::json(200, json!({})),
        _ => MockResponse::text(401, "no"),
    })
    .await;
    let target = target_at("api", &base(addr), Duration::from_secs(2), Duration::from_secs(2));
    let client = RestProbeClient::new();

    assert!(client.invoke(&target, &lease(Protocol::Rest).await, Some("s3cret")).await.success);
    assert!(!client.invoke(&target, &lease(Protocol::Rest).await, None).await.success);
}

#[tokio::test]
async fn rest_probe_times_out() {
    let addr =
        start_delayed_backend(Duration::from_millis(500), |_| MockResponse::json(200, json!({})))
            .await;
    let target = target_at("api", &base(addr), Duration::from_secs(2), Duration::from_millis(50));

    let result = RestProbeClient::new().invoke(&target, &lease(Protocol::Rest).await, None).await;

    assert!(!result.success);
    assert_eq!(result.error.unwrap().kind, ErrorKind::Timeout);
}

#[tokio::test]
async fn rest_probe_stops_reading_oversized_body() {
    let addr = start_stalling_backend(96 * 1024).await;
    let target = target_at("api", &base(addr), Duration::from_secs(2), Duration::from_secs(2));

    let started = std::time::Instant::now();
    let result = RestProbeClient::new().invoke(&target, &lease(Protocol::Rest).await, None).await;

    assert!(result.success, "unexpected failure: {:?}", result.error);
    assert!(started.elapsed() < Duration::from_secs(2));
    match result.payload {
        ProtocolPayload::Rest { body: Some(serde_json::Value::String(text)), .. } => {
            assert_eq!(text.len(), 1024);
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
async fn rest_probe_refused_connection() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let target = target_at("api", &base(addr), Duration::from_secs(1), Duration::from_secs(1));

    let result = RestProbeClient::new().invoke(&target, &lease(Protocol::Rest).await, None).await;

    assert!(!result.success);
    assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Connection);
    assert!(result.is_retryable());
}

#[tokio::test]
async fn capability_probe_lists_tools_over_json() {
    let addr = start_http_backend(capability_handler(&["search", "fetch"], false)).await;
    let target = target_at("mcp", &base(addr), Duration::from_secs(2), Duration::from_secs(2));

    let result = CapabilityProbeClient::new()
        .invoke(&target, &lease(Protocol::Capability).await, None)
        .await;

    assert!(result.success, "unexpected failure: {:?}", result.error);
    assert_eq!(
        result.payload,
        ProtocolPayload::Capability {
            capabilities: vec!["search".into(), "fetch".into()],
            count: 2,
        }
    );
}

#[tokio::test]
async fn capability_probe_accepts_event_stream() {
    let addr = start_http_backend(capability_handler(&["search"], true)).await;
    let target = target_at("mcp", &base(addr), Duration::from_secs(2), Duration::from_secs(2));

    let result = CapabilityProbeClient::new()
        .invoke(&target, &lease(Protocol::Capability).await, None)
        .await;

    assert!(result.success, "unexpected failure: {:?}", result.error);
}

#[tokio::test]
async fn capability_probe_flags_missing_capabilities() {
    let addr = start_http_backend(capability_handler(&["search"], false)).await;
    let mut target = target_at("mcp", &base(addr), Duration::from_secs(2), Duration::from_secs(2));
    // Rebuild with an expectation the server does not meet.
    let mut capability = target.capability().clone();
    capability.expected_capabilities = vec!["search".into(), "write".into()];
    target = dual_health::health::types::ServerTarget::new(
        "mcp",
        capability,
        target.rest().clone(),
        target.weights(),
    )
    .unwrap();

    let result = CapabilityProbeClient::new()
        .invoke(&target, &lease(Protocol::Capability).await, None)
        .await;

    assert!(!result.success);
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Protocol);
    assert!(error.message.contains("write"));
    assert!(matches!(result.payload, ProtocolPayload::Capability { count: 1, .. }));
}

#[tokio::test]
async fn capability_probe_rejects_non_rpc_server() {
    let addr = start_http_backend(|_| MockResponse::text(200, "<html>hello</html>")).await;
    let target = target_at("web", &base(addr), Duration::from_secs(2), Duration::from_secs(2));

    let result = CapabilityProbeClient::new()
        .invoke(&target, &lease(Protocol::Capability).await, None)
        .await;

    assert!(!result.success);
    assert_eq!(result.error.unwrap().kind, ErrorKind::Protocol);
}
