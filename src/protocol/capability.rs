//! Capability-protocol probe (JSON-RPC 2.0 over HTTP).
//!
//! # Responsibilities
//! - Perform the `initialize` handshake and `notifications/initialized`
//! - List the server's capabilities with `tools/list`
//! - Verify every expected capability is advertised
//!
//! # Design Decisions
//! - Session ids issued on `initialize` are echoed on later requests
//! - Both `application/json` and `text/event-stream` response bodies are accepted
//! - JSON-RPC error objects and malformed bodies are protocol errors

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};
use tokio::time::Instant;
use url::Url;

use crate::health::types::{
    ErrorKind, ProbeError, Protocol, ProtocolPayload, ProtocolResult, ServerTarget,
};
use crate::protocol::client::{classify_reqwest_error, elapsed_ms, ProbeClient};
use crate::resources::pool::PoolLease;

pub const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION: &str = "2025-03-26";
const ACCEPT_VALUE: &str = "application/json, text/event-stream";

/// Probes a server's capability endpoint.
#[derive(Debug, Clone, Default)]
pub struct CapabilityProbeClient;

impl CapabilityProbeClient {
    pub fn new() -> Self {
        Self
    }
}

/// One JSON-RPC exchange context for a single probe.
struct RpcSession<'a> {
    lease: &'a PoolLease,
    endpoint: &'a Url,
    timeout: std::time::Duration,
    token: Option<&'a str>,
    session_id: Option<String>,
}

impl RpcSession<'_> {
    async fn post(&mut self, body: &Value) -> Result<reqwest::Response, ProbeError> {
        let mut request = self
            .lease
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .header(ACCEPT, ACCEPT_VALUE)
            .json(body);
        if let Some(token) = self.token {
            request = request.bearer_auth(token);
        }
        if let Some(session) = &self.session_id {
            request = request.header(SESSION_HEADER, session.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e, Protocol::Capability))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::new(
                ErrorKind::Protocol,
                format!("capability endpoint returned HTTP {}", status.as_u16()),
            ));
        }
        Ok(response)
    }

    /// Send a request and return its `result` member.
    async fn call(&mut self, id: u64, method: &str, params: Value) -> Result<Value, ProbeError> {
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let response = self.post(&body).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let text = response
            .text()
            .await
            .map_err(|e| classify_reqwest_error(&e, Protocol::Capability))?;

        let message = parse_rpc_body(&content_type, &text)?;
        extract_result(method, message)
    }

    async fn notify(&mut self, method: &str) -> Result<(), ProbeError> {
        let body = json!({ "jsonrpc": "2.0", "method": method });
        self.post(&body).await.map(|_| ())
    }
}

#[async_trait]
impl ProbeClient for CapabilityProbeClient {
    fn protocol(&self) -> Protocol {
        Protocol::Capability
    }

    async fn invoke(
        &self,
        target: &ServerTarget,
        lease: &PoolLease,
        token: Option<&str>,
    ) -> ProtocolResult {
        let start = Instant::now();
        let cap = target.capability();
        let mut session = RpcSession {
            lease,
            endpoint: &cap.endpoint,
            timeout: cap.timeout,
            token,
            session_id: None,
        };

        let capabilities = match list_capabilities(&mut session).await {
            Ok(capabilities) => capabilities,
            Err(error) => {
                tracing::debug!(
                    server = %target.name(),
                    error = %error.message,
                    "Capability probe failed"
                );
                let elapsed = elapsed_ms(start);
                return ProtocolResult::failure(target.name(), Protocol::Capability, elapsed, error);
            }
        };

        let missing: Vec<&str> = cap
            .expected_capabilities
            .iter()
            .filter(|expected| !capabilities.contains(expected))
            .map(String::as_str)
            .collect();

        let elapsed = elapsed_ms(start);
        let payload = ProtocolPayload::Capability {
            count: capabilities.len(),
            capabilities,
        };

        if missing.is_empty() {
            ProtocolResult::success(target.name(), Protocol::Capability, elapsed, payload)
        } else {
            ProtocolResult::failure(
                target.name(),
                Protocol::Capability,
                elapsed,
                ProbeError::new(
                    ErrorKind::Protocol,
                    format!("missing capabilities: {}", missing.join(", ")),
                ),
            )
            .with_payload(payload)
        }
    }
}

async fn list_capabilities(session: &mut RpcSession<'_>) -> Result<Vec<String>, ProbeError> {
    session
        .call(
            1,
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": "dual-health", "version": env!("CARGO_PKG_VERSION") },
            }),
        )
        .await?;
    session.notify("notifications/initialized").await?;

    let listing = session.call(2, "tools/list", json!({})).await?;
    parse_capabilities(&listing)
}

/// Decode a JSON-RPC message from a JSON or SSE body.
pub fn parse_rpc_body(content_type: &str, body: &str) -> Result<Value, ProbeError> {
    if content_type.starts_with("text/event-stream") {
        return body
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .filter_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
            .find(|msg| msg.get("result").is_some() || msg.get("error").is_some())
            .ok_or_else(|| {
                ProbeError::new(ErrorKind::Protocol, "no JSON-RPC response in event stream")
            });
    }

    serde_json::from_str(body)
        .map_err(|e| ProbeError::new(ErrorKind::Protocol, format!("malformed JSON-RPC body: {e}")))
}

fn extract_result(method: &str, mut message: Value) -> Result<Value, ProbeError> {
    if let Some(error) = message.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
        let text = error.get("message").and_then(Value::as_str).unwrap_or("unknown error");
        return Err(ProbeError::new(
            ErrorKind::Protocol,
            format!("{method} failed with JSON-RPC error {code}: {text}"),
        ));
    }
    message
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| {
            ProbeError::new(ErrorKind::Protocol, format!("{method} response has no result"))
        })
}

/// Names from a `tools/list` result.
pub fn parse_capabilities(listing: &Value) -> Result<Vec<String>, ProbeError> {
    let tools = listing
        .get("tools")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            ProbeError::new(ErrorKind::Protocol, "tools/list result has no tools array")
        })?;

    Ok(tools
        .iter()
        .filter_map(|tool| tool.get("name").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_body() {
        let body = r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[]}}"#;
        let msg = parse_rpc_body("application/json", body).unwrap();
        assert_eq!(msg["id"], 2);
    }

    #[test]
    fn test_parse_event_stream_body() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"tools\":[{\"name\":\"search\"}]}}\n\n";
        let msg = parse_rpc_body("text/event-stream; charset=utf-8", body).unwrap();
        let result = extract_result("tools/list", msg).unwrap();
        assert_eq!(parse_capabilities(&result).unwrap(), vec!["search".to_string()]);
    }

    #[test]
    fn test_malformed_body_is_protocol_error() {
        let err = parse_rpc_body("application/json", "<html>").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);

        let err = parse_rpc_body("text/event-stream", "data: nope\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
    }

    #[test]
    fn test_rpc_error_object() {
        let msg = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32601, "message": "Method not found"}
        });
        let err = extract_result("tools/list", msg).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
        assert!(err.message.contains("-32601"));
    }

    #[test]
    fn test_capabilities_require_tools_array() {
        assert!(parse_capabilities(&json!({})).is_err());
        let result = json!({"tools": [{"name": "a"}, {"description": "no name"}, {"name": "b"}]});
        let names = parse_capabilities(&result).unwrap();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
