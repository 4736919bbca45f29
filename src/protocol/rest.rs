//! REST health endpoint probe.

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::health::types::{
    ErrorKind, ProbeError, Protocol, ProtocolPayload, ProtocolResult, ServerTarget,
};
use crate::protocol::client::{classify_reqwest_error, elapsed_ms, ProbeClient};
use crate::resources::pool::PoolLease;

/// Non-JSON bodies are kept as text up to this many bytes.
const MAX_TEXT_BODY: usize = 1024;
/// Reading stops once this many body bytes have arrived.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// `GET` the server's REST health endpoint; any 2xx is healthy.
#[derive(Debug, Clone, Default)]
pub struct RestProbeClient;

impl RestProbeClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProbeClient for RestProbeClient {
    fn protocol(&self) -> Protocol {
        Protocol::Rest
    }

    async fn invoke(
        &self,
        target: &ServerTarget,
        lease: &PoolLease,
        token: Option<&str>,
    ) -> ProtocolResult {
        let start = Instant::now();
        let rest = target.rest();

        let mut request = lease.get(rest.endpoint.clone()).timeout(rest.timeout);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return ProtocolResult::failure(
                    target.name(),
                    Protocol::Rest,
                    elapsed_ms(start),
                    classify_reqwest_error(&e, Protocol::Rest),
                );
            }
        };

        let status = response.status();
        let body = match read_capped(response, MAX_BODY_BYTES).await {
            Ok(bytes) => parse_body(&bytes),
            Err(e) => {
                return ProtocolResult::failure(
                    target.name(),
                    Protocol::Rest,
                    elapsed_ms(start),
                    classify_reqwest_error(&e, Protocol::Rest),
                );
            }
        };

        let payload = ProtocolPayload::Rest {
            status_code: Some(status.as_u16()),
            body,
        };
        let elapsed = elapsed_ms(start);

        if status.is_success() {
            ProtocolResult::success(target.name(), Protocol::Rest, elapsed, payload)
        } else {
            tracing::debug!(
                server = %target.name(),
                status = %status,
                "REST probe returned non-success status"
            );
            ProtocolResult::failure(
                target.name(),
                Protocol::Rest,
                elapsed,
                ProbeError::new(ErrorKind::Http, format!("HTTP {}", status.as_u16())),
            )
            .with_payload(payload)
        }
    }
}

/// Read at most `cap` body bytes, leaving the rest unread.
async fn read_capped(mut response: reqwest::Response, cap: usize) -> reqwest::Result<Vec<u8>> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = cap - body.len();
        body.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if body.len() >= cap {
            break;
        }
    }
    Ok(body)
}

fn parse_body(bytes: &[u8]) -> Option<Value> {
    if bytes.is_empty() {
        return None;
    }
    if let Ok(json) = serde_json::from_slice::<Value>(bytes) {
        return Some(json);
    }
    let text = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_TEXT_BODY)]);
    Some(Value::String(text.into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body_prefers_json() {
        assert_eq!(parse_body(br#"{"status":"ok"}"#), Some(serde_json::json!({"status": "ok"})));
        assert_eq!(parse_body(b""), None);
        assert_eq!(parse_body(b"OK"), Some(Value::String("OK".into())));
    }

    #[test]
    fn test_parse_body_truncates_text() {
        let long = vec![b'a'; 4096];
        match parse_body(&long) {
            Some(Value::String(s)) => assert_eq!(s.len(), MAX_TEXT_BODY),
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
