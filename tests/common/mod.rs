//! Shared utilities for integration testing.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use url::Url;

use dual_health::health::orchestrator::{Collaborators, DualCheckOrchestrator, OrchestratorConfig};
use dual_health::health::types::{
    CapabilityEndpoint, ErrorKind, ProbeError, Protocol, ProtocolPayload, ProtocolResult,
    ProtocolWeights, RestEndpoint, ServerTarget,
};
use dual_health::observability::metrics::EngineMetrics;
use dual_health::protocol::{EnvTokenProvider, ProbeClient};
use dual_health::resilience::circuit_breaker::{BreakerBook, BreakerConfig};
use dual_health::resources::admission::{FixedSampler, ResourceLimits, ResourceMonitor};
use dual_health::resources::cache::{CacheConfig, CacheManager};
use dual_health::resources::pool::{ConnectionPoolManager, PoolConfig, PoolLease};

// ---------------------------------------------------------------------------
// Scripted probe clients
// ---------------------------------------------------------------------------

/// What a scripted probe does when invoked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Behavior {
    Succeed,
    Fail(ErrorKind),
    /// Never completes; only cancellation ends it.
    Hang,
}

/// A probe client with programmable outcomes and latency.
pub struct ScriptedClient {
    protocol: Protocol,
    fallback: Behavior,
    script: Mutex<VecDeque<Behavior>>,
    delay: Duration,
    server_delays: HashMap<String, Duration>,
    calls: AtomicUsize,
    cancelled: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(protocol: Protocol, fallback: Behavior) -> Self {
        Self {
            protocol,
            fallback,
            script: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            server_delays: HashMap::new(),
            calls: AtomicUsize::new(0),
            cancelled: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
        }
    }

    /// Outcomes consumed in order before falling back.
    pub fn with_script(self, steps: Vec<Behavior>) -> Self {
        *self.script.lock().unwrap() = steps.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_server_delay(mut self, server: &str, delay: Duration) -> Self {
        self.server_delays.insert(server.to_string(), delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Invocations dropped before they produced a result.
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Highest number of invocations ever running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Counts one running invocation until dropped.
struct Running(Arc<AtomicUsize>);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct DropWatch {
    counter: Arc<AtomicUsize>,
    armed: bool,
}

impl Drop for DropWatch {
    fn drop(&mut self) {
        if self.armed {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ProbeClient for ScriptedClient {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn invoke(
        &self,
        target: &ServerTarget,
        _lease: &PoolLease,
        _token: Option<&str>,
    ) -> ProtocolResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);
        let _running = Running(self.running.clone());
        let behavior = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
        let mut watch = DropWatch {
            counter: self.cancelled.clone(),
            armed: true,
        };

        let delay = self.server_delays.get(target.name()).copied().unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let elapsed = delay.as_secs_f64() * 1000.0;

        let result = match behavior {
            Behavior::Succeed => {
                let payload = payload(self.protocol);
                ProtocolResult::success(target.name(), self.protocol, elapsed, payload)
            }
            Behavior::Fail(kind) => ProtocolResult::failure(
                target.name(),
                self.protocol,
                elapsed,
                ProbeError::new(kind, "scripted failure"),
            ),
            Behavior::Hang => std::future::pending::<ProtocolResult>().await,
        };
        watch.armed = false;
        result
    }
}

fn payload(protocol: Protocol) -> ProtocolPayload {
    match protocol {
        Protocol::Capability => ProtocolPayload::Capability {
            capabilities: vec!["search".into()],
            count: 1,
        },
        Protocol::Rest => ProtocolPayload::Rest {
            status_code: Some(200),
            body: Some(json!({"status": "ok"})),
        },
    }
}

// ---------------------------------------------------------------------------
// Targets and orchestrator harness
// ---------------------------------------------------------------------------

pub fn target_at(
    name: &str,
    base: &str,
    capability_timeout: Duration,
    rest_timeout: Duration,
) -> ServerTarget {
    ServerTarget::new(
        name,
        CapabilityEndpoint {
            endpoint: Url::parse(&format!("{base}/mcp")).unwrap(),
            timeout: capability_timeout,
            retries: 0,
            expected_capabilities: vec![],
            enabled: true,
        },
        RestEndpoint {
            endpoint: Url::parse(&format!("{base}/health")).unwrap(),
            timeout: rest_timeout,
            retries: 0,
            enabled: true,
        },
        ProtocolWeights::default(),
    )
    .unwrap()
}

/// Target whose endpoints are never dialled by scripted clients.
pub fn target(name: &str) -> ServerTarget {
    target_at(name, "http://127.0.0.1:9", Duration::from_secs(1), Duration::from_secs(1))
}

pub struct Harness {
    pub orchestrator: Arc<DualCheckOrchestrator>,
    pub breakers: Arc<BreakerBook>,
    pub resources: Arc<ResourceMonitor>,
    pub sampler: Arc<FixedSampler>,
    pub capability: Arc<ScriptedClient>,
    pub rest: Arc<ScriptedClient>,
}

pub fn harness(capability: ScriptedClient, rest: ScriptedClient) -> Harness {
    harness_with(OrchestratorConfig::default(), ResourceLimits::default(), capability, rest)
}

pub fn harness_with(
    config: OrchestratorConfig,
    limits: ResourceLimits,
    capability: ScriptedClient,
    rest: ScriptedClient,
) -> Harness {
    let capability = Arc::new(capability);
    let rest = Arc::new(rest);
    let sampler = Arc::new(FixedSampler::new(10.0, 10.0));
    let resources = Arc::new(ResourceMonitor::new(limits, sampler.clone()).unwrap());
    let breakers = Arc::new(BreakerBook::new(BreakerConfig::default()));

    let orchestrator = DualCheckOrchestrator::new(
        config,
        Collaborators {
            capability_client: capability.clone(),
            rest_client: rest.clone(),
            auth: Arc::new(EnvTokenProvider),
            breakers: breakers.clone(),
            pools: Arc::new(pool_manager()),
            resources: resources.clone(),
            cache: Arc::new(CacheManager::new(CacheConfig::default()).unwrap()),
            metrics: Arc::new(EngineMetrics::new()),
        },
    )
    .unwrap();

    Harness {
        orchestrator: Arc::new(orchestrator),
        breakers,
        resources,
        sampler,
        capability,
        rest,
    }
}

/// A lease from a fresh pool, for driving probe clients directly.
pub async fn lease(protocol: Protocol) -> PoolLease {
    pool_manager().get_pool(protocol).acquire().await.unwrap()
}

fn pool_manager() -> ConnectionPoolManager {
    let idle = Duration::from_secs(60);
    ConnectionPoolManager::new(PoolConfig::default(), PoolConfig::default(), idle).unwrap()
}

// ---------------------------------------------------------------------------
// Mock HTTP backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: String,
    pub path: String,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl MockRequest {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl MockResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: body.to_string(),
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "text/plain".into())],
            body: body.to_string(),
        }
    }

    pub fn event_stream(message: Value) -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type".into(), "text/event-stream".into())],
            body: format!("event: message\ndata: {message}\n\n"),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Start a mock backend on an ephemeral port.
pub async fn start_http_backend<F>(handler: F) -> SocketAddr
where
    F: Fn(MockRequest) -> MockResponse + Send + Sync + 'static,
{
    start_delayed_backend(Duration::ZERO, handler).await
}

/// Start a mock backend that waits `delay` before answering.
pub async fn start_delayed_backend<F>(delay: Duration, handler: F) -> SocketAddr
where
    F: Fn(MockRequest) -> MockResponse + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        let (read, mut write) = socket.into_split();
                        let Some(request) = read_request(BufReader::new(read)).await else {
                            return;
                        };
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        let response = handler(request);

                        let reason = status_text(response.status);
                        let mut raw = format!("HTTP/1.1 {} {reason}\r\n", response.status);
                        for (name, value) in &response.headers {
                            raw.push_str(&format!("{name}: {value}\r\n"));
                        }
                        raw.push_str(&format!(
                            "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                            response.body.len(),
                            response.body
                        ));
                        let _ = write.write_all(raw.as_bytes()).await;
                        let _ = write.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Start a backend that announces a 100 MB body, sends `sent` bytes of it
/// and then stalls with the connection open.
pub async fn start_stalling_backend(sent: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (read, mut write) = socket.into_split();
                if read_request(BufReader::new(read)).await.is_none() {
                    return;
                }
                let head = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\
                            Content-Length: 100000000\r\n\r\n";
                let _ = write.write_all(head.as_bytes()).await;
                let _ = write.write_all(&vec![b'x'; sent]).await;
                let _open = write;
                std::future::pending::<()>().await;
            });
        }
    });

    addr
}

async fn read_request<R>(mut reader: BufReader<R>) -> Option<MockRequest>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    reader.read_line(&mut line).await.ok()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = HashMap::new();
    loop {
        let mut header = String::new();
        reader.read_line(&mut header).await.ok()?;
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let length = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.ok()?;

    Some(MockRequest {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

/// JSON-RPC capability server advertising `tools`. Requires the session id
/// issued on `initialize` for every later request.
pub fn capability_handler(
    tools: &'static [&'static str],
    sse: bool,
) -> impl Fn(MockRequest) -> MockResponse {
    const SESSION: &str = "session-1";
    move |request: MockRequest| {
        let message = request.json();
        let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
        let id = message.get("id").cloned().unwrap_or(Value::Null);

        let session = request.headers.get("mcp-session-id").map(String::as_str);
        if method != "initialize" && session != Some(SESSION) {
            return MockResponse::text(400, "missing session");
        }

        let reply = |result: Value| {
            let body = json!({ "jsonrpc": "2.0", "id": id, "result": result });
            if sse {
                MockResponse::event_stream(body)
            } else {
                MockResponse::json(200, body)
            }
        };

        match method {
            "initialize" => reply(json!({
                "protocolVersion": "2025-03-26",
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "mock", "version": "1.0" },
            }))
            .with_header("mcp-session-id", SESSION),
            "notifications/initialized" => MockResponse::text(202, ""),
            "tools/list" => {
                let listed: Vec<Value> = tools.iter().map(|name| json!({ "name": name })).collect();
                reply(json!({ "tools": listed }))
            }
            _ => MockResponse::json(
                200,
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32601, "message": "Method not found" }
                }),
            ),
        }
    }
}
