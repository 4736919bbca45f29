//! Health check types and error definitions.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Tolerance applied when checking that protocol weights sum to 1.0.
pub const WEIGHT_EPSILON: f64 = 0.001;

/// Errors that can occur while configuring or running health checks.
#[derive(Debug, Error)]
pub enum HealthError {
    /// The remote end refused or dropped the connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The probe did not finish in time.
    #[error("Timeout after {0} ms")]
    Timeout(u64),

    /// Capability protocol failure (malformed response, JSON-RPC error).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// REST failure (non-2xx status or unreadable body).
    #[error("HTTP error: {message}")]
    Http { status: Option<u16>, message: String },

    /// Admission control rejected the check.
    #[error("Resource exhausted: {active}/{limit} checks active (check {check_id})")]
    ResourceExhausted {
        check_id: Uuid,
        active: usize,
        limit: usize,
    },

    /// Invalid configuration detected at construction time.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type for health check operations.
pub type HealthResult<T> = Result<T, HealthError>;

/// The two probe protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Tool-invocation protocol listing a server's capabilities.
    Capability,
    /// Plain HTTP health endpoint.
    Rest,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Capability => "capability",
            Protocol::Rest => "rest",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classification of a single protocol probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Timeout,
    Protocol,
    Http,
}

/// Error captured as data inside a [`ProtocolResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProbeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&HealthError> for ProbeError {
    fn from(err: &HealthError) -> Self {
        let kind = match err {
            HealthError::Connection(_) => ErrorKind::Connection,
            HealthError::Timeout(_) => ErrorKind::Timeout,
            HealthError::Http { .. } => ErrorKind::Http,
            HealthError::Protocol(_)
            | HealthError::ResourceExhausted { .. }
            | HealthError::Configuration(_) => ErrorKind::Protocol,
        };
        ProbeError::new(kind, err.to_string())
    }
}

/// Protocol-specific part of a probe result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtocolPayload {
    Capability {
        capabilities: Vec<String>,
        count: usize,
    },
    Rest {
        status_code: Option<u16>,
        body: Option<serde_json::Value>,
    },
    /// No payload (probe never got a response).
    Empty,
}

/// Outcome of one probe over one protocol. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolResult {
    pub server_name: String,
    pub protocol: Protocol,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub response_time_ms: f64,
    pub payload: ProtocolPayload,
    pub error: Option<ProbeError>,
}

impl ProtocolResult {
    /// Build a successful result.
    pub fn success(
        server_name: impl Into<String>,
        protocol: Protocol,
        response_time_ms: f64,
        payload: ProtocolPayload,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            protocol,
            timestamp: Utc::now(),
            success: true,
            response_time_ms,
            payload,
            error: None,
        }
    }

    /// Build a failed result carrying the failure reason.
    pub fn failure(
        server_name: impl Into<String>,
        protocol: Protocol,
        response_time_ms: f64,
        error: ProbeError,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            protocol,
            timestamp: Utc::now(),
            success: false,
            response_time_ms,
            payload: ProtocolPayload::Empty,
            error: Some(error),
        }
    }

    /// Replace the payload, keeping everything else.
    pub fn with_payload(mut self, payload: ProtocolPayload) -> Self {
        self.payload = payload;
        self
    }

    /// True when the failure is worth re-invoking (connection or timeout).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::Connection) | Some(ErrorKind::Timeout)
        )
    }
}

/// Aggregate verdict for one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Unhealthy,
    Degraded,
    Healthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

/// Which protocol paths are currently usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailablePath {
    Capability,
    Rest,
    Both,
    None,
}

/// Combined result of one dual check. Constructed once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DualCheckResult {
    pub server_name: String,
    pub timestamp: DateTime<Utc>,
    pub overall_status: HealthStatus,
    pub overall_success: bool,
    pub capability_result: Option<ProtocolResult>,
    pub rest_result: Option<ProtocolResult>,
    pub combined_response_time_ms: f64,
    pub health_score: f64,
    pub available_paths: Vec<AvailablePath>,
    /// Reason for synthetic outcomes (breaker open, timeout, admission).
    pub error: Option<String>,
}

impl DualCheckResult {
    /// Synthetic result produced without (complete) protocol results.
    pub fn synthetic(
        server_name: impl Into<String>,
        status: HealthStatus,
        error: impl Into<String>,
        combined_response_time_ms: f64,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            timestamp: Utc::now(),
            overall_status: status,
            overall_success: status == HealthStatus::Healthy,
            capability_result: None,
            rest_result: None,
            combined_response_time_ms,
            health_score: 0.0,
            available_paths: vec![AvailablePath::None],
            error: Some(error.into()),
        }
    }
}

/// Capability-protocol settings of a server.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityEndpoint {
    pub endpoint: Url,
    pub timeout: Duration,
    pub retries: u32,
    pub expected_capabilities: Vec<String>,
    pub enabled: bool,
}

/// REST-protocol settings of a server.
#[derive(Debug, Clone, PartialEq)]
pub struct RestEndpoint {
    pub endpoint: Url,
    pub timeout: Duration,
    pub retries: u32,
    pub enabled: bool,
}

/// Priority weights of the two protocols. Always sums to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProtocolWeights {
    capability: f64,
    rest: f64,
}

impl ProtocolWeights {
    pub fn new(capability: f64, rest: f64) -> HealthResult<Self> {
        validate_weights(capability, rest)?;
        Ok(Self { capability, rest })
    }

    pub fn capability(&self) -> f64 {
        self.capability
    }

    pub fn rest(&self) -> f64 {
        self.rest
    }
}

impl Default for ProtocolWeights {
    fn default() -> Self {
        Self {
            capability: 0.6,
            rest: 0.4,
        }
    }
}

pub(crate) fn validate_weights(capability: f64, rest: f64) -> HealthResult<()> {
    if !(0.0..=1.0).contains(&capability) || !(0.0..=1.0).contains(&rest) {
        return Err(HealthError::Configuration(format!(
            "protocol weights must be within [0, 1] (capability={capability}, rest={rest})"
        )));
    }
    let sum = capability + rest;
    if (sum - 1.0).abs() > WEIGHT_EPSILON {
        return Err(HealthError::Configuration(format!(
            "protocol weights must sum to 1.0 (got {sum:.4})"
        )));
    }
    Ok(())
}

/// A server to be checked. Read-only during a check cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerTarget {
    name: String,
    capability: CapabilityEndpoint,
    rest: RestEndpoint,
    weights: ProtocolWeights,
    priority: u32,
    auth_token_env: Option<String>,
}

impl ServerTarget {
    /// Create a target, rejecting configurations with no enabled protocol.
    pub fn new(
        name: impl Into<String>,
        capability: CapabilityEndpoint,
        rest: RestEndpoint,
        weights: ProtocolWeights,
    ) -> HealthResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(HealthError::Configuration("server name must not be empty".into()));
        }
        if !capability.enabled && !rest.enabled {
            return Err(HealthError::Configuration(format!(
                "server '{name}' must enable at least one protocol"
            )));
        }
        for (protocol, timeout) in [
            (Protocol::Capability, capability.timeout),
            (Protocol::Rest, rest.timeout),
        ] {
            if timeout.is_zero() {
                return Err(HealthError::Configuration(format!(
                    "server '{name}' has a zero {protocol} timeout"
                )));
            }
        }

        Ok(Self {
            name,
            capability,
            rest,
            weights,
            priority: 0,
            auth_token_env: None,
        })
    }

    /// Set the scheduling priority (higher runs first when queued).
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Name of the environment variable holding this server's bearer token.
    pub fn with_auth_token_env(mut self, var: impl Into<String>) -> Self {
        self.auth_token_env = Some(var.into());
        self
    }

    /// Copy of this target with both protocol timeouts replaced.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut target = self.clone();
        if !timeout.is_zero() {
            target.capability.timeout = timeout;
            target.rest.timeout = timeout;
        }
        target
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capability(&self) -> &CapabilityEndpoint {
        &self.capability
    }

    pub fn rest(&self) -> &RestEndpoint {
        &self.rest
    }

    pub fn weights(&self) -> ProtocolWeights {
        self.weights
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn auth_token_env(&self) -> Option<&str> {
        self.auth_token_env.as_deref()
    }

    pub fn is_enabled(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Capability => self.capability.enabled,
            Protocol::Rest => self.rest.enabled,
        }
    }

    pub fn timeout(&self, protocol: Protocol) -> Duration {
        match protocol {
            Protocol::Capability => self.capability.timeout,
            Protocol::Rest => self.rest.timeout,
        }
    }

    pub fn retries(&self, protocol: Protocol) -> u32 {
        match protocol {
            Protocol::Capability => self.capability.retries,
            Protocol::Rest => self.rest.retries,
        }
    }
}
