use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::admin::AdminState;
use crate::health::types::{DualCheckResult, ServerTarget};
use crate::observability::metrics::MetricsSnapshot;
use crate::resilience::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerState};
use crate::resources::admission::ResourceStats;
use crate::resources::cache::CategoryStats;
use crate::resources::pool::PoolStats;

type ApiError = (StatusCode, Json<ErrorBody>);

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorBody { error: message.into() }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SystemStatus {
    pub version: String,
    pub status: String,
    pub uptime_secs: u64,
    pub servers: usize,
    pub in_flight: Vec<String>,
    pub pending_batches: usize,
    pub pending_requests: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerStatus {
    pub name: String,
    pub priority: u32,
    pub breaker: CircuitBreakerState,
    pub latest: Option<DualCheckResult>,
}

#[derive(Debug, Serialize)]
pub struct MetricsReport {
    pub snapshot: MetricsSnapshot,
    pub cache: Vec<CategoryStats>,
    pub pools: Vec<PoolStats>,
    pub resources: ResourceStats,
    pub breakers: Vec<(String, CircuitBreakerState)>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckRequest {
    pub servers: Vec<String>,
    #[serde(default)]
    pub priority: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckAccepted {
    pub batch_ids: Vec<Uuid>,
    pub queued: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub server: String,
    pub cancelled: bool,
}

fn server_status(state: &AdminState, target: &ServerTarget) -> ServerStatus {
    ServerStatus {
        name: target.name().to_string(),
        priority: target.priority(),
        breaker: state.monitor.breakers().state(target.name()),
        latest: state.monitor.latest(target.name()),
    }
}

fn lookup(state: &AdminState, name: &str) -> Result<ServerTarget, ApiError> {
    state
        .monitor
        .target(name)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("unknown server '{name}'")))
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: "operational".to_string(),
        uptime_secs: state.uptime().as_secs(),
        servers: state.monitor.targets().len(),
        in_flight: state.monitor.orchestrator().in_flight_servers(),
        pending_batches: state.scheduler.pending_batches(),
        pending_requests: state.scheduler.pending_requests(),
    })
}

pub async fn get_servers(State(state): State<AdminState>) -> Json<Vec<ServerStatus>> {
    let targets = state.monitor.targets();
    Json(targets.iter().map(|t| server_status(&state, t)).collect())
}

pub async fn get_server(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<ServerStatus>, ApiError> {
    let target = lookup(&state, &name)?;
    Ok(Json(server_status(&state, &target)))
}

/// Run a check immediately, bypassing the batcher.
pub async fn check_now(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<DualCheckResult>, ApiError> {
    let target = lookup(&state, &name)?;
    let result = state
        .monitor
        .orchestrator()
        .check_server_with_retry(&target, &state.retry)
        .await;
    state.monitor.record(std::slice::from_ref(&result));
    Ok(Json(result))
}

pub async fn cancel_checks(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<CancelOutcome>, ApiError> {
    lookup(&state, &name)?;
    let cancelled = state.monitor.orchestrator().cancel_server(&name);
    Ok(Json(CancelOutcome { server: name, cancelled }))
}

/// Queue checks through the batch scheduler.
pub async fn submit_checks(
    State(state): State<AdminState>,
    Json(request): Json<CheckRequest>,
) -> Result<(StatusCode, Json<CheckAccepted>), ApiError> {
    if request.servers.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "no servers given"));
    }

    let targets = request
        .servers
        .iter()
        .map(|name| lookup(&state, name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut batch_ids = Vec::new();
    for target in targets {
        let id = state.scheduler.add_request(target, request.priority);
        if !batch_ids.contains(&id) {
            batch_ids.push(id);
        }
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(CheckAccepted {
            batch_ids,
            queued: request.servers.len(),
        }),
    ))
}

pub async fn get_metrics(State(state): State<AdminState>) -> Json<MetricsReport> {
    let orchestrator = state.monitor.orchestrator();
    let deps = orchestrator.collaborators();
    Json(MetricsReport {
        snapshot: orchestrator.metrics_snapshot(),
        cache: deps.cache.stats(),
        pools: deps.pools.stats(),
        resources: deps.resources.stats(),
        breakers: state.monitor.breakers().snapshot(),
    })
}
