//! Admin HTTP API.
//!
//! Bearer-authenticated JSON endpoints over the running engine:
//!
//! | Method | Path                          | Purpose                              |
//! |--------|-------------------------------|--------------------------------------|
//! | GET    | `/admin/status`               | version, uptime, in-flight servers   |
//! | GET    | `/admin/servers`              | breaker state and latest result      |
//! | GET    | `/admin/servers/{name}`       | one server                           |
//! | POST   | `/admin/servers/{name}/check` | run a check now (with retries)       |
//! | DELETE | `/admin/servers/{name}/check` | cancel the server's in-flight checks |
//! | POST   | `/admin/checks`               | queue checks through the batcher     |
//! | GET    | `/admin/metrics`              | snapshot plus cache/pool/admission   |

pub mod auth;
pub mod handlers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::health::monitor::FleetMonitor;
use crate::resilience::retries::RetryPolicy;
use crate::scheduler::batch::BatchScheduler;

/// Upper bound on one admin request, on-demand checks included.
const ADMIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Shared state of the admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub monitor: Arc<FleetMonitor>,
    pub scheduler: Arc<BatchScheduler>,
    pub retry: RetryPolicy,
    api_key: Arc<str>,
    started_at: Instant,
}

impl AdminState {
    pub fn new(
        monitor: Arc<FleetMonitor>,
        scheduler: Arc<BatchScheduler>,
        retry: RetryPolicy,
        api_key: &str,
    ) -> Self {
        Self {
            monitor,
            scheduler,
            retry,
            api_key: Arc::from(api_key),
            started_at: Instant::now(),
        }
    }

    pub(crate) fn authorizes(&self, header: &str) -> bool {
        header
            .strip_prefix("Bearer ")
            .is_some_and(|key| key == &*self.api_key)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/servers", get(get_servers))
        .route("/admin/servers/{name}", get(get_server))
        .route("/admin/servers/{name}/check", post(check_now).delete(cancel_checks))
        .route("/admin/checks", post(submit_checks))
        .route("/admin/metrics", get(get_metrics))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TimeoutLayer::new(ADMIN_REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
