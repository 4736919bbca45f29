//! Probe client interface.

use async_trait::async_trait;
use tokio::time::Instant;

use crate::health::types::{ErrorKind, ProbeError, Protocol, ProtocolResult, ServerTarget};
use crate::resources::pool::PoolLease;

/// Performs one probe of one protocol against one server.
#[async_trait]
pub trait ProbeClient: Send + Sync {
    /// The protocol this client speaks.
    fn protocol(&self) -> Protocol;

    /// Probe `target` over a leased pool client. Failures are returned as
    /// data inside the [`ProtocolResult`].
    async fn invoke(
        &self,
        target: &ServerTarget,
        lease: &PoolLease,
        token: Option<&str>,
    ) -> ProtocolResult;
}

/// Classify a transport error. Body/decode problems count as protocol errors
/// for the capability protocol and HTTP errors for REST.
pub fn classify_reqwest_error(err: &reqwest::Error, protocol: Protocol) -> ProbeError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_connect() {
        ErrorKind::Connection
    } else if err.is_status() {
        ErrorKind::Http
    } else if err.is_decode() || err.is_body() {
        match protocol {
            Protocol::Capability => ErrorKind::Protocol,
            Protocol::Rest => ErrorKind::Http,
        }
    } else {
        ErrorKind::Connection
    };
    ProbeError::new(kind, err.to_string())
}

pub(crate) fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
