//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from config files, and
//! each section converts into the validated domain type it configures.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::health::aggregator::{AggregationConfig, PriorityConfig, ScoreMethod};
use crate::health::orchestrator::OrchestratorConfig;
use crate::health::types::{
    CapabilityEndpoint, HealthError, HealthResult, ProtocolWeights, RestEndpoint, ServerTarget,
};
use crate::resilience::circuit_breaker::BreakerConfig;
use crate::resilience::retries::RetryPolicy;
use crate::resources::admission::ResourceLimits;
use crate::resources::cache::{CacheCategory, CacheConfig, CategoryConfig};
use crate::resources::pool::PoolConfig;
use crate::scheduler::batch::BatchConfig;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// Concurrency and scheduling of checks.
    pub engine: EngineConfig,

    /// Score and status policy.
    pub aggregation: AggregationSettings,

    /// Whole-check retry policy.
    pub retry: RetryConfig,

    /// Outbound connection pools.
    pub pools: PoolsConfig,

    /// Cache TTLs and bounds.
    pub cache: CacheSettings,

    /// Admission control ceilings.
    pub resources: ResourcesConfig,

    /// Request batching.
    pub batch: BatchSettings,

    /// Circuit breaker thresholds.
    pub breaker: BreakerSettings,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,

    /// Servers to check.
    pub servers: Vec<ServerConfig>,
}

impl HealthConfig {
    /// Build validated targets for every configured server.
    pub fn server_targets(&self) -> HealthResult<Vec<ServerTarget>> {
        self.servers.iter().map(ServerConfig::to_target).collect()
    }

    pub fn aggregation_config(&self) -> HealthResult<AggregationConfig> {
        let a = &self.aggregation;
        AggregationConfig::new(
            PriorityConfig {
                capability_weight: a.capability_weight,
                rest_weight: a.rest_weight,
                require_both_for_healthy: a.require_both_for_healthy,
                degraded_on_single_failure: a.degraded_on_single_failure,
            },
            a.score_method,
            a.failure_threshold,
            a.degraded_threshold,
        )
    }

    pub fn orchestrator_config(&self) -> HealthResult<OrchestratorConfig> {
        let config = OrchestratorConfig {
            dispatch_concurrency: self.engine.dispatch_concurrency,
            fleet_concurrency: self.engine.fleet_concurrency,
            timeout_buffer: Duration::from_millis(self.engine.timeout_buffer_ms),
            queue_wait_timeout: Duration::from_millis(self.engine.queue_wait_timeout_ms),
            aggregation: self.aggregation_config()?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn retry_policy(&self) -> HealthResult<RetryPolicy> {
        RetryPolicy::new(
            self.retry.max_retries,
            self.retry.backoff_factor,
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    pub fn cache_config(&self) -> CacheConfig {
        let c = &self.cache;
        let categories = HashMap::from([
            (CacheCategory::Configuration, c.configuration.to_category()),
            (CacheCategory::AuthTokens, c.auth_tokens.to_category()),
            (CacheCategory::Dns, c.dns.to_category()),
            (CacheCategory::CheckResults, c.check_results.to_category()),
        ]);
        CacheConfig {
            categories,
            sweep_interval: Duration::from_secs(c.sweep_interval_secs),
        }
    }

    pub fn resource_limits(&self) -> HealthResult<ResourceLimits> {
        let r = &self.resources;
        ResourceLimits::new(
            r.max_concurrent_checks,
            r.max_queue_size,
            r.max_memory_percent,
            r.max_cpu_percent,
            Duration::from_millis(r.sample_interval_ms),
        )
    }

    pub fn batch_config(&self) -> HealthResult<BatchConfig> {
        BatchConfig::new(
            self.batch.max_batch_size,
            Duration::from_millis(self.batch.flush_timeout_ms),
            Duration::from_millis(self.batch.flush_interval_ms),
        )
    }

    pub fn breaker_config(&self) -> HealthResult<BreakerConfig> {
        BreakerConfig::new(
            self.breaker.failure_threshold,
            Duration::from_secs(self.breaker.recovery_secs),
        )
    }
}

/// Engine concurrency settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Dual dispatches in flight at once.
    pub dispatch_concurrency: usize,

    /// Servers checked in parallel per fleet pass.
    pub fleet_concurrency: usize,

    /// Added to the slowest protocol timeout to form the check deadline.
    pub timeout_buffer_ms: u64,

    /// Fleet monitor period.
    pub check_interval_secs: u64,

    /// How long a rejected check may wait in the admission queue.
    pub queue_wait_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_concurrency: 10,
            fleet_concurrency: 20,
            timeout_buffer_ms: 5_000,
            check_interval_secs: 30,
            queue_wait_timeout_ms: 30_000,
        }
    }
}

/// Aggregation policy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AggregationSettings {
    pub capability_weight: f64,
    pub rest_weight: f64,
    pub require_both_for_healthy: bool,
    pub degraded_on_single_failure: bool,
    pub score_method: ScoreMethod,
    pub failure_threshold: f64,
    pub degraded_threshold: f64,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            capability_weight: 0.6,
            rest_weight: 0.4,
            require_both_for_healthy: false,
            degraded_on_single_failure: true,
            score_method: ScoreMethod::WeightedAverage,
            failure_threshold: 0.5,
            degraded_threshold: 0.7,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per check (at least one is always made).
    pub max_retries: u32,

    /// Sleep `backoff_factor^attempt` seconds between attempts.
    pub backoff_factor: f64,

    /// Upper bound on one sleep.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

/// Connection pool settings for both protocols.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PoolsConfig {
    pub sweep_interval_secs: u64,
    pub capability: PoolSettings,
    pub rest: PoolSettings,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            capability: PoolSettings::default(),
            rest: PoolSettings::default(),
        }
    }
}

/// One protocol's pool limits.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub max_connections_per_host: usize,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub keepalive_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_connections_per_host: 10,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 30_000,
            keepalive_secs: 30,
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            max_connections_per_host: self.max_connections_per_host,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            keepalive: Duration::from_secs(self.keepalive_secs),
        }
    }
}

/// Cache settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    pub sweep_interval_secs: u64,
    pub configuration: CategorySettings,
    pub auth_tokens: CategorySettings,
    pub dns: CategorySettings,
    pub check_results: CategorySettings,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            configuration: CategorySettings { ttl_secs: 300, max_entries: 100 },
            auth_tokens: CategorySettings { ttl_secs: 3_000, max_entries: 1_000 },
            dns: CategorySettings { ttl_secs: 300, max_entries: 1_000 },
            check_results: CategorySettings { ttl_secs: 60, max_entries: 1_000 },
        }
    }
}

/// TTL and bound of one cache category.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct CategorySettings {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl CategorySettings {
    fn to_category(self) -> CategoryConfig {
        CategoryConfig {
            ttl: Duration::from_secs(self.ttl_secs),
            max_entries: self.max_entries,
        }
    }
}

/// Admission control settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ResourcesConfig {
    pub max_concurrent_checks: usize,
    pub max_queue_size: usize,
    pub max_memory_percent: f64,
    pub max_cpu_percent: f64,
    pub sample_interval_ms: u64,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            max_concurrent_checks: 100,
            max_queue_size: 1_000,
            max_memory_percent: 85.0,
            max_cpu_percent: 90.0,
            sample_interval_ms: 5_000,
        }
    }
}

/// Batching settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BatchSettings {
    pub max_batch_size: usize,
    pub flush_timeout_ms: u64,
    pub flush_interval_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            flush_timeout_ms: 1_000,
            flush_interval_ms: 100,
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures before a breaker trips.
    pub failure_threshold: u32,

    /// Seconds before an open breaker is probed again.
    pub recovery_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_secs: 30,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // Placeholder; validation rejects it when the API is enabled.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// One server to check.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServerConfig {
    /// Unique server name.
    pub name: String,

    /// Admission queue priority (higher first).
    #[serde(default)]
    pub priority: u32,

    #[serde(default = "default_capability_weight")]
    pub capability_weight: f64,

    #[serde(default = "default_rest_weight")]
    pub rest_weight: f64,

    /// Environment variable holding the bearer token.
    #[serde(default)]
    pub auth_token_env: Option<String>,

    pub capability: CapabilitySettings,

    pub rest: RestSettings,
}

fn default_capability_weight() -> f64 {
    0.6
}

fn default_rest_weight() -> f64 {
    0.4
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    10_000
}

/// Capability-protocol settings of a server.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CapabilitySettings {
    pub endpoint: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub retries: u32,

    #[serde(default)]
    pub expected_capabilities: Vec<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// REST-protocol settings of a server.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RestSettings {
    pub endpoint: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub retries: u32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ServerConfig {
    pub fn to_target(&self) -> HealthResult<ServerTarget> {
        let parse = |raw: &str| {
            Url::parse(raw).map_err(|e| {
                HealthError::Configuration(format!("server '{}' endpoint '{raw}': {e}", self.name))
            })
        };

        let capability = CapabilityEndpoint {
            endpoint: parse(&self.capability.endpoint)?,
            timeout: Duration::from_millis(self.capability.timeout_ms),
            retries: self.capability.retries,
            expected_capabilities: self.capability.expected_capabilities.clone(),
            enabled: self.capability.enabled,
        };
        let rest = RestEndpoint {
            endpoint: parse(&self.rest.endpoint)?,
            timeout: Duration::from_millis(self.rest.timeout_ms),
            retries: self.rest.retries,
            enabled: self.rest.enabled,
        };
        let weights = ProtocolWeights::new(self.capability_weight, self.rest_weight)?;

        let target = ServerTarget::new(self.name.clone(), capability, rest, weights)?
            .with_priority(self.priority);
        Ok(match &self.auth_token_env {
            Some(var) => target.with_auth_token_env(var.clone()),
            None => target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [engine]
        dispatch_concurrency = 4
        fleet_concurrency = 8

        [aggregation]
        score_method = "minimum"

        [[servers]]
        name = "search"
        priority = 5
        capability_weight = 0.7
        rest_weight = 0.3
        capability = { endpoint = "http://127.0.0.1:9000/mcp", expected_capabilities = ["search"] }
        rest = { endpoint = "http://127.0.0.1:9000/health", timeout_ms = 2000 }
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: HealthConfig = toml::from_str("").unwrap();
        assert_eq!(config, HealthConfig::default());
        assert!(config.orchestrator_config().is_ok());
        assert!(config.resource_limits().is_ok());
        assert!(config.batch_config().is_ok());
    }

    #[test]
    fn test_sample_converts_to_domain_types() {
        let config: HealthConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.engine.dispatch_concurrency, 4);
        assert_eq!(config.engine.timeout_buffer_ms, 5_000);
        assert_eq!(config.aggregation_config().unwrap().score_method(), ScoreMethod::Minimum);

        let targets = config.server_targets().unwrap();
        assert_eq!(targets.len(), 1);
        let t = &targets[0];
        assert_eq!(t.name(), "search");
        assert_eq!(t.priority(), 5);
        assert_eq!(t.weights().capability(), 0.7);
        assert_eq!(t.timeout(crate::health::types::Protocol::Rest), Duration::from_secs(2));
        assert_eq!(t.capability().expected_capabilities, vec!["search".to_string()]);
        assert!(t.capability().enabled);
    }

    #[test]
    fn test_bad_weights_rejected() {
        let mut config: HealthConfig = toml::from_str(SAMPLE).unwrap();
        config.servers[0].rest_weight = 0.5;
        assert!(matches!(config.server_targets(), Err(HealthError::Configuration(_))));
    }
}
