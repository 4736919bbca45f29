//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check uniqueness (server names)
//! - Validate value ranges (weights, thresholds, timeouts, limits > 0)
//! - Check endpoint URLs parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: HealthConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use url::Url;

use crate::config::schema::{HealthConfig, PoolSettings};
use crate::health::types::WEIGHT_EPSILON;

/// One semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field, e.g. `servers[search].rest.endpoint`.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn check_weights(errors: &mut Vec<ValidationError>, field: &str, capability: f64, rest: f64) {
    if !(0.0..=1.0).contains(&capability) || !(0.0..=1.0).contains(&rest) {
        errors.push(ValidationError::new(field, "weights must be within [0, 1]"));
    } else if (capability + rest - 1.0).abs() > WEIGHT_EPSILON {
        errors.push(ValidationError::new(
            field,
            format!("weights must sum to 1.0 (got {:.4})", capability + rest),
        ));
    }
}

fn check_positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::new(field, "must be > 0"));
    }
}

fn check_pool(errors: &mut Vec<ValidationError>, prefix: &str, pool: &PoolSettings) {
    check_positive(errors, &format!("{prefix}.max_connections"), pool.max_connections as u64);
    if pool.max_connections_per_host == 0 || pool.max_connections_per_host > pool.max_connections {
        errors.push(ValidationError::new(
            format!("{prefix}.max_connections_per_host"),
            "must be within 1..=max_connections",
        ));
    }
    check_positive(errors, &format!("{prefix}.connect_timeout_ms"), pool.connect_timeout_ms);
    check_positive(errors, &format!("{prefix}.read_timeout_ms"), pool.read_timeout_ms);
}

fn check_endpoint(errors: &mut Vec<ValidationError>, field: String, raw: &str) {
    match Url::parse(raw) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
        Ok(url) => errors.push(ValidationError::new(
            field,
            format!("unsupported scheme '{}'", url.scheme()),
        )),
        Err(e) => errors.push(ValidationError::new(field, format!("invalid URL '{raw}': {e}"))),
    }
}

/// Validate a parsed configuration, collecting every problem found.
pub fn validate_config(config: &HealthConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let engine = &config.engine;
    check_positive(&mut errors, "engine.dispatch_concurrency", engine.dispatch_concurrency as u64);
    check_positive(&mut errors, "engine.fleet_concurrency", engine.fleet_concurrency as u64);
    check_positive(&mut errors, "engine.check_interval_secs", engine.check_interval_secs);

    let agg = &config.aggregation;
    check_weights(&mut errors, "aggregation", agg.capability_weight, agg.rest_weight);
    for (field, value) in [
        ("aggregation.failure_threshold", agg.failure_threshold),
        ("aggregation.degraded_threshold", agg.degraded_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            errors.push(ValidationError::new(field, "must be within [0, 1]"));
        }
    }
    if agg.failure_threshold >= agg.degraded_threshold {
        errors.push(ValidationError::new(
            "aggregation.failure_threshold",
            "must be below degraded_threshold",
        ));
    }

    if !(config.retry.backoff_factor.is_finite() && config.retry.backoff_factor > 0.0) {
        errors.push(ValidationError::new("retry.backoff_factor", "must be a positive number"));
    }

    check_positive(&mut errors, "pools.sweep_interval_secs", config.pools.sweep_interval_secs);
    check_pool(&mut errors, "pools.capability", &config.pools.capability);
    check_pool(&mut errors, "pools.rest", &config.pools.rest);

    check_positive(&mut errors, "cache.sweep_interval_secs", config.cache.sweep_interval_secs);
    for (name, category) in [
        ("configuration", &config.cache.configuration),
        ("auth_tokens", &config.cache.auth_tokens),
        ("dns", &config.cache.dns),
        ("check_results", &config.cache.check_results),
    ] {
        check_positive(&mut errors, &format!("cache.{name}.ttl_secs"), category.ttl_secs);
        check_positive(
            &mut errors,
            &format!("cache.{name}.max_entries"),
            category.max_entries as u64,
        );
    }

    let res = &config.resources;
    check_positive(
        &mut errors,
        "resources.max_concurrent_checks",
        res.max_concurrent_checks as u64,
    );
    check_positive(&mut errors, "resources.sample_interval_ms", res.sample_interval_ms);
    for (field, value) in [
        ("resources.max_memory_percent", res.max_memory_percent),
        ("resources.max_cpu_percent", res.max_cpu_percent),
    ] {
        if !(value > 0.0 && value <= 100.0) {
            errors.push(ValidationError::new(field, "must be within (0, 100]"));
        }
    }

    check_positive(&mut errors, "batch.max_batch_size", config.batch.max_batch_size as u64);
    check_positive(&mut errors, "batch.flush_interval_ms", config.batch.flush_interval_ms);
    check_positive(
        &mut errors,
        "breaker.failure_threshold",
        config.breaker.failure_threshold as u64,
    );

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new("observability.metrics_address", "not a socket address"));
    }
    if config.admin.enabled {
        if config.admin.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new("admin.bind_address", "not a socket address"));
        }
        if config.admin.api_key.is_empty() || config.admin.api_key == "CHANGE_ME_IN_PRODUCTION" {
            errors.push(ValidationError::new(
                "admin.api_key",
                "must be set when the admin API is enabled",
            ));
        }
    }

    let mut names = HashSet::new();
    for server in &config.servers {
        let prefix = format!("servers[{}]", server.name);
        if server.name.trim().is_empty() {
            errors.push(ValidationError::new("servers", "server name must not be empty"));
        } else if !names.insert(server.name.as_str()) {
            errors.push(ValidationError::new(prefix.clone(), "duplicate server name"));
        }
        check_weights(&mut errors, &prefix, server.capability_weight, server.rest_weight);
        if !server.capability.enabled && !server.rest.enabled {
            errors.push(ValidationError::new(
                prefix.clone(),
                "at least one protocol must be enabled",
            ));
        }
        check_endpoint(
            &mut errors,
            format!("{prefix}.capability.endpoint"),
            &server.capability.endpoint,
        );
        check_endpoint(&mut errors, format!("{prefix}.rest.endpoint"), &server.rest.endpoint);
        check_positive(
            &mut errors,
            &format!("{prefix}.capability.timeout_ms"),
            server.capability.timeout_ms,
        );
        check_positive(&mut errors, &format!("{prefix}.rest.timeout_ms"), server.rest.timeout_ms);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
