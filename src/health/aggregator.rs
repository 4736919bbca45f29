//! Result aggregation.
//!
//! # Responsibilities
//! - Combine a capability result and a REST result into one verdict
//! - Redistribute weight away from protocols that did not run
//! - Apply score method, policy flags and thresholds in a fixed order
//!
//! # Design Decisions
//! - `combine` is a pure function: same inputs, same output, no side effects
//! - A protocol that did not run (`None`) is excluded, not counted as failed
//! - Exactly one available-path value is reported, so `both`/`none` never
//!   co-occur with an individual path

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::types::{
    validate_weights, AvailablePath, DualCheckResult, HealthError, HealthResult, HealthStatus,
    Protocol, ProtocolResult, ProtocolWeights,
};

/// How per-protocol scores are folded into one health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreMethod {
    #[default]
    WeightedAverage,
    Minimum,
    Maximum,
}

/// Protocol weights and policy flags.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityConfig {
    pub capability_weight: f64,
    pub rest_weight: f64,
    pub require_both_for_healthy: bool,
    pub degraded_on_single_failure: bool,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            capability_weight: 0.6,
            rest_weight: 0.4,
            require_both_for_healthy: false,
            degraded_on_single_failure: true,
        }
    }
}

/// Validated aggregation settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AggregationConfig {
    priority: PriorityConfig,
    score_method: ScoreMethod,
    failure_threshold: f64,
    degraded_threshold: f64,
}

impl AggregationConfig {
    /// Create a config, rejecting invalid weights or threshold ordering.
    pub fn new(
        priority: PriorityConfig,
        score_method: ScoreMethod,
        failure_threshold: f64,
        degraded_threshold: f64,
    ) -> HealthResult<Self> {
        validate_weights(priority.capability_weight, priority.rest_weight)?;

        for (name, value) in [
            ("failure_threshold", failure_threshold),
            ("degraded_threshold", degraded_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(HealthError::Configuration(format!(
                    "{name} must be within [0, 1] (got {value})"
                )));
            }
        }
        if failure_threshold >= degraded_threshold {
            return Err(HealthError::Configuration(format!(
                "failure_threshold ({failure_threshold}) must be below degraded_threshold ({degraded_threshold})"
            )));
        }

        Ok(Self {
            priority,
            score_method,
            failure_threshold,
            degraded_threshold,
        })
    }

    /// Same policy with a server's own protocol weights.
    pub fn with_weights(&self, weights: ProtocolWeights) -> Self {
        let mut config = *self;
        config.priority.capability_weight = weights.capability();
        config.priority.rest_weight = weights.rest();
        config
    }

    pub fn priority(&self) -> &PriorityConfig {
        &self.priority
    }

    pub fn score_method(&self) -> ScoreMethod {
        self.score_method
    }

    pub fn failure_threshold(&self) -> f64 {
        self.failure_threshold
    }

    pub fn degraded_threshold(&self) -> f64 {
        self.degraded_threshold
    }

    fn weight(&self, protocol: Protocol) -> f64 {
        match protocol {
            Protocol::Capability => self.priority.capability_weight,
            Protocol::Rest => self.priority.rest_weight,
        }
    }

    fn threshold_status(&self, score: f64) -> HealthStatus {
        if score < self.failure_threshold {
            HealthStatus::Unhealthy
        } else if score < self.degraded_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            priority: PriorityConfig::default(),
            score_method: ScoreMethod::WeightedAverage,
            failure_threshold: 0.5,
            degraded_threshold: 0.7,
        }
    }
}

/// Combine the two protocol outcomes into one [`DualCheckResult`].
///
/// The result is stamped with the latest probe timestamp, so equal inputs
/// always give equal output. With no probes it carries the Unix epoch.
pub fn combine(
    capability: Option<&ProtocolResult>,
    rest: Option<&ProtocolResult>,
    config: &AggregationConfig,
) -> DualCheckResult {
    let server_name = capability
        .or(rest)
        .map(|r| r.server_name.clone())
        .unwrap_or_default();

    let ran: Vec<&ProtocolResult> = [capability, rest].into_iter().flatten().collect();

    if ran.is_empty() {
        return DualCheckResult {
            server_name,
            timestamp: DateTime::<Utc>::default(),
            overall_status: HealthStatus::Unknown,
            overall_success: false,
            capability_result: None,
            rest_result: None,
            combined_response_time_ms: 0.0,
            health_score: 0.0,
            available_paths: vec![AvailablePath::None],
            error: None,
        };
    }

    let score = health_score(&ran, config);
    let status = decide_status(&ran, score, config);
    let combined_response_time_ms =
        ran.iter().map(|r| r.response_time_ms).sum::<f64>() / ran.len() as f64;
    let timestamp = ran.iter().map(|r| r.timestamp).max().unwrap_or_default();

    DualCheckResult {
        server_name,
        timestamp,
        overall_status: status,
        overall_success: status == HealthStatus::Healthy,
        capability_result: capability.cloned(),
        rest_result: rest.cloned(),
        combined_response_time_ms,
        health_score: score,
        available_paths: vec![available_path(capability, rest)],
        error: None,
    }
}

fn available_path(
    capability: Option<&ProtocolResult>,
    rest: Option<&ProtocolResult>,
) -> AvailablePath {
    let cap_ok = capability.is_some_and(|r| r.success);
    let rest_ok = rest.is_some_and(|r| r.success);
    match (cap_ok, rest_ok) {
        (true, true) => AvailablePath::Both,
        (true, false) => AvailablePath::Capability,
        (false, true) => AvailablePath::Rest,
        (false, false) => AvailablePath::None,
    }
}

fn protocol_score(result: &ProtocolResult) -> f64 {
    if result.success {
        1.0
    } else {
        0.0
    }
}

fn health_score(ran: &[&ProtocolResult], config: &AggregationConfig) -> f64 {
    let score = match config.score_method {
        ScoreMethod::WeightedAverage => {
            let total: f64 = ran.iter().map(|r| config.weight(r.protocol)).sum();
            if total > 0.0 {
                ran.iter()
                    .map(|r| config.weight(r.protocol) / total * protocol_score(r))
                    .sum()
            } else {
                // All enabled weights are zero: split evenly.
                ran.iter().map(|r| protocol_score(r)).sum::<f64>() / ran.len() as f64
            }
        }
        ScoreMethod::Minimum => ran
            .iter()
            .map(|r| protocol_score(r))
            .fold(f64::INFINITY, f64::min),
        ScoreMethod::Maximum => ran
            .iter()
            .map(|r| protocol_score(r))
            .fold(f64::NEG_INFINITY, f64::max),
    };
    score.clamp(0.0, 1.0)
}

fn decide_status(ran: &[&ProtocolResult], score: f64, config: &AggregationConfig) -> HealthStatus {
    let failed = ran.iter().filter(|r| !r.success).count();
    let by_threshold = config.threshold_status(score);

    if config.priority.require_both_for_healthy && failed > 0 {
        return match by_threshold {
            HealthStatus::Healthy => HealthStatus::Degraded,
            other => other,
        };
    }
    if config.priority.degraded_on_single_failure && ran.len() == 2 && failed == 1 {
        return HealthStatus::Degraded;
    }
    by_threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::types::{ErrorKind, ProbeError, ProtocolPayload};
    use proptest::prelude::*;

    fn ok(protocol: Protocol, ms: f64) -> ProtocolResult {
        ProtocolResult::success("srv", protocol, ms, ProtocolPayload::Empty)
    }

    fn failed(protocol: Protocol, ms: f64) -> ProtocolResult {
        ProtocolResult::failure(
            "srv",
            protocol,
            ms,
            ProbeError::new(ErrorKind::Connection, "refused"),
        )
    }

    fn config(
        require_both: bool,
        degraded_on_single: bool,
        method: ScoreMethod,
    ) -> AggregationConfig {
        AggregationConfig::new(
            PriorityConfig {
                capability_weight: 0.6,
                rest_weight: 0.4,
                require_both_for_healthy: require_both,
                degraded_on_single_failure: degraded_on_single,
            },
            method,
            0.5,
            0.7,
        )
        .unwrap()
    }

    #[test]
    fn test_both_healthy() {
        let cap = ok(Protocol::Capability, 50.0);
        let rest = ok(Protocol::Rest, 40.0);
        let cfg = config(false, true, ScoreMethod::WeightedAverage);
        let result = combine(Some(&cap), Some(&rest), &cfg);

        assert_eq!(result.server_name, "srv");
        assert!((result.health_score - 1.0).abs() < 1e-9);
        assert_eq!(result.overall_status, HealthStatus::Healthy);
        assert!(result.overall_success);
        assert_eq!(result.available_paths, vec![AvailablePath::Both]);
        assert!((result.combined_response_time_ms - 45.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_failure_forces_degraded() {
        let cap = ok(Protocol::Capability, 50.0);
        let rest = failed(Protocol::Rest, 40.0);
        let cfg = config(false, true, ScoreMethod::WeightedAverage);
        let result = combine(Some(&cap), Some(&rest), &cfg);

        assert!((result.health_score - 0.6).abs() < 1e-9);
        assert_eq!(result.overall_status, HealthStatus::Degraded);
        assert!(!result.overall_success);
        assert_eq!(result.available_paths, vec![AvailablePath::Capability]);
    }

    #[test]
    fn test_single_failure_without_flag_uses_thresholds() {
        // REST alone carries 0.4 < failure threshold.
        let cap = failed(Protocol::Capability, 10.0);
        let rest = ok(Protocol::Rest, 10.0);
        let cfg = config(false, false, ScoreMethod::WeightedAverage);
        let result = combine(Some(&cap), Some(&rest), &cfg);

        assert!((result.health_score - 0.4).abs() < 1e-9);
        assert_eq!(result.overall_status, HealthStatus::Unhealthy);
        assert_eq!(result.available_paths, vec![AvailablePath::Rest]);
    }

    #[test]
    fn test_require_both_caps_at_degraded() {
        let cap = ok(Protocol::Capability, 10.0);
        let rest = failed(Protocol::Rest, 10.0);
        let result = combine(Some(&cap), Some(&rest), &config(true, false, ScoreMethod::Maximum));

        assert!((result.health_score - 1.0).abs() < 1e-9);
        assert_eq!(result.overall_status, HealthStatus::Degraded);
    }

    #[test]
    fn test_disabled_protocol_weight_is_redistributed() {
        let rest = ok(Protocol::Rest, 30.0);
        let result = combine(None, Some(&rest), &config(true, true, ScoreMethod::WeightedAverage));

        assert!((result.health_score - 1.0).abs() < 1e-9);
        assert_eq!(result.overall_status, HealthStatus::Healthy);
        assert!(result.capability_result.is_none());
        assert_eq!(result.available_paths, vec![AvailablePath::Rest]);
        assert!((result.combined_response_time_ms - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_weight_protocol_alone_is_split_evenly() {
        let cfg = AggregationConfig::new(
            PriorityConfig {
                capability_weight: 1.0,
                rest_weight: 0.0,
                require_both_for_healthy: false,
                degraded_on_single_failure: false,
            },
            ScoreMethod::WeightedAverage,
            0.5,
            0.7,
        )
        .unwrap();
        let rest = ok(Protocol::Rest, 5.0);
        let result = combine(None, Some(&rest), &cfg);
        assert!((result.health_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_minimum_method() {
        let cap = ok(Protocol::Capability, 10.0);
        let rest = failed(Protocol::Rest, 20.0);
        let result = combine(Some(&cap), Some(&rest), &config(false, false, ScoreMethod::Minimum));
        assert_eq!(result.health_score, 0.0);
        assert_eq!(result.overall_status, HealthStatus::Unhealthy);
        assert!((result.combined_response_time_ms - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_nothing_ran_is_unknown() {
        let result = combine(None, None, &AggregationConfig::default());
        assert_eq!(result.overall_status, HealthStatus::Unknown);
        assert_eq!(result.available_paths, vec![AvailablePath::None]);
        assert_eq!(result.combined_response_time_ms, 0.0);
        assert!(!result.overall_success);
        assert_eq!(result.timestamp, DateTime::<Utc>::default());
    }

    #[test]
    fn test_timestamp_follows_latest_probe() {
        let mut cap = ok(Protocol::Capability, 50.0);
        let mut rest = ok(Protocol::Rest, 40.0);
        cap.timestamp = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        rest.timestamp = DateTime::from_timestamp(1_700_000_002, 0).unwrap();
        let cfg = AggregationConfig::default();

        let first = combine(Some(&cap), Some(&rest), &cfg);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = combine(Some(&cap), Some(&rest), &cfg);

        assert_eq!(first.timestamp, rest.timestamp);
        assert_eq!(first, second);
    }

    #[test]
    fn test_config_rejects_bad_thresholds() {
        let priority = PriorityConfig::default();
        let err = AggregationConfig::new(priority, ScoreMethod::WeightedAverage, 0.7, 0.7)
            .unwrap_err();
        assert!(matches!(err, HealthError::Configuration(_)));
        assert!(AggregationConfig::new(priority, ScoreMethod::Minimum, 0.8, 0.5).is_err());
        assert!(AggregationConfig::new(priority, ScoreMethod::Minimum, 0.1, 1.5).is_err());
    }

    #[test]
    fn test_config_rejects_bad_weights() {
        let priority = PriorityConfig {
            capability_weight: 0.5,
            rest_weight: 0.6,
            ..PriorityConfig::default()
        };
        assert!(AggregationConfig::new(priority, ScoreMethod::WeightedAverage, 0.5, 0.7).is_err());
    }

    fn arb_result(protocol: Protocol) -> impl Strategy<Value = Option<ProtocolResult>> {
        proptest::option::of((any::<bool>(), 0.0f64..5_000.0).prop_map(move |(success, ms)| {
            if success {
                ok(protocol, ms)
            } else {
                failed(protocol, ms)
            }
        }))
    }

    fn arb_config() -> impl Strategy<Value = AggregationConfig> {
        (
            0.0f64..=1.0,
            any::<bool>(),
            any::<bool>(),
            prop_oneof![
                Just(ScoreMethod::WeightedAverage),
                Just(ScoreMethod::Minimum),
                Just(ScoreMethod::Maximum)
            ],
            0.0f64..0.5,
            0.5f64..=1.0,
        )
            .prop_filter_map("thresholds must be ordered", |(w, rb, ds, m, f, d)| {
                AggregationConfig::new(
                    PriorityConfig {
                        capability_weight: w,
                        rest_weight: 1.0 - w,
                        require_both_for_healthy: rb,
                        degraded_on_single_failure: ds,
                    },
                    m,
                    f,
                    d,
                )
                .ok()
            })
    }

    proptest! {
        #[test]
        fn prop_combine_is_deterministic(
            cap in arb_result(Protocol::Capability),
            rest in arb_result(Protocol::Rest),
            cfg in arb_config(),
        ) {
            let a = combine(cap.as_ref(), rest.as_ref(), &cfg);
            let b = combine(cap.as_ref(), rest.as_ref(), &cfg);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_paths_are_exclusive_and_score_bounded(
            cap in arb_result(Protocol::Capability),
            rest in arb_result(Protocol::Rest),
            cfg in arb_config(),
        ) {
            let result = combine(cap.as_ref(), rest.as_ref(), &cfg);
            prop_assert!((0.0..=1.0).contains(&result.health_score));
            prop_assert_eq!(result.available_paths.len(), 1);
            prop_assert_eq!(result.overall_success, result.overall_status == HealthStatus::Healthy);
        }
    }
}
