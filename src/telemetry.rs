//! Metrics recorder installation and Prometheus export.
//!
//! The engine emits through the `metrics` crate macros; without a
//! recorder installed they are no-ops. Host applications call
//! [`Telemetry::install`] once at startup and mount [`Telemetry::render`]
//! wherever they serve their metrics endpoint.

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for duration metrics (milliseconds).
const DURATION_BUCKETS_MS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0,
];

/// Thin handle around the global metrics recorder.
#[derive(Clone)]
pub struct Telemetry {
    handle: PrometheusHandle,
}

impl Telemetry {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Call once at startup, before the first decision.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("_duration_milliseconds".to_string()),
                DURATION_BUCKETS_MS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "guardrail_requests_total",
            Unit::Count,
            "Requests processed, by conclusion, rule, and reason"
        );
        describe_histogram!(
            "guardrail_request_duration_milliseconds",
            Unit::Milliseconds,
            "End-to-end protect() duration"
        );
        describe_counter!(
            "guardrail_decisions_total",
            Unit::Count,
            "Decisions, by conclusion and reason"
        );
        describe_counter!(
            "guardrail_rule_evaluations_total",
            Unit::Count,
            "Rule evaluations, by rule and conclusion"
        );
        describe_histogram!(
            "guardrail_rule_duration_milliseconds",
            Unit::Milliseconds,
            "Per-rule evaluation duration"
        );
        describe_gauge!(
            "guardrail_rate_limit_remaining",
            Unit::Count,
            "Remaining budget reported by the last rate-limit evaluation"
        );
        describe_gauge!(
            "guardrail_circuit_breaker_state",
            Unit::Count,
            "Breaker state: 0 closed, 0.5 half-open, 1 open"
        );
        describe_counter!(
            "guardrail_cache_hits_total",
            Unit::Count,
            "Cache hits, by cache layer"
        );
        describe_counter!(
            "guardrail_cache_misses_total",
            Unit::Count,
            "Cache misses, by cache layer"
        );
        describe_counter!(
            "guardrail_errors_total",
            Unit::Count,
            "Internal errors, by type"
        );

        Self { handle }
    }

    /// Render the current metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Telemetry")
    }
}
