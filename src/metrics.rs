//! Admission metrics exported in Prometheus format.

use std::time::Duration;

use ::metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::{FloodgateError, Result};

pub const REQUESTS_TOTAL: &str = "floodgate_requests_total";
pub const REQUESTS_ALLOWED: &str = "floodgate_requests_allowed_total";
pub const REQUESTS_BLOCKED: &str = "floodgate_requests_blocked_total";
pub const REQUESTS_BYPASSED: &str = "floodgate_requests_bypassed_total";
pub const BAN_TRIGGERS: &str = "floodgate_ban_triggers_total";
pub const BANNED_IDENTIFIERS: &str = "floodgate_banned_identifiers";
pub const SYSTEM_LOAD: &str = "floodgate_system_load";
pub const DEGRADATION_MULTIPLIER: &str = "floodgate_degradation_multiplier";
pub const STORE_ERRORS: &str = "floodgate_store_errors_total";
pub const DECISION_DURATION: &str = "floodgate_decision_duration_seconds";

/// Install the global Prometheus recorder and return the handle that renders it.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| FloodgateError::Config(format!("failed to install metrics recorder: {}", e)))?;
    describe();
    Ok(handle)
}

fn describe() {
    describe_counter!(REQUESTS_TOTAL, "Requests seen by the admission controller");
    describe_counter!(REQUESTS_ALLOWED, "Requests admitted after evaluating limits");
    describe_counter!(REQUESTS_BLOCKED, "Requests denied");
    describe_counter!(REQUESTS_BYPASSED, "Requests admitted without evaluating limits");
    describe_counter!(BAN_TRIGGERS, "Automatic bans triggered by repeated violations");
    describe_gauge!(BANNED_IDENTIFIERS, "Identifiers currently banned");
    describe_gauge!(SYSTEM_LOAD, Unit::Percent, "Last sampled system load");
    describe_gauge!(DEGRADATION_MULTIPLIER, "Multiplier applied to configured limits");
    describe_counter!(STORE_ERRORS, "Failed counter store operations");
    describe_histogram!(DECISION_DURATION, Unit::Seconds, "Time to reach an admission decision");
}

/// Recording facade used on the request path.
///
/// Label values are bounded: classes, transports and reasons are fixed
/// strings, and endpoints are reported by matched pattern rather than raw
/// path.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmissionMetrics;

impl AdmissionMetrics {
    pub fn request(&self, class: &'static str, transport: &'static str) {
        counter!(REQUESTS_TOTAL, "class" => class, "transport" => transport).increment(1);
    }

    pub fn allowed(&self, class: &'static str, endpoint: &str) {
        counter!(REQUESTS_ALLOWED, "class" => class, "endpoint" => endpoint.to_string())
            .increment(1);
    }

    pub fn blocked(&self, class: &'static str, endpoint: &str, reason: &'static str) {
        counter!(
            REQUESTS_BLOCKED,
            "class" => class,
            "endpoint" => endpoint.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn bypassed(&self, reason: &'static str) {
        counter!(REQUESTS_BYPASSED, "reason" => reason).increment(1);
    }

    pub fn ban_triggered(&self) {
        counter!(BAN_TRIGGERS).increment(1);
    }

    pub fn banned_identifiers(&self, count: usize) {
        gauge!(BANNED_IDENTIFIERS).set(count as f64);
    }

    pub fn load(&self, load: f64, multiplier: f64) {
        gauge!(SYSTEM_LOAD).set(load);
        gauge!(DEGRADATION_MULTIPLIER).set(multiplier);
    }

    pub fn store_error(&self, operation: &'static str) {
        counter!(STORE_ERRORS, "operation" => operation).increment(1);
    }

    pub fn decision_duration(&self, elapsed: Duration) {
        histogram!(DECISION_DURATION).record(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        ::metrics::with_local_recorder(&recorder, || {
            let metrics = AdmissionMetrics;
            metrics.request("ip", "http");
            metrics.blocked("ip", "/login", "quota_exceeded");
            metrics.store_error("check");
            metrics.load(42.0, 1.0);
        });

        let rendered = handle.render();
        assert!(rendered.contains("floodgate_requests_total{class=\"ip\",transport=\"http\"} 1"));
        assert!(rendered.contains("reason=\"quota_exceeded\""));
        assert!(rendered.contains("floodgate_store_errors_total{operation=\"check\"} 1"));
        assert!(rendered.contains("floodgate_system_load 42"));
    }
}
