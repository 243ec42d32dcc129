//! Lightweight metrics helpers for conduit.
//!
//! This module exposes a small set of convenience functions wrapping the
//! `metrics` crate macros. It does not embed a concrete exporter (the
//! application can install any compatible recorder) while still describing the
//! conduit-specific metric names.
//!
//! Provided metrics (labels vary by family):
//! * `conduit_pool_connections_created_total` (counter, by destination)
//! * `conduit_pool_connections_reused_total` (counter, by destination)
//! * `conduit_pool_overflow_connections_total` (counter, by destination)
//! * `conduit_pool_active_connections` (gauge)
//! * `conduit_retry_attempts_total` (counter, by dependency)
//! * `conduit_circuit_rejections_total` (counter, by dependency)
//! * `conduit_circuit_state` (gauge per dependency: 0 closed, 1 half-open, 2 open)
//! * `conduit_dependency_requests_total` (counter, by dependency / outcome)
//! * `conduit_dependency_request_duration_seconds` (histogram, by dependency)
//! * `conduit_coalesced_requests_total` (counter, by dependency)
use std::time::Duration;

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const CONDUIT_POOL_CONNECTIONS_CREATED_TOTAL: &str = "conduit_pool_connections_created_total";
pub const CONDUIT_POOL_CONNECTIONS_REUSED_TOTAL: &str = "conduit_pool_connections_reused_total";
pub const CONDUIT_POOL_OVERFLOW_CONNECTIONS_TOTAL: &str = "conduit_pool_overflow_connections_total";
pub const CONDUIT_POOL_ACTIVE_CONNECTIONS: &str = "conduit_pool_active_connections";
pub const CONDUIT_RETRY_ATTEMPTS_TOTAL: &str = "conduit_retry_attempts_total";
pub const CONDUIT_CIRCUIT_REJECTIONS_TOTAL: &str = "conduit_circuit_rejections_total";
pub const CONDUIT_CIRCUIT_STATE: &str = "conduit_circuit_state";
pub const CONDUIT_DEPENDENCY_REQUESTS_TOTAL: &str = "conduit_dependency_requests_total";
pub const CONDUIT_DEPENDENCY_REQUEST_DURATION_SECONDS: &str =
    "conduit_dependency_request_duration_seconds";
pub const CONDUIT_COALESCED_REQUESTS_TOTAL: &str = "conduit_coalesced_requests_total";

/// Registers every metric description on first use.
static METRICS_INIT: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        CONDUIT_POOL_CONNECTIONS_CREATED_TOTAL,
        Unit::Count,
        "Pooled connections created, by destination."
    );
    describe_counter!(
        CONDUIT_POOL_CONNECTIONS_REUSED_TOTAL,
        Unit::Count,
        "Idle pooled connections handed out again, by destination."
    );
    describe_counter!(
        CONDUIT_POOL_OVERFLOW_CONNECTIONS_TOTAL,
        Unit::Count,
        "Unpooled overflow connections created because a limit was reached."
    );
    describe_gauge!(
        CONDUIT_POOL_ACTIVE_CONNECTIONS,
        "Pooled connections currently tracked across all destinations."
    );
    describe_counter!(
        CONDUIT_RETRY_ATTEMPTS_TOTAL,
        Unit::Count,
        "Retry attempts performed after a failed first attempt."
    );
    describe_counter!(
        CONDUIT_CIRCUIT_REJECTIONS_TOTAL,
        Unit::Count,
        "Operations rejected without an attempt because the breaker was open."
    );
    describe_gauge!(
        CONDUIT_CIRCUIT_STATE,
        "Circuit breaker state per dependency (0 closed, 1 half-open, 2 open)."
    );
    describe_counter!(
        CONDUIT_DEPENDENCY_REQUESTS_TOTAL,
        Unit::Count,
        "Completed dependency operations, by outcome."
    );
    describe_histogram!(
        CONDUIT_DEPENDENCY_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of dependency operations including retries."
    );
    describe_counter!(
        CONDUIT_COALESCED_REQUESTS_TOTAL,
        Unit::Count,
        "Requests that joined an identical in-flight computation."
    );
});

/// Record a breaker state change (0 closed, 1 half-open, 2 open).
pub fn set_circuit_state(dependency: &str, state_value: f64) {
    gauge!(CONDUIT_CIRCUIT_STATE, "dependency" => dependency.to_string()).set(state_value);
}

pub fn increment_connections_created(destination: &str) {
    counter!(CONDUIT_POOL_CONNECTIONS_CREATED_TOTAL, "destination" => destination.to_string())
        .increment(1);
}

pub fn increment_connections_reused(destination: &str) {
    counter!(CONDUIT_POOL_CONNECTIONS_REUSED_TOTAL, "destination" => destination.to_string())
        .increment(1);
}

pub fn increment_overflow_connections(destination: &str) {
    counter!(CONDUIT_POOL_OVERFLOW_CONNECTIONS_TOTAL, "destination" => destination.to_string())
        .increment(1);
}

/// Set the number of pooled connections currently tracked.
pub fn set_pool_connections(count: usize) {
    gauge!(CONDUIT_POOL_ACTIVE_CONNECTIONS).set(count as f64);
}

pub fn increment_retry_attempts(dependency: &str) {
    counter!(CONDUIT_RETRY_ATTEMPTS_TOTAL, "dependency" => dependency.to_string()).increment(1);
}

pub fn increment_circuit_rejections(dependency: &str) {
    counter!(CONDUIT_CIRCUIT_REJECTIONS_TOTAL, "dependency" => dependency.to_string())
        .increment(1);
}

pub fn increment_coalesced_requests(dependency: &str) {
    counter!(CONDUIT_COALESCED_REQUESTS_TOTAL, "dependency" => dependency.to_string())
        .increment(1);
}

/// Record one completed dependency operation.
pub fn record_dependency_request(dependency: &str, duration: Duration, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!(
        CONDUIT_DEPENDENCY_REQUESTS_TOTAL,
        "dependency" => dependency.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!(
        CONDUIT_DEPENDENCY_REQUEST_DURATION_SECONDS,
        "dependency" => dependency.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing conduit metrics descriptions");
    Lazy::force(&METRICS_INIT);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_harmless() {
        set_circuit_state("dep", 2.0);
        increment_connections_created("http://x");
        increment_retry_attempts("dep");
        record_dependency_request("dep", Duration::from_millis(5), true);
    }

    #[test]
    fn test_init_metrics() {
        assert!(init_metrics().is_ok());
        // repeated initialization is a no-op
        assert!(init_metrics().is_ok());
    }
}
