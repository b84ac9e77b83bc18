//! Metric instrument factories for the engine.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op, so recording is
//! always safe. All instruments come from the `"academic-engine"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for engine instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("academic-engine")
}

/// Counter: jobs submitted.
/// Labels: `kind`, `result` ("scheduled" | "cache_hit" | "merged" | "rejected").
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("academic.jobs.submitted")
        .with_description("Number of jobs submitted")
        .build()
}

/// Counter: job state transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("academic.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Histogram: job execution duration in milliseconds.
/// Labels: `kind`, `outcome`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("academic.jobs.duration_ms")
        .with_description("Job execution duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: cache lookups and writes.
/// Labels: `operation` ("hit" | "miss" | "put" | "invalidate" | "clear").
pub fn cache_operations() -> Counter<u64> {
    meter()
        .u64_counter("academic.cache.operations")
        .with_description("Number of result cache operations")
        .build()
}

/// Counter: anomalies created by scans.
/// Labels: `entity_type`, `severity`.
pub fn anomalies_detected() -> Counter<u64> {
    meter()
        .u64_counter("academic.anomalies.detected")
        .with_description("Number of anomalies detected")
        .build()
}

/// Counter: predictions issued.
/// Labels: `model_type`.
pub fn predictions_issued() -> Counter<u64> {
    meter()
        .u64_counter("academic.predictions.issued")
        .with_description("Number of predictions issued")
        .build()
}

/// Counter: health checks.
/// Labels: `result` ("healthy" | "unhealthy").
pub fn health_checks() -> Counter<u64> {
    meter()
        .u64_counter("academic.health.checks")
        .with_description("Number of engine health checks")
        .build()
}
