//! Job execution span helpers.
//!
//! Provides span creation and state-transition recording for jobs flowing
//! through the queue manager.

use tracing::Span;

use crate::model::job::{JobId, JobKind};

/// Start a span for job execution.
///
/// The `job.status` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_job_span(kind: JobKind, job_id: &JobId) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.kind" = %kind,
        "job.id" = %job_id.0,
        "job.status" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
