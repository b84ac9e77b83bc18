//! Per-job execution.
//!
//! The computation runs on its own task so the worker can walk away from it:
//! on cancellation or deadline the task is aborted at its next await point,
//! and whatever it would have returned is dropped.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug};

use crate::error::{Error, Result};
use crate::model::job::Job;
use crate::telemetry::job::{record_state_transition, start_job_span};

use super::computation::JobContext;
use super::queue::JobQueue;

pub(crate) fn spawn(queue: JobQueue, job: Job, cancel: CancellationToken) {
    tokio::spawn(run(queue, job, cancel));
}

async fn run(queue: JobQueue, job: Job, cancel: CancellationToken) {
    let span = start_job_span(job.kind, &job.id);
    record_state_transition(&span, "scheduled", "running");

    let outcome = execute(&queue, &job, cancel).instrument(span.clone()).await;
    queue.finish(job.id, outcome, &span);
}

async fn execute(
    queue: &JobQueue,
    job: &Job,
    cancel: CancellationToken,
) -> Result<serde_json::Value> {
    let computation = queue
        .computation(job.kind)
        .ok_or_else(|| Error::InvalidJobKind(job.kind.to_string()))?;

    let ctx = JobContext::attached(
        job.id,
        job.kind,
        job.parameters.clone(),
        Arc::downgrade(queue.shared()),
        cancel.clone(),
    );
    let mut task = tokio::spawn(async move { computation.execute(ctx).await }.in_current_span());

    let deadline = job.deadline();
    let expired = async {
        match deadline {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            task.abort();
            debug!(job_id = %job.id, "computation cancelled");
            Err(Error::Cancelled(job.id))
        }
        _ = expired => {
            cancel.cancel();
            task.abort();
            let after_ms = deadline.map(|d| d.as_millis() as u64).unwrap_or_default();
            debug!(job_id = %job.id, after_ms, "computation timed out");
            Err(Error::Timeout { job_id: job.id, after_ms })
        }
        joined = &mut task => match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::computation(e)),
            Err(e) if e.is_panic() => Err(Error::Computation(format!("computation panicked: {e}"))),
            Err(e) => Err(Error::Computation(format!("computation aborted: {e}"))),
        },
    }
}
