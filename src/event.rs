//! Job lifecycle events.
//!
//! Observers (dashboards, loggers) subscribe through
//! `ProcessingEngine::subscribe`. Delivery is best-effort: a lagging receiver
//! skips events, and nothing is sent when no one is listening.

use serde::Serialize;

use crate::model::job::{FailureKind, JobId, JobKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A new job was queued.
    Submitted { job_id: JobId, kind: JobKind },
    /// A job was completed straight from the result cache.
    CacheHit { job_id: JobId, kind: JobKind },
    /// A submission was folded into an in-flight job with the same key.
    Merged { job_id: JobId, kind: JobKind },
    Started { job_id: JobId, kind: JobKind },
    Completed {
        job_id: JobId,
        kind: JobKind,
        duration_ms: u64,
    },
    Failed {
        job_id: JobId,
        kind: JobKind,
        failure: FailureKind,
        message: String,
    },
}

impl EngineEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            EngineEvent::Submitted { job_id, .. }
            | EngineEvent::CacheHit { job_id, .. }
            | EngineEvent::Merged { job_id, .. }
            | EngineEvent::Started { job_id, .. }
            | EngineEvent::Completed { job_id, .. }
            | EngineEvent::Failed { job_id, .. } => *job_id,
        }
    }
}
