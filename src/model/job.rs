//! Job types.
//!
//! A job is one asynchronous unit of computation. It has a kind (which
//! computation runs it), opaque parameters (which also feed the cache key),
//! and a lifecycle status owned by the queue manager.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of scheduled work tracked by the queue manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Human label shown on dashboards.
    pub name: String,
    /// Input for the computation. Opaque to the engine apart from hashing.
    pub parameters: serde_json::Value,
    pub cache_key: CacheKey,
    pub status: JobStatus,
    /// 0-100. Reaches 100 exactly when the job is terminal.
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Present only when completed.
    pub result: Option<serde_json::Value>,
    /// Present only when failed.
    pub error: Option<JobFailure>,
    pub created_by: Option<String>,
    /// Per-job execution deadline, measured from the start of execution.
    pub deadline_ms: Option<u64>,
    /// True when the result was served from the cache without executing.
    pub from_cache: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub(crate) fn new(request: &JobRequest, kind: JobKind, cache_key: CacheKey) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind,
            name: request.name.clone(),
            parameters: request.parameters.clone(),
            cache_key,
            status: JobStatus::Idle,
            progress: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            result: None,
            error: None,
            created_by: request.created_by.clone(),
            deadline_ms: request.deadline.map(|d| d.as_millis() as u64),
            from_cache: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// What sort of computation a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Calculation,
    Prediction,
    AnomalyDetection,
    Automation,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::Calculation,
        JobKind::Prediction,
        JobKind::AnomalyDetection,
        JobKind::Automation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Calculation => "calculation",
            JobKind::Prediction => "prediction",
            JobKind::AnomalyDetection => "anomaly_detection",
            JobKind::Automation => "automation",
        }
    }
}

impl AsRef<str> for JobKind {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::InvalidJobKind(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet handed to the queue.
    Idle,
    /// Waiting for a worker slot.
    Scheduled,
    /// A worker is executing the computation.
    Running,
    /// Done successfully. Terminal.
    Completed,
    /// Failed, cancelled, or timed out. Terminal.
    Failed,
}

impl JobStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Idle, Scheduled)
                | (Idle, Completed)     // served from cache
                | (Scheduled, Running)
                | (Scheduled, Failed)   // cancelled before it ran
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(JobStatus::Idle),
            "scheduled" => Ok(JobStatus::Scheduled),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Other(format!("unknown job status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

/// Why a job failed. Cancellations and timeouts are tagged apart from
/// computation errors so they don't count against the error rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Computation,
    Cancelled,
    Timeout,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Computation => "computation",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn from_error(err: &Error) -> Self {
        let kind = match err {
            Error::Cancelled(_) => FailureKind::Cancelled,
            Error::Timeout { .. } => FailureKind::Timeout,
            _ => FailureKind::Computation,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cache key
// ---------------------------------------------------------------------------

/// Deterministic identifier derived from job kind and parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    /// SHA-256 over the kind and the canonical JSON of the parameters.
    ///
    /// `serde_json::Value` objects are backed by a sorted map, so key order in
    /// the caller's input does not affect the hash.
    pub fn derive(kind: JobKind, parameters: &serde_json::Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(parameters.to_string().as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..self.0.len().min(12)])
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for submitting new jobs. The queue manager's public input type.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub(crate) kind: String,
    pub(crate) name: String,
    pub(crate) parameters: serde_json::Value,
    pub(crate) created_by: Option<String>,
    pub(crate) deadline: Option<Duration>,
}

impl JobRequest {
    /// `kind` is checked at submission, so unvalidated strings from callers
    /// are accepted here.
    pub fn new(kind: impl AsRef<str>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.as_ref().to_string(),
            name: name.into(),
            parameters: serde_json::Value::Object(Default::default()),
            created_by: None,
            deadline: None,
        }
    }

    pub fn parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn created_by(mut self, who: impl Into<String>) -> Self {
        self.created_by = Some(who.into());
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}
