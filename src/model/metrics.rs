//! Execution records and the metrics derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{FailureKind, JobId, JobKind};

/// Outcome of one job execution as seen by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Failure,
    /// Infrastructure-level aborts. Logged, but kept out of the rates.
    Cancelled,
    TimedOut,
}

impl ExecutionOutcome {
    pub fn from_failure(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Computation => ExecutionOutcome::Failure,
            FailureKind::Cancelled => ExecutionOutcome::Cancelled,
            FailureKind::Timeout => ExecutionOutcome::TimedOut,
        }
    }

    pub fn is_abort(self) -> bool {
        matches!(self, ExecutionOutcome::Cancelled | ExecutionOutcome::TimedOut)
    }
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionOutcome::Success => "success",
            ExecutionOutcome::Failure => "failure",
            ExecutionOutcome::Cancelled => "cancelled",
            ExecutionOutcome::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Append-only entry in the monitor's sliding window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub job_id: JobId,
    pub kind: JobKind,
    pub outcome: ExecutionOutcome,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl ExecutionRecord {
    pub fn success(job_id: JobId, kind: JobKind, duration_ms: u64) -> Self {
        Self {
            job_id,
            kind,
            outcome: ExecutionOutcome::Success,
            duration_ms,
            timestamp: Utc::now(),
            error_message: None,
        }
    }

    pub fn failed(
        job_id: JobId,
        kind: JobKind,
        failure: FailureKind,
        duration_ms: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            kind,
            outcome: ExecutionOutcome::from_failure(failure),
            duration_ms,
            timestamp: Utc::now(),
            error_message: Some(message.into()),
        }
    }
}

/// Entry in the bounded error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub job_id: JobId,
    pub kind: JobKind,
    pub outcome: ExecutionOutcome,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of the queue. Every tracked job is in at most one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Jobs waiting for a worker slot.
    pub pending: usize,
    pub running: usize,
    /// All tracked jobs, terminal ones included.
    pub total: usize,
}

/// Monotonic cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl CacheStats {
    /// Percentage of lookups served from the cache; 0 with no lookups.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 * 100.0 / lookups as f64
        }
    }
}

/// Derived metrics over the monitor's window. Rates are percentages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Successful plus failed executions. Aborts are not counted.
    pub total_calculations: u64,
    pub successful: u64,
    pub failed: u64,
    /// Cancelled and timed-out executions.
    pub aborted: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub average_execution_time_ms: f64,
    pub cache_hit_rate: f64,
    pub queue_status: QueueStatus,
    pub window_secs: u64,
    pub computed_at: Option<DateTime<Utc>>,
}

/// Result of a synthetic health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub response_time_ms: u64,
    pub checked_at: DateTime<Utc>,
    pub error: Option<String>,
}
