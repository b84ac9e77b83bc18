//! Execution monitor: execution window, bounded error log, health checks.
//!
//! The window of [`ExecutionRecord`]s and the error log are independent
//! views. Clearing the error log leaves the metrics alone, and records that
//! age out of the window leave the error log alone.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::model::metrics::{
    CacheStats, ErrorLogEntry, ExecutionOutcome, ExecutionRecord, HealthStatus, Metrics,
    QueueStatus,
};
use crate::telemetry::metrics;

/// A lightweight synthetic check that the engine is responsive.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> anyhow::Result<()>;
}

#[derive(Default)]
struct MonitorState {
    records: VecDeque<ExecutionRecord>,
    errors: VecDeque<ErrorLogEntry>,
    last_snapshot: Option<Metrics>,
    last_health: Option<HealthStatus>,
}

pub struct ExecutionMonitor {
    state: Mutex<MonitorState>,
    active: AtomicBool,
    window: Duration,
    error_capacity: usize,
    health_timeout: Duration,
}

impl ExecutionMonitor {
    pub fn new(window: Duration, error_capacity: usize, health_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(MonitorState::default()),
            active: AtomicBool::new(true),
            window,
            error_capacity: error_capacity.max(1),
            health_timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.metrics_window(),
            config.error_log_capacity,
            config.health_check_timeout(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            info!("execution monitoring started");
        }
    }

    /// While stopped, records are dropped and `metrics()` returns the last
    /// snapshot.
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!("execution monitoring stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Append an execution outcome. Anything that isn't a success also goes
    /// to the error log.
    pub fn record(&self, record: ExecutionRecord) {
        if !self.is_active() {
            debug!(job_id = %record.job_id, "monitor stopped, dropping record");
            return;
        }

        metrics::job_duration_ms().record(
            record.duration_ms as f64,
            &[
                KeyValue::new("kind", record.kind.as_str()),
                KeyValue::new("outcome", record.outcome.to_string()),
            ],
        );

        let mut state = self.lock();
        if record.outcome != ExecutionOutcome::Success {
            if state.errors.len() >= self.error_capacity {
                state.errors.pop_front();
            }
            state.errors.push_back(ErrorLogEntry {
                job_id: record.job_id,
                kind: record.kind,
                outcome: record.outcome,
                message: record
                    .error_message
                    .clone()
                    .unwrap_or_else(|| record.outcome.to_string()),
                timestamp: record.timestamp,
            });
        }
        state.records.push_back(record);
        self.prune_window(&mut state, Utc::now());
    }

    /// Drop records older than the window, oldest first.
    fn prune_window(&self, state: &mut MonitorState, now: DateTime<Utc>) {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = now.checked_sub_signed(window) else {
            return;
        };
        while state
            .records
            .front()
            .is_some_and(|record| record.timestamp < cutoff)
        {
            state.records.pop_front();
        }
    }

    /// Metrics over the current window, combined with the cache and queue
    /// snapshots supplied by their owners.
    pub fn metrics(&self, cache: CacheStats, queue: QueueStatus) -> Metrics {
        let mut state = self.lock();
        if !self.is_active() {
            return state.last_snapshot.clone().unwrap_or_default();
        }

        let now = Utc::now();
        self.prune_window(&mut state, now);

        let mut successful = 0u64;
        let mut failed = 0u64;
        let mut aborted = 0u64;
        let mut total_ms = 0u64;
        for record in &state.records {
            if record.outcome.is_abort() {
                aborted += 1;
                continue;
            }
            if record.outcome == ExecutionOutcome::Success {
                successful += 1;
            } else {
                failed += 1;
            }
            total_ms += record.duration_ms;
        }

        let total = successful + failed;
        let (success_rate, error_rate, average_ms) = if total == 0 {
            (0.0, 0.0, 0.0)
        } else {
            let success_rate = successful as f64 * 100.0 / total as f64;
            (success_rate, 100.0 - success_rate, total_ms as f64 / total as f64)
        };

        let snapshot = Metrics {
            total_calculations: total,
            successful,
            failed,
            aborted,
            success_rate,
            error_rate,
            average_execution_time_ms: average_ms,
            cache_hit_rate: cache.hit_rate(),
            queue_status: queue,
            window_secs: self.window.as_secs(),
            computed_at: Some(now),
        };
        state.last_snapshot = Some(snapshot.clone());
        snapshot
    }

    /// Newest first, at most `limit` entries.
    pub fn errors(&self, limit: usize) -> Vec<ErrorLogEntry> {
        self.lock().errors.iter().rev().take(limit).cloned().collect()
    }

    pub fn clear_errors(&self) {
        self.lock().errors.clear();
    }

    /// Forget the execution window and the cached snapshot.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.records.clear();
        state.last_snapshot = None;
    }

    /// Run the probe under the configured timeout and report latency.
    pub async fn health_check(&self, probe: &dyn HealthProbe) -> HealthStatus {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.health_timeout, probe.probe()).await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(_) => Some(format!(
                "probe exceeded {}ms timeout",
                self.health_timeout.as_millis()
            )),
        };
        let status = HealthStatus {
            healthy: error.is_none(),
            response_time_ms,
            checked_at: Utc::now(),
            error,
        };

        if let Some(ref error) = status.error {
            warn!(response_time_ms, %error, "health check failed");
        } else {
            debug!(response_time_ms, "health check passed");
        }
        metrics::health_checks().add(
            1,
            &[KeyValue::new(
                "result",
                if status.healthy { "healthy" } else { "unhealthy" },
            )],
        );

        self.lock().last_health = Some(status.clone());
        status
    }

    pub fn last_health(&self) -> Option<HealthStatus> {
        self.lock().last_health.clone()
    }
}
