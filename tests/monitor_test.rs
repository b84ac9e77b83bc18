//! Execution monitor: rates, window, error log, health checks.

use std::sync::Arc;
use std::time::Duration;

use academic_engine::ProcessingEngine;
use academic_engine::config::EngineConfig;
use academic_engine::model::*;
use academic_engine::monitor::{ExecutionMonitor, HealthProbe};
use academic_engine::store::{MemoryStore, RecordFilter, RecordKind, RecordStore};
use async_trait::async_trait;

fn monitor() -> ExecutionMonitor {
    ExecutionMonitor::new(Duration::from_secs(3600), 100, Duration::from_millis(50))
}

fn snapshot(monitor: &ExecutionMonitor) -> Metrics {
    monitor.metrics(CacheStats::default(), QueueStatus::default())
}

fn success(ms: u64) -> ExecutionRecord {
    ExecutionRecord::success(JobId::new(), JobKind::Calculation, ms)
}

fn failure(message: &str) -> ExecutionRecord {
    ExecutionRecord::failed(
        JobId::new(),
        JobKind::Calculation,
        FailureKind::Computation,
        10,
        message,
    )
}

#[test]
fn empty_window_reports_zeros() {
    let metrics = snapshot(&monitor());
    assert_eq!(metrics.total_calculations, 0);
    assert_eq!(metrics.success_rate, 0.0);
    assert_eq!(metrics.error_rate, 0.0);
    assert_eq!(metrics.average_execution_time_ms, 0.0);
    assert!(!metrics.success_rate.is_nan());
}

#[test]
fn rates_and_average() {
    let monitor = monitor();
    monitor.record(success(100));
    monitor.record(success(200));
    monitor.record(success(300));
    monitor.record(failure("division by zero"));

    let metrics = snapshot(&monitor);
    assert_eq!(metrics.total_calculations, 4);
    assert_eq!(metrics.successful, 3);
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.success_rate, 75.0);
    assert_eq!(metrics.error_rate, 25.0);
    assert_eq!(metrics.average_execution_time_ms, 152.5);
    assert_eq!(metrics.window_secs, 3600);
    assert!(metrics.computed_at.is_some());
}

#[test]
fn aborts_are_logged_but_not_rated() {
    let monitor = monitor();
    monitor.record(success(10));
    monitor.record(ExecutionRecord::failed(
        JobId::new(),
        JobKind::Prediction,
        FailureKind::Timeout,
        5_000,
        "timed out",
    ));
    monitor.record(ExecutionRecord::failed(
        JobId::new(),
        JobKind::Prediction,
        FailureKind::Cancelled,
        1,
        "cancelled",
    ));

    let metrics = snapshot(&monitor);
    assert_eq!(metrics.total_calculations, 1);
    assert_eq!(metrics.aborted, 2);
    assert_eq!(metrics.success_rate, 100.0);
    assert_eq!(metrics.average_execution_time_ms, 10.0);
    assert_eq!(monitor.errors(10).len(), 2);
}

#[test]
fn cache_and_queue_snapshots_pass_through() {
    let monitor = monitor();
    let metrics = monitor.metrics(
        CacheStats {
            hits: 1,
            misses: 3,
            entries: 1,
        },
        QueueStatus {
            pending: 2,
            running: 1,
            total: 5,
        },
    );
    assert_eq!(metrics.cache_hit_rate, 25.0);
    assert_eq!(metrics.queue_status.pending, 2);
}

#[test]
fn error_log_is_bounded_and_newest_first() {
    let monitor = ExecutionMonitor::new(Duration::from_secs(3600), 3, Duration::from_secs(1));
    for n in 0..5 {
        monitor.record(failure(&format!("error {n}")));
    }

    let errors = monitor.errors(10);
    let messages: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["error 4", "error 3", "error 2"]);
    assert_eq!(monitor.errors(1).len(), 1);
    assert_eq!(errors[0].outcome, ExecutionOutcome::Failure);
}

#[test]
fn clearing_errors_keeps_metrics() {
    let monitor = monitor();
    monitor.record(failure("boom"));
    monitor.clear_errors();

    assert!(monitor.errors(10).is_empty());
    assert_eq!(snapshot(&monitor).failed, 1);
}

#[test]
fn old_records_fall_out_of_the_window() {
    let monitor = monitor();
    let mut stale = failure("yesterday");
    stale.timestamp = chrono::Utc::now() - chrono::Duration::hours(2);
    monitor.record(stale);
    monitor.record(success(40));

    let metrics = snapshot(&monitor);
    assert_eq!(metrics.total_calculations, 1);
    assert_eq!(metrics.error_rate, 0.0);
    // The error log has its own lifetime.
    assert_eq!(monitor.errors(10).len(), 1);
}

#[test]
fn stopped_monitor_serves_last_snapshot() {
    let monitor = monitor();
    monitor.record(success(10));
    let before = snapshot(&monitor);

    monitor.stop();
    assert!(!monitor.is_active());
    monitor.record(failure("ignored"));
    assert_eq!(snapshot(&monitor), before);
    assert!(monitor.errors(10).is_empty());

    monitor.start();
    monitor.record(failure("counted"));
    assert_eq!(snapshot(&monitor).total_calculations, 2);
}

#[test]
fn reset_forgets_the_window() {
    let monitor = monitor();
    monitor.record(success(10));
    monitor.reset();
    assert_eq!(snapshot(&monitor).total_calculations, 0);
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

struct Healthy;

#[async_trait]
impl HealthProbe for Healthy {
    async fn probe(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Broken;

#[async_trait]
impl HealthProbe for Broken {
    async fn probe(&self) -> anyhow::Result<()> {
        anyhow::bail!("connection refused")
    }
}

struct Hanging;

#[async_trait]
impl HealthProbe for Hanging {
    async fn probe(&self) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}

#[tokio::test]
async fn passing_probe_is_healthy() {
    let monitor = monitor();
    let health = monitor.health_check(&Healthy).await;
    assert!(health.healthy);
    assert!(health.error.is_none());
    assert!(monitor.last_health().unwrap().healthy);
}

#[tokio::test]
async fn failing_probe_is_unhealthy() {
    let health = monitor().health_check(&Broken).await;
    assert!(!health.healthy);
    assert!(health.error.unwrap().contains("connection refused"));
}

#[tokio::test(start_paused = true)]
async fn slow_probe_times_out() {
    let health = monitor().health_check(&Hanging).await;
    assert!(!health.healthy);
    assert!(health.error.unwrap().contains("timeout"));
}

#[tokio::test]
async fn engine_default_probe_and_custom_probe() {
    let engine = ProcessingEngine::new(EngineConfig::default()).unwrap();
    assert!(engine.health_check().await.healthy);

    let engine = ProcessingEngine::builder(EngineConfig::default())
        .health_probe(Arc::new(Broken))
        .build()
        .unwrap();
    assert!(!engine.health_check().await.healthy);
}

#[tokio::test]
async fn engine_reset_metrics_zeroes_rates_and_cache_counters() {
    let engine = ProcessingEngine::new(EngineConfig::default()).unwrap();
    let request = JobRequest::new(JobKind::Calculation, "avg")
        .parameters(serde_json::json!({ "grades": [{ "value": 10.0 }] }));
    engine.run(request.clone()).await.unwrap();
    engine.submit(request).unwrap();
    assert_eq!(engine.metrics().total_calculations, 1);
    assert_eq!(engine.metrics().cache_hit_rate, 50.0);

    engine.reset_metrics();
    let metrics = engine.metrics();
    assert_eq!(metrics.total_calculations, 0);
    assert_eq!(metrics.cache_hit_rate, 0.0);
}

#[tokio::test(start_paused = true)]
async fn metrics_reporter_persists_snapshots_until_shutdown() {
    let store = Arc::new(MemoryStore::new());
    let engine = ProcessingEngine::builder(EngineConfig::default())
        .store(store.clone())
        .build()
        .unwrap();

    let reporter = engine.spawn_metrics_reporter(Duration::from_secs(60));
    tokio::time::sleep(Duration::from_secs(90)).await;

    let snapshots = store
        .query(&RecordFilter {
            kind: Some(RecordKind::PerformanceMetric),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].key, "engine");

    engine.shutdown();
    reporter.await.unwrap();
}
