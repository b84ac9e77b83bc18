//! Anomaly detection: scoring, lifecycle, and scans through the job queue.

use std::sync::Arc;

use academic_engine::ProcessingEngine;
use academic_engine::anomaly::{AnomalyDetector, deviation};
use academic_engine::config::EngineConfig;
use academic_engine::error::Error;
use academic_engine::model::*;
use academic_engine::store::{MemoryStore, RecordFilter, RecordKind, RecordStore};
use serde_json::json;

fn grade_baseline() -> Baseline {
    Baseline {
        metric: "grade_average".into(),
        mean: 12.0,
        std_dev: 2.0,
    }
}

fn observe(entity_id: &str, value: f64) -> Observation {
    Observation {
        entity_id: entity_id.into(),
        value,
        metadata: json!({ "semester": "S1" }),
    }
}

fn severity_of(found: &[AnomalyRecord], entity_id: &str) -> Option<Severity> {
    found
        .iter()
        .find(|r| r.entity_id == entity_id)
        .map(|r| r.severity)
}

#[test]
fn deviation_confidence_grows_with_distance() {
    let baseline = grade_baseline();

    let near = deviation(12.5, &baseline).unwrap();
    assert!((near.z_score - 0.25).abs() < 1e-9);
    assert!(near.confidence < 0.1);
    assert!(near.above);

    let far = deviation(4.0, &baseline).unwrap();
    assert!((far.z_score - 4.0).abs() < 1e-9);
    assert!(far.confidence > 0.99);
    assert!(!far.above);
}

#[test]
fn zero_variance_baseline() {
    let flat = Baseline {
        metric: "attendance".into(),
        mean: 1.0,
        std_dev: 0.0,
    };
    assert!(deviation(1.0, &flat).is_none());

    let off = deviation(0.5, &flat).unwrap();
    assert!(off.z_score.is_infinite());
    assert_eq!(off.confidence, 1.0);

    let detector = AnomalyDetector::new(0.8);
    let found = detector.scan(
        "student",
        &[observe("s-1", 1.0), observe("s-2", 0.5)],
        &flat,
    );
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].severity, Severity::Critical);
    assert!(found[0].metadata["z_score"].is_null());
}

#[test]
fn scan_bands_severity_and_skips_normal_values() {
    let detector = AnomalyDetector::new(0.8);
    let found = detector.scan(
        "student",
        &[
            observe("s-normal", 12.5),
            observe("s-critical", 4.0),
            observe("s-medium", 7.5),
            observe("s-high", 17.5),
            observe("s-low", 15.8),
        ],
        &grade_baseline(),
    );

    assert_eq!(found.len(), 4);
    assert_eq!(severity_of(&found, "s-normal"), None);
    assert_eq!(severity_of(&found, "s-critical"), Some(Severity::Critical));
    assert_eq!(severity_of(&found, "s-medium"), Some(Severity::Medium));
    assert_eq!(severity_of(&found, "s-high"), Some(Severity::High));
    assert_eq!(severity_of(&found, "s-low"), Some(Severity::Low));

    for record in &found {
        assert_eq!(record.status, AnomalyStatus::New);
        assert_eq!(record.entity_type, "student");
        assert_eq!(record.anomaly_type, "grade_average");
        assert!(record.confidence_score > 0.8);
        assert!(!record.suggested_actions.is_empty());
    }

    let critical = found.iter().find(|r| r.entity_id == "s-critical").unwrap();
    assert_eq!(critical.metadata["direction"], "below");
    assert_eq!(critical.metadata["observed"], json!(4.0));
    assert_eq!(critical.metadata["context"]["semester"], "S1");
    assert!(critical.description.contains("s-critical"));
    assert!(critical.suggested_actions.len() > found
        .iter()
        .find(|r| r.entity_id == "s-low")
        .unwrap()
        .suggested_actions
        .len());
}

#[test]
fn non_finite_inputs_are_never_flagged() {
    let baseline = grade_baseline();
    assert!(deviation(f64::NAN, &baseline).is_none());
    assert!(deviation(f64::INFINITY, &baseline).is_none());

    let broken_mean = Baseline {
        mean: f64::NAN,
        ..grade_baseline()
    };
    let broken_spread = Baseline {
        std_dev: f64::NAN,
        ..grade_baseline()
    };
    assert!(deviation(4.0, &broken_mean).is_none());
    assert!(deviation(4.0, &broken_spread).is_none());

    let detector = AnomalyDetector::new(0.8);
    let found = detector.scan(
        "student",
        &[observe("s-nan", f64::NAN), observe("s-critical", 4.0)],
        &baseline,
    );
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].entity_id, "s-critical");
    assert!((0.0..=1.0).contains(&found[0].confidence_score));

    assert!(detector
        .scan("student", &[observe("s-1", 4.0)], &broken_spread)
        .is_empty());
    assert_eq!(detector.list(&AnomalyFilter::default()).len(), 1);
}

#[test]
fn stricter_threshold_flags_less() {
    let detector = AnomalyDetector::new(0.99);
    let found = detector.scan(
        "student",
        &[observe("a", 7.5), observe("b", 4.0)],
        &grade_baseline(),
    );
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].entity_id, "b");
}

#[test]
fn open_anomaly_is_not_duplicated() {
    let detector = AnomalyDetector::new(0.8);
    let baseline = grade_baseline();

    let first = detector.scan("student", &[observe("s-1", 4.0)], &baseline);
    assert_eq!(first.len(), 1);
    assert!(detector.scan("student", &[observe("s-1", 3.0)], &baseline).is_empty());

    // A different entity type is a different subject.
    assert_eq!(detector.scan("course", &[observe("s-1", 4.0)], &baseline).len(), 1);

    // Once closed, the entity can be flagged again.
    detector.resolve(first[0].id, "grade corrected").unwrap();
    assert_eq!(detector.scan("student", &[observe("s-1", 4.0)], &baseline).len(), 1);
}

#[test]
fn lifecycle_new_investigating_resolved() {
    let detector = AnomalyDetector::new(0.8);
    let id = detector.scan("student", &[observe("s-1", 4.0)], &grade_baseline())[0].id;

    let investigating = detector.investigate(id).unwrap();
    assert_eq!(investigating.status, AnomalyStatus::Investigating);
    assert!(investigating.resolved_at.is_none());

    let resolved = detector.resolve(id, "transcript error fixed").unwrap();
    assert_eq!(resolved.status, AnomalyStatus::Resolved);
    assert_eq!(resolved.resolution.as_deref(), Some("transcript error fixed"));
    assert!(resolved.resolved_at.is_some());
}

#[test]
fn closed_anomaly_rejects_further_transitions() {
    let detector = AnomalyDetector::new(0.8);
    let id = detector.scan("student", &[observe("s-1", 4.0)], &grade_baseline())[0].id;

    let closed = detector.mark_false_positive(id).unwrap();
    assert_eq!(closed.status, AnomalyStatus::FalsePositive);

    assert!(matches!(
        detector.investigate(id),
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        detector.resolve(id, "too late"),
        Err(Error::InvalidTransition { .. })
    ));

    let unchanged = detector.get(id).unwrap();
    assert_eq!(unchanged.status, AnomalyStatus::FalsePositive);
    assert!(unchanged.resolution.is_none());
}

#[test]
fn unknown_anomaly_is_not_found() {
    let detector = AnomalyDetector::new(0.8);
    assert!(matches!(
        detector.investigate(AnomalyId::new()),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn filters_and_summary() {
    let detector = AnomalyDetector::new(0.8);
    let baseline = grade_baseline();
    detector.scan(
        "student",
        &[observe("s-1", 4.0), observe("s-2", 7.5), observe("s-3", 17.5)],
        &baseline,
    );
    detector.scan("course", &[observe("c-1", 3.0)], &baseline);

    let critical = detector.list(&AnomalyFilter {
        severity: Some(Severity::Critical),
        ..Default::default()
    });
    assert_eq!(critical.len(), 2);

    let courses = detector.list(&AnomalyFilter {
        entity_type: Some("course".into()),
        ..Default::default()
    });
    assert_eq!(courses.len(), 1);
    detector.investigate(courses[0].id).unwrap();

    let investigating = detector.list(&AnomalyFilter {
        status: Some(AnomalyStatus::Investigating),
        ..Default::default()
    });
    assert_eq!(investigating.len(), 1);
    assert_eq!(investigating[0].entity_id, "c-1");

    let all = detector.list(&AnomalyFilter::default());
    assert!(all.windows(2).all(|w| w[0].detected_at >= w[1].detected_at));

    let summary = detector.summary();
    assert_eq!(summary.total, 4);
    assert_eq!(summary.open, 4);
    assert_eq!(summary.by_severity.get("critical"), Some(&2));
    assert_eq!(summary.by_status.get("investigating"), Some(&1));
    assert_eq!(summary.by_status.get("new"), Some(&3));
}

#[tokio::test]
async fn anomaly_scan_job_flags_and_persists() {
    let store = Arc::new(MemoryStore::new());
    let engine = ProcessingEngine::builder(EngineConfig::default())
        .store(store.clone())
        .build()
        .unwrap();

    let job = engine
        .run(
            JobRequest::new(JobKind::AnomalyDetection, "grade scan").parameters(json!({
                "entity_type": "student",
                "baseline": { "metric": "grade_average", "mean": 12.0, "std_dev": 2.0 },
                "observations": [
                    { "entity_id": "s-1", "value": 12.5 },
                    { "entity_id": "s-2", "value": 4.0 },
                    { "entity_id": "s-3", "value": 7.5 },
                    { "entity_id": "s-4", "value": 17.5 }
                ]
            })),
        )
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.unwrap();
    assert_eq!(result["scanned"], json!(4));
    assert_eq!(result["flagged"], json!(3));

    assert_eq!(engine.list_anomalies(&AnomalyFilter::default()).len(), 3);
    assert_eq!(store.len(), 3);
    let stored = store
        .query(&RecordFilter {
            kind: Some(RecordKind::Anomaly),
            key: Some("s-2".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].payload["severity"], "critical");
}

#[tokio::test]
async fn direct_scan_goes_through_the_engine_detector() {
    let engine = ProcessingEngine::new(EngineConfig::default()).unwrap();
    let found = engine
        .scan_anomalies("student", &[observe("s-9", 4.0)], &grade_baseline())
        .await;
    assert_eq!(found.len(), 1);

    let resolved = engine.resolve(found[0].id, "verified").unwrap();
    assert_eq!(resolved.status, AnomalyStatus::Resolved);
    assert_eq!(engine.anomaly_summary().open, 0);
}
