//! Anomaly detection over academic metrics.
//!
//! Each observation is scored as a z-score against a collaborator-supplied
//! [`Baseline`]. Confidence grows with the deviation (`1 - exp(-z²/2)`), and
//! only observations above the configured confidence threshold become
//! anomalies. Severity is banded on the deviation magnitude.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use opentelemetry::KeyValue;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::anomaly::*;
use crate::telemetry::metrics;

pub struct AnomalyDetector {
    records: RwLock<HashMap<AnomalyId, AnomalyRecord>>,
    confidence_threshold: f64,
}

/// Deviation of one observation from its baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deviation {
    pub z_score: f64,
    pub confidence: f64,
    pub above: bool,
}

/// Score an observed value. `None` when it sits exactly on a zero-variance
/// baseline, or when the value or baseline is not a finite number.
pub fn deviation(value: f64, baseline: &Baseline) -> Option<Deviation> {
    if !(value.is_finite() && baseline.mean.is_finite() && baseline.std_dev.is_finite()) {
        return None;
    }
    let diff = value - baseline.mean;
    let z_score = if baseline.std_dev.abs() <= f64::EPSILON {
        if diff.abs() <= f64::EPSILON {
            return None;
        }
        f64::INFINITY
    } else {
        diff.abs() / baseline.std_dev.abs()
    };
    let confidence = (1.0 - (-z_score * z_score / 2.0).exp()).clamp(0.0, 1.0);
    Some(Deviation {
        z_score,
        confidence,
        above: diff > 0.0,
    })
}

impl AnomalyDetector {
    pub fn new(confidence_threshold: f64) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            confidence_threshold,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<AnomalyId, AnomalyRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<AnomalyId, AnomalyRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flag observations that deviate from the baseline.
    ///
    /// Returns the anomalies created by this scan. An entity that already has
    /// an open anomaly of the same type is skipped.
    pub fn scan(
        &self,
        entity_type: &str,
        observations: &[Observation],
        baseline: &Baseline,
    ) -> Vec<AnomalyRecord> {
        let mut created = Vec::new();
        let mut records = self.write();

        for observation in observations {
            let Some(dev) = deviation(observation.value, baseline) else {
                if !observation.value.is_finite() {
                    warn!(
                        entity_type,
                        entity_id = %observation.entity_id,
                        "non-finite observation skipped"
                    );
                }
                continue;
            };
            if dev.confidence <= self.confidence_threshold {
                continue;
            }

            let already_open = records.values().any(|r| {
                r.status.is_open()
                    && r.entity_type == entity_type
                    && r.entity_id == observation.entity_id
                    && r.anomaly_type == baseline.metric
            });
            if already_open {
                debug!(
                    entity_type,
                    entity_id = %observation.entity_id,
                    anomaly_type = %baseline.metric,
                    "open anomaly exists, skipping"
                );
                continue;
            }

            let record = build_record(entity_type, observation, baseline, dev);
            metrics::anomalies_detected().add(
                1,
                &[
                    KeyValue::new("entity_type", entity_type.to_string()),
                    KeyValue::new("severity", record.severity.to_string()),
                ],
            );
            records.insert(record.id, record.clone());
            created.push(record);
        }

        info!(
            entity_type,
            metric = %baseline.metric,
            scanned = observations.len(),
            flagged = created.len(),
            "anomaly scan finished"
        );
        created
    }

    pub fn get(&self, id: AnomalyId) -> Result<AnomalyRecord> {
        self.read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("anomaly {id}")))
    }

    /// Newest first.
    pub fn list(&self, filter: &AnomalyFilter) -> Vec<AnomalyRecord> {
        let mut out: Vec<AnomalyRecord> = self
            .read()
            .values()
            .filter(|r| filter.severity.is_none_or(|s| r.severity == s))
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .filter(|r| {
                filter
                    .entity_type
                    .as_deref()
                    .is_none_or(|t| r.entity_type == t)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        out
    }

    pub fn investigate(&self, id: AnomalyId) -> Result<AnomalyRecord> {
        self.transition(id, AnomalyStatus::Investigating, None)
    }

    pub fn resolve(&self, id: AnomalyId, resolution: impl Into<String>) -> Result<AnomalyRecord> {
        self.transition(id, AnomalyStatus::Resolved, Some(resolution.into()))
    }

    pub fn mark_false_positive(&self, id: AnomalyId) -> Result<AnomalyRecord> {
        self.transition(id, AnomalyStatus::FalsePositive, None)
    }

    fn transition(
        &self,
        id: AnomalyId,
        to: AnomalyStatus,
        resolution: Option<String>,
    ) -> Result<AnomalyRecord> {
        let mut records = self.write();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("anomaly {id}")))?;

        if !record.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: record.status.to_string(),
                to: to.to_string(),
            });
        }

        info!(anomaly_id = %id, from = %record.status, to = %to, "anomaly status changed");
        record.status = to;
        if !to.is_open() {
            record.resolved_at = Some(Utc::now());
            record.resolution = resolution;
        }
        Ok(record.clone())
    }

    pub fn summary(&self) -> AnomalySummary {
        let records = self.read();
        let mut summary = AnomalySummary {
            total: records.len(),
            ..Default::default()
        };
        for record in records.values() {
            if record.status.is_open() {
                summary.open += 1;
            }
            *summary
                .by_severity
                .entry(record.severity.to_string())
                .or_default() += 1;
            *summary.by_status.entry(record.status.to_string()).or_default() += 1;
        }
        summary
    }
}

fn build_record(
    entity_type: &str,
    observation: &Observation,
    baseline: &Baseline,
    dev: Deviation,
) -> AnomalyRecord {
    let severity = Severity::from_deviation(dev.z_score);
    let direction = if dev.above { "above" } else { "below" };
    // Infinite z-scores (zero-variance baselines) serialize as null.
    let z_score = if dev.z_score.is_finite() {
        json!(dev.z_score)
    } else {
        serde_json::Value::Null
    };

    let description = format!(
        "{entity_type} {}: {} of {:.2} is {:.1} standard deviations {direction} the expected {:.2}",
        observation.entity_id, baseline.metric, observation.value, dev.z_score, baseline.mean
    );

    let mut suggested_actions = Vec::new();
    if dev.above {
        suggested_actions.push(format!(
            "Verify the recorded {} values for data-entry errors",
            baseline.metric
        ));
    } else {
        suggested_actions.push(format!(
            "Review recent {} history with the {entity_type}'s advisor",
            baseline.metric
        ));
    }
    if severity >= Severity::High {
        suggested_actions.push("Schedule a follow-up meeting within the week".to_string());
    }
    if severity == Severity::Critical {
        suggested_actions.push("Escalate to the program coordinator".to_string());
    }

    AnomalyRecord {
        id: AnomalyId::new(),
        entity_type: entity_type.to_string(),
        entity_id: observation.entity_id.clone(),
        anomaly_type: baseline.metric.clone(),
        severity,
        confidence_score: dev.confidence,
        detected_at: Utc::now(),
        status: AnomalyStatus::New,
        description,
        suggested_actions,
        metadata: json!({
            "observed": observation.value,
            "expected": baseline.mean,
            "std_dev": baseline.std_dev,
            "z_score": z_score,
            "direction": direction,
            "context": observation.metadata,
        }),
        resolution: None,
        resolved_at: None,
    }
}
