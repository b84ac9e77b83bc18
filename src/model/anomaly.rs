//! Anomaly record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A flagged deviation from an expected baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub id: AnomalyId,
    /// e.g. "student", "program", "course".
    pub entity_type: String,
    pub entity_id: String,
    /// The baseline metric that was violated, e.g. "grade_average".
    pub anomaly_type: String,
    pub severity: Severity,
    /// In [0, 1].
    pub confidence_score: f64,
    pub detected_at: DateTime<Utc>,
    pub status: AnomalyStatus,
    pub description: String,
    pub suggested_actions: Vec<String>,
    pub metadata: serde_json::Value,
    /// Note left by whoever resolved it.
    pub resolution: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnomalyId(pub Uuid);

impl AnomalyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AnomalyId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AnomalyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Band a z-score into a severity.
    pub fn from_deviation(z: f64) -> Self {
        if z > 3.0 {
            Severity::Critical
        } else if z > 2.5 {
            Severity::High
        } else if z > 2.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyStatus {
    New,
    Investigating,
    Resolved,
    FalsePositive,
}

impl AnomalyStatus {
    pub fn can_transition_to(self, to: AnomalyStatus) -> bool {
        use AnomalyStatus::*;
        matches!(
            (self, to),
            (New, Investigating)
                | (New, Resolved)
                | (New, FalsePositive)
                | (Investigating, Resolved)
                | (Investigating, FalsePositive)
        )
    }

    /// Still awaiting a decision from staff.
    pub fn is_open(self) -> bool {
        matches!(self, AnomalyStatus::New | AnomalyStatus::Investigating)
    }
}

impl std::fmt::Display for AnomalyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AnomalyStatus::New => "new",
            AnomalyStatus::Investigating => "investigating",
            AnomalyStatus::Resolved => "resolved",
            AnomalyStatus::FalsePositive => "false_positive",
        };
        f.write_str(s)
    }
}

/// Expected behaviour for one metric, supplied by a collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    /// Metric name; becomes the anomaly type.
    pub metric: String,
    pub mean: f64,
    pub std_dev: f64,
}

/// One entity's observed value for the baseline metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub entity_id: String,
    pub value: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Filters for listing anomalies. `None` matches everything.
#[derive(Debug, Clone, Default)]
pub struct AnomalyFilter {
    pub severity: Option<Severity>,
    pub status: Option<AnomalyStatus>,
    pub entity_type: Option<String>,
}

/// Counts for dashboards.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnomalySummary {
    pub total: usize,
    pub open: usize,
    pub by_severity: std::collections::BTreeMap<String, usize>,
    pub by_status: std::collections::BTreeMap<String, usize>,
}
