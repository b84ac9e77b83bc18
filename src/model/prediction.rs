//! Predictive model descriptors and prediction results.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// A versioned, stateful scorer descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub kind: ModelKind,
    pub version: String,
    /// In [0, 1]. Changed only when training completes.
    pub accuracy: f64,
    pub status: ModelStatus,
    pub last_trained_at: Option<DateTime<Utc>>,
    pub training_data_size: Option<u64>,
    #[serde(default)]
    pub performance_metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub configuration: serde_json::Value,
    /// Set when the most recent retraining failed.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ModelKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            version: "1.0.0".to_string(),
            accuracy: 0.0,
            status: ModelStatus::Inactive,
            last_trained_at: None,
            training_data_size: None,
            performance_metrics: BTreeMap::new(),
            configuration: serde_json::Value::Null,
            last_error: None,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = accuracy;
        self
    }

    pub fn status(mut self, status: ModelStatus) -> Self {
        self.status = status;
        self
    }

    pub fn configuration(mut self, configuration: serde_json::Value) -> Self {
        self.configuration = configuration;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    AnomalyDetection,
    GradePrediction,
    DropoutRisk,
    Recommendation,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::AnomalyDetection => "anomaly_detection",
            ModelKind::GradePrediction => "grade_prediction",
            ModelKind::DropoutRisk => "dropout_risk",
            ModelKind::Recommendation => "recommendation",
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anomaly_detection" => Ok(ModelKind::AnomalyDetection),
            "grade_prediction" => Ok(ModelKind::GradePrediction),
            "dropout_risk" => Ok(ModelKind::DropoutRisk),
            "recommendation" => Ok(ModelKind::Recommendation),
            other => Err(Error::Other(format!("unknown model type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Training,
    Active,
    Inactive,
    Deprecated,
}

impl ModelStatus {
    /// Transitions reachable through `ModelRegistry::set_status`. Entering and
    /// leaving `Training` is reserved for retraining.
    pub fn can_set_to(self, to: ModelStatus) -> bool {
        use ModelStatus::*;
        matches!(
            (self, to),
            (Active, Inactive)
                | (Inactive, Active)
                | (Active, Deprecated)
                | (Inactive, Deprecated)
        )
    }
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelStatus::Training => "training",
            ModelStatus::Active => "active",
            ModelStatus::Inactive => "inactive",
            ModelStatus::Deprecated => "deprecated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelFilter {
    pub kind: Option<ModelKind>,
    pub status: Option<ModelStatus>,
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// What a scorer returns for one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    pub predicted_value: f64,
    pub confidence_level: f64,
    /// Importances must sum to 1.0 within 0.01.
    pub factors: Vec<PredictionFactor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionFactor {
    pub factor: String,
    pub importance: f64,
    pub value: serde_json::Value,
}

/// What a trainer returns after a successful run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingReport {
    pub accuracy: f64,
    pub training_data_size: Option<u64>,
    #[serde(default)]
    pub performance_metrics: BTreeMap<String, f64>,
}

// ---------------------------------------------------------------------------
// Prediction
// ---------------------------------------------------------------------------

/// Immutable once created. A later prediction for the same subject and type
/// supersedes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    pub id: Uuid,
    pub model_id: String,
    pub model_version: String,
    pub subject_id: String,
    pub prediction_type: ModelKind,
    pub predicted_value: f64,
    pub confidence_level: f64,
    pub factors: Vec<PredictionFactor>,
    pub valid_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl PredictionResult {
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        at < self.valid_until
    }
}

#[derive(Debug, Clone, Default)]
pub struct PredictionFilter {
    pub subject_id: Option<String>,
    pub prediction_type: Option<ModelKind>,
    /// Only the newest prediction per (subject, type).
    pub latest_only: bool,
}
