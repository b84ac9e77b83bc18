//! Predictive model registry.
//!
//! Holds versioned model descriptors and issues predictions through
//! collaborator-supplied [`Scorer`]s. Retraining goes through a [`Trainer`];
//! a model only becomes active again when the trainer reports success.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::prediction::*;
use crate::store::{self, RecordKind, RecordStore};
use crate::telemetry::metrics;

/// Allowed drift of factor importances from 1.0.
pub const FACTOR_TOLERANCE: f64 = 0.01;

/// Scores one subject with a model. The statistics live behind this trait.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, model: &Model, subject_id: &str) -> anyhow::Result<Score>;
}

/// Fits a model to new data.
#[async_trait]
pub trait Trainer: Send + Sync {
    async fn train(
        &self,
        model: &Model,
        training_data: Option<serde_json::Value>,
    ) -> anyhow::Result<TrainingReport>;
}

pub struct ModelRegistry {
    models: RwLock<HashMap<String, Model>>,
    predictions: RwLock<Vec<PredictionResult>>,
    scorers: HashMap<ModelKind, Arc<dyn Scorer>>,
    trainer: Option<Arc<dyn Trainer>>,
    store: Option<Arc<dyn RecordStore>>,
    validity: Duration,
}

impl ModelRegistry {
    /// `validity` is how long issued predictions stay current.
    pub fn new(validity: Duration) -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            predictions: RwLock::new(Vec::new()),
            scorers: HashMap::new(),
            trainer: None,
            store: None,
            validity,
        }
    }

    pub fn with_scorer(mut self, kind: ModelKind, scorer: Arc<dyn Scorer>) -> Self {
        self.scorers.insert(kind, scorer);
        self
    }

    pub fn with_trainer(mut self, trainer: Arc<dyn Trainer>) -> Self {
        self.trainer = Some(trainer);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn models(&self) -> RwLockReadGuard<'_, HashMap<String, Model>> {
        self.models.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn models_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Model>> {
        self.models.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a new model. Ids are unique; an existing descriptor only changes
    /// through [`set_status`](Self::set_status) and
    /// [`retrain`](Self::retrain).
    pub fn register(&self, model: Model) -> Result<()> {
        if !(0.0..=1.0).contains(&model.accuracy) {
            return Err(Error::Other(format!(
                "model {} accuracy must be within [0, 1], got {}",
                model.id, model.accuracy
            )));
        }
        let mut models = self.models_mut();
        if models.contains_key(&model.id) {
            return Err(Error::AlreadyExists(format!("model {}", model.id)));
        }
        info!(
            model_id = %model.id,
            kind = %model.kind,
            version = %model.version,
            status = %model.status,
            "model registered"
        );
        models.insert(model.id.clone(), model);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Model> {
        self.models()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("model {id}")))
    }

    /// Sorted by id.
    pub fn list(&self, filter: &ModelFilter) -> Vec<Model> {
        let mut out: Vec<Model> = self
            .models()
            .values()
            .filter(|m| filter.kind.is_none_or(|k| m.kind == k))
            .filter(|m| filter.status.is_none_or(|s| m.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Activate, deactivate or deprecate. Training is entered only through
    /// [`retrain`](Self::retrain).
    pub fn set_status(&self, id: &str, to: ModelStatus) -> Result<Model> {
        let mut models = self.models_mut();
        let model = models
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("model {id}")))?;
        if !model.status.can_set_to(to) {
            return Err(Error::InvalidTransition {
                from: model.status.to_string(),
                to: to.to_string(),
            });
        }
        info!(model_id = %id, from = %model.status, to = %to, "model status changed");
        model.status = to;
        Ok(model.clone())
    }

    /// The most accurate active model of a kind.
    pub fn active_model(&self, kind: ModelKind) -> Option<Model> {
        self.models()
            .values()
            .filter(|m| m.kind == kind && m.status == ModelStatus::Active)
            .max_by(|a, b| a.accuracy.total_cmp(&b.accuracy))
            .cloned()
    }

    /// Retrain a model. The model sits in `training` while the trainer runs.
    ///
    /// On success it becomes active with the reported accuracy. On failure it
    /// stays in `training` with `last_error` set, and the error is returned.
    pub async fn retrain(
        &self,
        id: &str,
        training_data: Option<serde_json::Value>,
    ) -> Result<Model> {
        let trainer = self
            .trainer
            .clone()
            .ok_or_else(|| Error::Unsupported("no trainer configured".into()))?;

        let snapshot = {
            let mut models = self.models_mut();
            let model = models
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("model {id}")))?;
            if model.status == ModelStatus::Deprecated {
                return Err(Error::InvalidTransition {
                    from: model.status.to_string(),
                    to: ModelStatus::Training.to_string(),
                });
            }
            model.status = ModelStatus::Training;
            model.last_error = None;
            model.clone()
        };
        info!(model_id = %id, kind = %snapshot.kind, "model retraining started");

        let outcome = trainer.train(&snapshot, training_data).await;

        let mut models = self.models_mut();
        let model = models
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("model {id}")))?;
        let outcome = outcome.and_then(|report| {
            if report.accuracy.is_finite() {
                Ok(report)
            } else {
                Err(anyhow::anyhow!("trainer reported accuracy {}", report.accuracy))
            }
        });
        match outcome {
            Ok(report) => {
                model.status = ModelStatus::Active;
                model.accuracy = report.accuracy.clamp(0.0, 1.0);
                model.last_trained_at = Some(Utc::now());
                model.training_data_size = report.training_data_size;
                if !report.performance_metrics.is_empty() {
                    model.performance_metrics = report.performance_metrics;
                }
                info!(model_id = %id, accuracy = model.accuracy, "model retraining completed");
                Ok(model.clone())
            }
            Err(e) => {
                let err = Error::computation(e);
                model.last_error = Some(err.to_string());
                warn!(model_id = %id, error = %err, "model retraining failed");
                Err(err)
            }
        }
    }

    /// Score a subject with an active model.
    pub async fn predict(&self, model_id: &str, subject_id: &str) -> Result<PredictionResult> {
        let model = self.get(model_id)?;
        if model.status != ModelStatus::Active {
            return Err(Error::ModelNotActive {
                id: model.id,
                status: model.status,
            });
        }
        let scorer = self.scorers.get(&model.kind).cloned().ok_or_else(|| {
            Error::Unsupported(format!("no scorer registered for {} models", model.kind))
        })?;

        let score = scorer
            .score(&model, subject_id)
            .await
            .map_err(Error::computation)?;
        validate_factors(&score.factors)?;
        if !score.predicted_value.is_finite() || !score.confidence_level.is_finite() {
            return Err(Error::Computation(format!(
                "scorer returned non-finite output (value {}, confidence {})",
                score.predicted_value, score.confidence_level
            )));
        }

        let created_at = Utc::now();
        let validity = chrono::Duration::from_std(self.validity).unwrap_or(chrono::Duration::MAX);
        let prediction = PredictionResult {
            id: Uuid::new_v4(),
            model_id: model.id.clone(),
            model_version: model.version.clone(),
            subject_id: subject_id.to_string(),
            prediction_type: model.kind,
            predicted_value: score.predicted_value,
            confidence_level: score.confidence_level.clamp(0.0, 1.0),
            factors: score.factors,
            valid_until: created_at
                .checked_add_signed(validity)
                .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC),
            created_at,
        };

        self.predictions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prediction.clone());
        metrics::predictions_issued()
            .add(1, &[KeyValue::new("model_type", model.kind.as_str())]);

        if let Some(ref store) = self.store {
            store::persist(
                store.as_ref(),
                RecordKind::Prediction,
                &prediction.subject_id,
                &prediction,
            )
            .await;
        }
        Ok(prediction)
    }

    /// Newest first.
    pub fn list_predictions(&self, filter: &PredictionFilter) -> Vec<PredictionResult> {
        let predictions = self
            .predictions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut seen = HashSet::new();
        predictions
            .iter()
            .rev()
            .filter(|p| {
                filter
                    .subject_id
                    .as_deref()
                    .is_none_or(|s| p.subject_id == s)
            })
            .filter(|p| filter.prediction_type.is_none_or(|t| p.prediction_type == t))
            .filter(|p| {
                !filter.latest_only || seen.insert((p.subject_id.clone(), p.prediction_type))
            })
            .cloned()
            .collect()
    }

    /// Forget predictions whose `valid_until` has passed.
    pub fn prune_expired(&self) -> usize {
        let now = Utc::now();
        let mut predictions = self
            .predictions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = predictions.len();
        predictions.retain(|p| p.valid_until > now);
        let pruned = before - predictions.len();
        if pruned > 0 {
            debug!(pruned, "pruned expired predictions");
        }
        pruned
    }
}

/// Importances must sum to 1.0 within [`FACTOR_TOLERANCE`]. An empty list
/// carries no explanation and is accepted.
pub fn validate_factors(factors: &[PredictionFactor]) -> Result<()> {
    if factors.is_empty() {
        return Ok(());
    }
    let sum: f64 = factors.iter().map(|f| f.importance).sum();
    let finite = factors.iter().all(|f| f.importance.is_finite());
    if !finite || (sum - 1.0).abs() > FACTOR_TOLERANCE + f64::EPSILON {
        return Err(Error::InvalidFactors { sum });
    }
    Ok(())
}
