//! Computations executed by workers, and the context they run with.

use std::sync::{Arc, Weak};

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::anomaly::AnomalyDetector;
use crate::error::Error;
use crate::model::anomaly::{Baseline, Observation};
use crate::model::job::{JobId, JobKind};
use crate::model::prediction::ModelKind;
use crate::registry::ModelRegistry;
use crate::store::{self, RecordKind, RecordStore};

use super::queue::Shared;

/// The work behind one job kind.
///
/// Errors are caught at the worker boundary and turn the job `failed`; they
/// never reach the scheduler.
#[async_trait]
pub trait Computation: Send + Sync {
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<serde_json::Value>;
}

/// Handed to a computation for one execution.
pub struct JobContext {
    pub job_id: JobId,
    pub kind: JobKind,
    pub parameters: serde_json::Value,
    queue: Weak<Shared>,
    cancel: CancellationToken,
}

impl JobContext {
    /// A context not attached to any queue. Progress reports go nowhere and
    /// cancellation never fires.
    pub fn detached(kind: JobKind, parameters: serde_json::Value) -> Self {
        Self {
            job_id: JobId::new(),
            kind,
            parameters,
            queue: Weak::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn attached(
        job_id: JobId,
        kind: JobKind,
        parameters: serde_json::Value,
        queue: Weak<Shared>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            kind,
            parameters,
            queue,
            cancel,
        }
    }

    /// Deserialize the parameters into a typed struct.
    pub fn params<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.parameters.clone())
            .with_context(|| format!("invalid parameters for {} job", self.kind))
    }

    /// Report progress (0-100). Values only move forward and stay below 100
    /// until the job finishes.
    pub fn report_progress(&self, percent: u8) {
        if let Some(shared) = self.queue.upgrade() {
            shared.report_progress(self.job_id, percent);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the job is cancelled or timed out.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

// ---------------------------------------------------------------------------
// Weighted average
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AverageParams {
    grades: Vec<GradeInput>,
}

#[derive(Debug, Deserialize)]
struct GradeInput {
    value: f64,
    #[serde(default = "default_coefficient")]
    coefficient: f64,
}

fn default_coefficient() -> f64 {
    1.0
}

/// Coefficient-weighted grade average. The default `calculation`.
///
/// Parameters: `{"grades": [{"value": 14.5, "coefficient": 2}, ...]}`.
/// A missing coefficient counts as 1.
pub struct WeightedAverage;

#[async_trait]
impl Computation for WeightedAverage {
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<serde_json::Value> {
        let params: AverageParams = ctx.params()?;
        if params.grades.is_empty() {
            bail!("no grades to average");
        }
        if let Some(g) = params
            .grades
            .iter()
            .find(|g| !g.value.is_finite() || !g.coefficient.is_finite() || g.coefficient < 0.0)
        {
            bail!(
                "invalid grade {} with coefficient {}",
                g.value,
                g.coefficient
            );
        }

        let total_coefficient: f64 = params.grades.iter().map(|g| g.coefficient).sum();
        if total_coefficient <= 0.0 {
            bail!("coefficients sum to zero");
        }
        let weighted: f64 = params.grades.iter().map(|g| g.value * g.coefficient).sum();
        ctx.report_progress(50);

        Ok(json!({
            "average": weighted / total_coefficient,
            "total_coefficient": total_coefficient,
            "count": params.grades.len(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Prediction
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PredictionParams {
    subject_id: String,
    #[serde(default)]
    model_id: Option<String>,
    #[serde(default)]
    model_type: Option<ModelKind>,
}

/// Scores a subject through the model registry. The default `prediction`.
///
/// Parameters: `{"subject_id": "...", "model_id": "..."}`, or `model_type`
/// instead of `model_id` to use the best active model of that type.
pub struct PredictionComputation {
    registry: Arc<ModelRegistry>,
}

impl PredictionComputation {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Computation for PredictionComputation {
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<serde_json::Value> {
        let params: PredictionParams = ctx.params()?;
        let model_id = match (params.model_id, params.model_type) {
            (Some(id), _) => id,
            (None, Some(kind)) => {
                self.registry
                    .active_model(kind)
                    .ok_or(Error::NoActiveModel(kind))?
                    .id
            }
            (None, None) => bail!("prediction needs a model_id or a model_type"),
        };
        ctx.report_progress(10);

        let prediction = self.registry.predict(&model_id, &params.subject_id).await?;
        Ok(serde_json::to_value(prediction)?)
    }
}

// ---------------------------------------------------------------------------
// Anomaly scan
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ScanParams {
    entity_type: String,
    baseline: Baseline,
    observations: Vec<Observation>,
}

/// Runs an anomaly scan. The default `anomaly_detection`.
///
/// Parameters: `{"entity_type": "student", "baseline": {...},
/// "observations": [{"entity_id": "...", "value": 8.5}, ...]}`.
pub struct AnomalyScanComputation {
    detector: Arc<AnomalyDetector>,
    store: Option<Arc<dyn RecordStore>>,
}

impl AnomalyScanComputation {
    pub fn new(detector: Arc<AnomalyDetector>, store: Option<Arc<dyn RecordStore>>) -> Self {
        Self { detector, store }
    }
}

#[async_trait]
impl Computation for AnomalyScanComputation {
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<serde_json::Value> {
        let params: ScanParams = ctx.params()?;
        let found = self
            .detector
            .scan(&params.entity_type, &params.observations, &params.baseline);
        ctx.report_progress(50);

        if let Some(ref store) = self.store {
            for record in &found {
                store::persist(store.as_ref(), RecordKind::Anomaly, &record.entity_id, record)
                    .await;
            }
        }

        Ok(json!({
            "scanned": params.observations.len(),
            "flagged": found.len(),
            "anomalies": found,
        }))
    }
}
