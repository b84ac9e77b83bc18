//! Core data model.
//!
//! Plain data shared by the engine components: jobs, anomalies, models and
//! predictions, execution records and metrics.

pub mod anomaly;
pub mod job;
pub mod metrics;
pub mod prediction;

pub use anomaly::{
    AnomalyFilter, AnomalyId, AnomalyRecord, AnomalyStatus, AnomalySummary, Baseline, Observation,
    Severity,
};
pub use job::{CacheKey, FailureKind, Job, JobFailure, JobId, JobKind, JobRequest, JobStatus};
pub use metrics::{
    CacheStats, ErrorLogEntry, ExecutionOutcome, ExecutionRecord, HealthStatus, Metrics,
    QueueStatus,
};
pub use prediction::{
    Model, ModelFilter, ModelKind, ModelStatus, PredictionFactor, PredictionFilter,
    PredictionResult, Score, TrainingReport,
};
