//! The processing engine: one owned aggregate per process.
//!
//! [`ProcessingEngine`] wires the job queue, result cache, execution
//! monitor, anomaly detector and model registry together from one
//! [`EngineConfig`]. Build it with [`ProcessingEngine::builder`] to plug in
//! computations, scorers, a trainer, a record store or a health probe.

pub mod computation;
pub mod queue;
mod worker;

pub use computation::{
    AnomalyScanComputation, Computation, JobContext, PredictionComputation, WeightedAverage,
};
pub use queue::{JobQueue, SchedulingOrder, SubmitResult};

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::anomaly::AnomalyDetector;
use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::event::EngineEvent;
use crate::model::*;
use crate::monitor::{ExecutionMonitor, HealthProbe};
use crate::registry::{ModelRegistry, Scorer, Trainer};
use crate::store::{self, RecordKind, RecordStore};

use queue::QueueSettings;

const EVENT_CAPACITY: usize = 256;

/// Default health probe: a round trip through the runtime and the queue lock.
struct QueueProbe {
    queue: JobQueue,
}

#[async_trait]
impl HealthProbe for QueueProbe {
    async fn probe(&self) -> anyhow::Result<()> {
        let queue = self.queue.clone();
        let status = tokio::spawn(async move { queue.queue_status() }).await?;
        debug!(pending = status.pending, running = status.running, "queue probe");
        Ok(())
    }
}

/// One subject's dropout risk from a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectRisk {
    pub subject_id: String,
    pub risk: Option<f64>,
    pub confidence: Option<f64>,
    /// Set when this subject could not be scored.
    pub error: Option<String>,
}

impl SubjectRisk {
    fn from_job(subject_id: String, job: &Job) -> Self {
        let scored = job
            .result
            .clone()
            .map(serde_json::from_value::<PredictionResult>);
        match (scored, &job.error) {
            (Some(Ok(prediction)), _) => Self {
                subject_id,
                risk: Some(prediction.predicted_value),
                confidence: Some(prediction.confidence_level),
                error: None,
            },
            (Some(Err(e)), _) => Self::failed(subject_id, format!("malformed prediction: {e}")),
            (None, Some(failure)) => Self::failed(subject_id, failure.message.clone()),
            (None, None) => Self::failed(subject_id, format!("job ended {}", job.status)),
        }
    }

    fn failed(subject_id: String, error: String) -> Self {
        Self {
            subject_id,
            risk: None,
            confidence: None,
            error: Some(error),
        }
    }
}

/// Builder for [`ProcessingEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    computations: HashMap<JobKind, Arc<dyn Computation>>,
    scorers: HashMap<ModelKind, Arc<dyn Scorer>>,
    trainer: Option<Arc<dyn Trainer>>,
    store: Option<Arc<dyn RecordStore>>,
    probe: Option<Arc<dyn HealthProbe>>,
    order: Option<SchedulingOrder>,
}

impl EngineBuilder {
    /// Replace the computation for a job kind.
    pub fn computation(mut self, kind: JobKind, computation: Arc<dyn Computation>) -> Self {
        self.computations.insert(kind, computation);
        self
    }

    pub fn scorer(mut self, kind: ModelKind, scorer: Arc<dyn Scorer>) -> Self {
        self.scorers.insert(kind, scorer);
        self
    }

    pub fn trainer(mut self, trainer: Arc<dyn Trainer>) -> Self {
        self.trainer = Some(trainer);
        self
    }

    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Reorder pending jobs. FIFO when unset.
    pub fn scheduling_order<F>(mut self, order: F) -> Self
    where
        F: Fn(&Job, &Job) -> Ordering + Send + Sync + 'static,
    {
        self.order = Some(Arc::new(order));
        self
    }

    pub fn build(self) -> Result<ProcessingEngine> {
        let config = self.config;
        config.validate()?;

        let cache = Arc::new(ResultCache::from_config(&config));
        let monitor = Arc::new(ExecutionMonitor::from_config(&config));
        let detector = Arc::new(AnomalyDetector::new(config.anomaly_confidence_threshold));

        let mut registry = ModelRegistry::new(config.prediction_validity());
        for (kind, scorer) in self.scorers {
            registry = registry.with_scorer(kind, scorer);
        }
        if let Some(trainer) = self.trainer {
            registry = registry.with_trainer(trainer);
        }
        if let Some(ref store) = self.store {
            registry = registry.with_store(Arc::clone(store));
        }
        let registry = Arc::new(registry);

        let mut computations = self.computations;
        computations
            .entry(JobKind::Calculation)
            .or_insert_with(|| Arc::new(WeightedAverage) as Arc<dyn Computation>);
        computations
            .entry(JobKind::Prediction)
            .or_insert_with(|| {
                Arc::new(PredictionComputation::new(Arc::clone(&registry))) as Arc<dyn Computation>
            });
        computations.entry(JobKind::AnomalyDetection).or_insert_with(|| {
            Arc::new(AnomalyScanComputation::new(
                Arc::clone(&detector),
                self.store.clone(),
            )) as Arc<dyn Computation>
        });
        let mut kinds: Vec<&str> = computations.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shutdown = CancellationToken::new();
        let queue = JobQueue::new(
            QueueSettings {
                max_concurrency: config.max_concurrency,
                order: self.order,
                default_deadline: config.job_timeout(),
            },
            Arc::clone(&cache),
            Arc::clone(&monitor),
            computations,
            events.clone(),
            shutdown.clone(),
        );

        let probe = self.probe.unwrap_or_else(|| {
            Arc::new(QueueProbe {
                queue: queue.clone(),
            }) as Arc<dyn HealthProbe>
        });

        info!(
            max_concurrency = config.max_concurrency,
            kinds = ?kinds,
            persistence = self.store.is_some(),
            "processing engine ready"
        );

        Ok(ProcessingEngine {
            config,
            queue,
            cache,
            monitor,
            detector,
            registry,
            store: self.store,
            probe,
            events,
            shutdown,
        })
    }
}

pub struct ProcessingEngine {
    config: EngineConfig,
    queue: JobQueue,
    cache: Arc<ResultCache>,
    monitor: Arc<ExecutionMonitor>,
    detector: Arc<AnomalyDetector>,
    registry: Arc<ModelRegistry>,
    store: Option<Arc<dyn RecordStore>>,
    probe: Arc<dyn HealthProbe>,
    events: broadcast::Sender<EngineEvent>,
    shutdown: CancellationToken,
}

impl ProcessingEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            computations: HashMap::new(),
            scorers: HashMap::new(),
            trainer: None,
            store: None,
            probe: None,
            order: None,
        }
    }

    /// Engine with the built-in computations and no collaborators.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn monitor(&self) -> &ExecutionMonitor {
        &self.monitor
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    // -- jobs ---------------------------------------------------------------

    pub fn submit(&self, request: JobRequest) -> Result<SubmitResult> {
        self.queue.submit(request)
    }

    /// Submit and wait for the job (or the in-flight job it merged into).
    pub async fn run(&self, request: JobRequest) -> Result<Job> {
        let submitted = self.queue.submit(request)?;
        self.queue.wait(submitted.job_id()).await
    }

    pub async fn wait(&self, job_id: JobId) -> Result<Job> {
        self.queue.wait(job_id).await
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<Job> {
        self.queue.cancel(job_id).await
    }

    pub fn job(&self, job_id: JobId) -> Result<Job> {
        self.queue.get(job_id)
    }

    pub fn jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        self.queue.list(status)
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.queue_status()
    }

    pub fn tick(&self) -> usize {
        self.queue.tick()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // -- cache --------------------------------------------------------------

    /// Drop all cached results. Jobs in flight still write through.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Drop the cached result for one `(kind, parameters)` pair.
    pub fn invalidate(&self, kind: JobKind, parameters: &serde_json::Value) -> bool {
        self.cache.invalidate(&CacheKey::derive(kind, parameters))
    }

    // -- monitoring ---------------------------------------------------------

    pub fn metrics(&self) -> Metrics {
        self.monitor
            .metrics(self.cache.stats(), self.queue.queue_status())
    }

    pub fn errors(&self, limit: usize) -> Vec<ErrorLogEntry> {
        self.monitor.errors(limit)
    }

    pub fn clear_errors(&self) {
        self.monitor.clear_errors();
    }

    /// Zero the cache counters and the execution window.
    pub fn reset_metrics(&self) {
        self.cache.reset_stats();
        self.monitor.reset();
        info!("engine metrics reset");
    }

    pub fn start_monitoring(&self) {
        self.monitor.start();
    }

    pub fn stop_monitoring(&self) {
        self.monitor.stop();
    }

    pub async fn health_check(&self) -> HealthStatus {
        self.monitor.health_check(self.probe.as_ref()).await
    }

    /// Log metrics every `interval`, and persist them when a store is wired
    /// in. Stops on [`shutdown`](Self::shutdown).
    pub fn spawn_metrics_reporter(&self, interval: Duration) -> JoinHandle<()> {
        let monitor = Arc::clone(&self.monitor);
        let cache = Arc::clone(&self.cache);
        let queue = self.queue.clone();
        let store = self.store.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("metrics reporter stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let snapshot = monitor.metrics(cache.stats(), queue.queue_status());
                info!(
                    total = snapshot.total_calculations,
                    success_rate = snapshot.success_rate,
                    error_rate = snapshot.error_rate,
                    avg_ms = snapshot.average_execution_time_ms,
                    cache_hit_rate = snapshot.cache_hit_rate,
                    pending = snapshot.queue_status.pending,
                    running = snapshot.queue_status.running,
                    "engine metrics"
                );
                if let Some(ref store) = store {
                    store::persist(
                        store.as_ref(),
                        RecordKind::PerformanceMetric,
                        "engine",
                        &snapshot,
                    )
                    .await;
                }
            }
        })
    }

    // -- anomalies ----------------------------------------------------------

    /// Scan directly, without going through the queue or the cache.
    pub async fn scan_anomalies(
        &self,
        entity_type: &str,
        observations: &[Observation],
        baseline: &Baseline,
    ) -> Vec<AnomalyRecord> {
        let found = self.detector.scan(entity_type, observations, baseline);
        if let Some(ref store) = self.store {
            for record in &found {
                store::persist(store.as_ref(), RecordKind::Anomaly, &record.entity_id, record)
                    .await;
            }
        }
        found
    }

    pub fn list_anomalies(&self, filter: &AnomalyFilter) -> Vec<AnomalyRecord> {
        self.detector.list(filter)
    }

    pub fn anomaly_summary(&self) -> AnomalySummary {
        self.detector.summary()
    }

    pub fn investigate(&self, id: AnomalyId) -> Result<AnomalyRecord> {
        self.detector.investigate(id)
    }

    pub fn resolve(&self, id: AnomalyId, resolution: impl Into<String>) -> Result<AnomalyRecord> {
        self.detector.resolve(id, resolution)
    }

    pub fn mark_false_positive(&self, id: AnomalyId) -> Result<AnomalyRecord> {
        self.detector.mark_false_positive(id)
    }

    // -- models -------------------------------------------------------------

    pub fn register_model(&self, model: Model) -> Result<()> {
        self.registry.register(model)
    }

    pub fn list_models(&self, filter: &ModelFilter) -> Vec<Model> {
        self.registry.list(filter)
    }

    pub async fn retrain(
        &self,
        model_id: &str,
        training_data: Option<serde_json::Value>,
    ) -> Result<Model> {
        self.registry.retrain(model_id, training_data).await
    }

    /// Score one subject directly, bypassing the queue and the cache.
    pub async fn predict(&self, model_id: &str, subject_id: &str) -> Result<PredictionResult> {
        self.registry.predict(model_id, subject_id).await
    }

    pub fn list_predictions(&self, filter: &PredictionFilter) -> Vec<PredictionResult> {
        self.registry.list_predictions(filter)
    }

    /// Dropout risk for a batch of subjects, one prediction job each.
    ///
    /// Fails up front when no dropout-risk model is active. After that every
    /// subject gets an entry, in input order; per-subject failures land in
    /// [`SubjectRisk::error`].
    pub async fn calculate_dropout_risk<S: AsRef<str>>(
        &self,
        subject_ids: &[S],
    ) -> Result<Vec<SubjectRisk>> {
        let model = self
            .registry
            .active_model(ModelKind::DropoutRisk)
            .ok_or(Error::NoActiveModel(ModelKind::DropoutRisk))?;

        let submitted: Vec<(String, Result<SubmitResult>)> = subject_ids
            .iter()
            .map(|subject| {
                let subject = subject.as_ref().to_string();
                let request =
                    JobRequest::new(JobKind::Prediction, format!("dropout risk {subject}"))
                        .parameters(json!({ "model_id": model.id, "subject_id": subject }));
                (subject, self.queue.submit(request))
            })
            .collect();

        let mut risks = Vec::with_capacity(submitted.len());
        for (subject, submission) in submitted {
            let risk = match submission {
                Ok(result) => match self.queue.wait(result.job_id()).await {
                    Ok(job) => SubjectRisk::from_job(subject, &job),
                    Err(e) => SubjectRisk::failed(subject, e.to_string()),
                },
                Err(e) => SubjectRisk::failed(subject, e.to_string()),
            };
            risks.push(risk);
        }

        info!(
            model_id = %model.id,
            subjects = risks.len(),
            failed = risks.iter().filter(|r| r.error.is_some()).count(),
            "dropout risk batch finished"
        );
        Ok(risks)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Fail pending jobs, cancel running ones, and stop background tasks.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}
