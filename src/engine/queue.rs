//! Job queue manager: submission, scheduling, cancellation, completion.
//!
//! All job state lives behind one mutex. Lock order is queue, then cache;
//! the monitor and event channels are only touched after the queue lock is
//! released.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, warn};

use crate::cache::ResultCache;
use crate::error::{Error, Result};
use crate::event::EngineEvent;
use crate::model::job::*;
use crate::model::metrics::{ExecutionRecord, QueueStatus};
use crate::monitor::ExecutionMonitor;
use crate::telemetry::job::record_state_transition;
use crate::telemetry::metrics;

use super::computation::Computation;
use super::worker;

/// Comparator over pending jobs. The smallest job runs next; ties keep
/// submission order.
pub type SchedulingOrder = Arc<dyn Fn(&Job, &Job) -> Ordering + Send + Sync>;

/// Result of submitting a job.
#[derive(Debug, Clone)]
pub enum SubmitResult {
    /// Queued for execution. The job is a snapshot taken at submission.
    Scheduled(Job),
    /// Completed immediately from the result cache.
    Cached(Job),
    /// An identical job is already in flight; await that one.
    Merged { job_id: JobId },
}

impl SubmitResult {
    pub fn job_id(&self) -> JobId {
        match self {
            SubmitResult::Scheduled(job) | SubmitResult::Cached(job) => job.id,
            SubmitResult::Merged { job_id } => *job_id,
        }
    }
}

pub(crate) struct QueueSettings {
    pub max_concurrency: usize,
    pub order: Option<SchedulingOrder>,
    pub default_deadline: Option<Duration>,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    /// Scheduled jobs in submission order.
    pending: VecDeque<JobId>,
    /// Running jobs and the token that stops them.
    running: HashMap<JobId, CancellationToken>,
    /// Cache key -> the scheduled or running job computing it.
    in_flight: HashMap<CacheKey, JobId>,
}

pub(crate) struct Shared {
    state: Mutex<QueueState>,
    cache: Arc<ResultCache>,
    monitor: Arc<ExecutionMonitor>,
    computations: HashMap<JobKind, Arc<dyn Computation>>,
    settings: QueueSettings,
    changed: watch::Sender<()>,
    events: broadcast::Sender<EngineEvent>,
    shutdown: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: EngineEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn report_progress(&self, job_id: JobId, percent: u8) {
        let percent = percent.min(99);
        let mut state = self.lock();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            if job.status == JobStatus::Running && percent > job.progress {
                job.progress = percent;
                job.updated_at = Utc::now();
            }
        }
    }
}

/// Move a job to `to`, rejecting transitions the lifecycle forbids.
fn transition(job: &mut Job, to: JobStatus) -> Result<()> {
    if !job.status.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            from: job.status.to_string(),
            to: to.to_string(),
        });
    }
    metrics::job_state_transitions().add(
        1,
        &[
            KeyValue::new("from", job.status.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
    job.status = to;
    job.updated_at = Utc::now();
    Ok(())
}

fn mark_terminal(job: &mut Job) {
    let now = Utc::now();
    job.progress = 100;
    job.completed_at = Some(now);
    job.duration_ms = Some(
        job.started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64)
            .unwrap_or(0),
    );
}

enum CancelAction {
    Dequeued(Job),
    Signal(Option<CancellationToken>),
}

/// Handle to the job queue. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<Shared>,
}

impl JobQueue {
    pub(crate) fn new(
        settings: QueueSettings,
        cache: Arc<ResultCache>,
        monitor: Arc<ExecutionMonitor>,
        computations: HashMap<JobKind, Arc<dyn Computation>>,
        events: broadcast::Sender<EngineEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let (changed, _) = watch::channel(());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                cache,
                monitor,
                computations,
                settings,
                changed,
                events,
                shutdown,
            }),
        }
    }

    pub(crate) fn computation(&self, kind: JobKind) -> Option<Arc<dyn Computation>> {
        self.shared.computations.get(&kind).cloned()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn max_concurrency(&self) -> usize {
        self.shared.settings.max_concurrency
    }

    /// Submit a job. Never blocks on execution.
    ///
    /// A fresh cached result completes the job on the spot. An identical job
    /// already in flight absorbs the submission. Otherwise the job is
    /// scheduled and workers are started up to the concurrency cap, which
    /// needs a Tokio runtime.
    pub fn submit(&self, request: JobRequest) -> Result<SubmitResult> {
        let kind: JobKind = request.kind.parse()?;
        if !self.shared.computations.contains_key(&kind) {
            self.count_submission(kind, "rejected");
            return Err(Error::InvalidJobKind(format!(
                "{kind} (no computation registered)"
            )));
        }
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::Other("job queue is shut down".into()));
        }

        let key = CacheKey::derive(kind, &request.parameters);
        let mut job = Job::new(&request, kind, key.clone());
        if job.deadline_ms.is_none() {
            job.deadline_ms = self
                .shared
                .settings
                .default_deadline
                .map(|d| d.as_millis() as u64);
        }

        let mut guard = self.shared.lock();
        let state = &mut *guard;

        if let Some(&job_id) = state.in_flight.get(&key) {
            drop(guard);
            debug!(%job_id, %key, "merged into in-flight job");
            self.count_submission(kind, "merged");
            self.shared.emit(EngineEvent::Merged { job_id, kind });
            return Ok(SubmitResult::Merged { job_id });
        }

        if let Some(value) = self.shared.cache.get(&key) {
            transition(&mut job, JobStatus::Completed)?;
            job.result = Some(value);
            job.from_cache = true;
            job.started_at = Some(job.created_at);
            mark_terminal(&mut job);
            state.jobs.insert(job.id, job.clone());
            drop(guard);

            info!(job_id = %job.id, %kind, %key, "served from cache");
            self.count_submission(kind, "cache_hit");
            self.shared.emit(EngineEvent::CacheHit {
                job_id: job.id,
                kind,
            });
            self.shared.changed.send_replace(());
            return Ok(SubmitResult::Cached(job));
        }

        transition(&mut job, JobStatus::Scheduled)?;
        state.jobs.insert(job.id, job.clone());
        state.pending.push_back(job.id);
        state.in_flight.insert(key, job.id);
        drop(guard);

        info!(job_id = %job.id, %kind, name = %job.name, "job scheduled");
        self.count_submission(kind, "scheduled");
        self.shared.emit(EngineEvent::Submitted {
            job_id: job.id,
            kind,
        });
        self.tick();
        Ok(SubmitResult::Scheduled(job))
    }

    fn count_submission(&self, kind: JobKind, result: &'static str) {
        metrics::jobs_submitted().add(
            1,
            &[
                KeyValue::new("kind", kind.as_str()),
                KeyValue::new("result", result),
            ],
        );
    }

    /// Start pending jobs while worker slots are free. Returns how many
    /// started.
    ///
    /// Runs automatically on submission and completion; calling it by hand is
    /// harmless.
    pub fn tick(&self) -> usize {
        if self.shared.shutdown.is_cancelled() {
            return 0;
        }

        let mut launched = Vec::new();
        {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            while state.running.len() < self.shared.settings.max_concurrency {
                let Some(index) = self.next_pending(state) else {
                    break;
                };
                let Some(job_id) = state.pending.remove(index) else {
                    break;
                };
                let Some(job) = state.jobs.get_mut(&job_id) else {
                    continue;
                };
                if let Err(e) = transition(job, JobStatus::Running) {
                    warn!(%job_id, "cannot start job: {e}");
                    continue;
                }
                job.started_at = Some(Utc::now());
                job.progress = 0;

                let cancel = self.shared.shutdown.child_token();
                state.running.insert(job_id, cancel.clone());
                launched.push((job.clone(), cancel));
            }
        }

        let count = launched.len();
        for (job, cancel) in launched {
            debug!(job_id = %job.id, kind = %job.kind, "job started");
            self.shared.emit(EngineEvent::Started {
                job_id: job.id,
                kind: job.kind,
            });
            worker::spawn(self.clone(), job, cancel);
        }
        count
    }

    /// Index into `pending` of the job to run next.
    fn next_pending(&self, state: &QueueState) -> Option<usize> {
        if state.pending.is_empty() {
            return None;
        }
        let Some(ref order) = self.shared.settings.order else {
            return Some(0);
        };
        // min_by keeps the first of equal elements, so ties stay FIFO.
        state
            .pending
            .iter()
            .enumerate()
            .filter_map(|(i, id)| state.jobs.get(id).map(|job| (i, job)))
            .min_by(|(_, a), (_, b)| order(a, b))
            .map(|(i, _)| i)
            .or(Some(0))
    }

    /// Record a worker's outcome. Called once per started job.
    pub(crate) fn finish(&self, job_id: JobId, outcome: Result<serde_json::Value>, span: &Span) {
        let finished = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            state.running.remove(&job_id);

            match state.jobs.get_mut(&job_id) {
                Some(job) if job.status == JobStatus::Running => {
                    let applied = match outcome {
                        Ok(value) => transition(job, JobStatus::Completed).map(|()| {
                            self.shared.cache.put(
                                job.cache_key.clone(),
                                value.clone(),
                                self.shared.cache.ttl_for(job.kind),
                            );
                            job.result = Some(value);
                        }),
                        Err(err) => transition(job, JobStatus::Failed).map(|()| {
                            job.error = Some(JobFailure::from_error(&err));
                        }),
                    };
                    match applied {
                        Ok(()) => {
                            mark_terminal(job);
                            if state.in_flight.get(&job.cache_key) == Some(&job_id) {
                                state.in_flight.remove(&job.cache_key);
                            }
                            Some(job.clone())
                        }
                        Err(e) => {
                            warn!(%job_id, "cannot finish job: {e}");
                            None
                        }
                    }
                }
                Some(job) => {
                    debug!(%job_id, status = %job.status, "discarding late result");
                    None
                }
                None => {
                    debug!(%job_id, "result for unknown job discarded");
                    None
                }
            }
        };

        if let Some(job) = finished {
            self.report_finished(&job, JobStatus::Running, span);
            self.shared.changed.send_replace(());
        }
        self.tick();
    }

    fn report_finished(&self, job: &Job, from: JobStatus, span: &Span) {
        let duration_ms = job.duration_ms.unwrap_or(0);
        record_state_transition(span, from.as_str(), job.status.as_str());

        match job.error {
            None => {
                info!(job_id = %job.id, kind = %job.kind, duration_ms, "job completed");
                self.shared
                    .monitor
                    .record(ExecutionRecord::success(job.id, job.kind, duration_ms));
                self.shared.emit(EngineEvent::Completed {
                    job_id: job.id,
                    kind: job.kind,
                    duration_ms,
                });
            }
            Some(ref failure) => {
                warn!(
                    job_id = %job.id,
                    kind = %job.kind,
                    failure = %failure.kind,
                    error = %failure.message,
                    duration_ms,
                    "job failed"
                );
                self.shared.monitor.record(ExecutionRecord::failed(
                    job.id,
                    job.kind,
                    failure.kind,
                    duration_ms,
                    failure.message.clone(),
                ));
                self.shared.emit(EngineEvent::Failed {
                    job_id: job.id,
                    kind: job.kind,
                    failure: failure.kind,
                    message: failure.message.clone(),
                });
            }
        }
    }

    /// Cancel a scheduled or running job and return it once it has failed.
    ///
    /// A scheduled job is dequeued on the spot. A running job is signalled
    /// and this waits for the worker to acknowledge; a computation that never
    /// yields keeps running detached, but its result is discarded.
    pub async fn cancel(&self, job_id: JobId) -> Result<Job> {
        let action = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or(Error::JobNotFound(job_id))?;

            match job.status {
                JobStatus::Scheduled => {
                    transition(job, JobStatus::Failed)?;
                    job.error = Some(JobFailure::from_error(&Error::Cancelled(job_id)));
                    mark_terminal(job);
                    state.pending.retain(|id| *id != job_id);
                    if state.in_flight.get(&job.cache_key) == Some(&job_id) {
                        state.in_flight.remove(&job.cache_key);
                    }
                    CancelAction::Dequeued(job.clone())
                }
                JobStatus::Running => CancelAction::Signal(state.running.get(&job_id).cloned()),
                other => {
                    return Err(Error::InvalidTransition {
                        from: other.to_string(),
                        to: JobStatus::Failed.to_string(),
                    });
                }
            }
        };

        match action {
            CancelAction::Dequeued(job) => {
                info!(%job_id, "scheduled job cancelled");
                self.report_finished(&job, JobStatus::Scheduled, &Span::none());
                self.shared.changed.send_replace(());
                Ok(job)
            }
            CancelAction::Signal(token) => {
                info!(%job_id, "cancelling running job");
                if let Some(token) = token {
                    token.cancel();
                }
                self.wait(job_id).await
            }
        }
    }

    /// Resolve once the job is terminal.
    pub async fn wait(&self, job_id: JobId) -> Result<Job> {
        let mut changed = self.shared.changed.subscribe();
        loop {
            let job = self.get(job_id)?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            if changed.changed().await.is_err() {
                return Err(Error::Other("job queue dropped".into()));
            }
        }
    }

    pub fn get(&self, job_id: JobId) -> Result<Job> {
        self.shared
            .lock()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(Error::JobNotFound(job_id))
    }

    /// Jobs in creation order, optionally only those with `status`.
    pub fn list(&self, status: Option<JobStatus>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .shared
            .lock()
            .jobs
            .values()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    /// Consistent snapshot taken under one lock.
    pub fn queue_status(&self) -> QueueStatus {
        let state = self.shared.lock();
        QueueStatus {
            pending: state.pending.len(),
            running: state.running.len(),
            total: state.jobs.len(),
        }
    }

    /// Forget terminal jobs that finished more than `older_than` ago.
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        let age = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
            return 0;
        };
        let mut state = self.shared.lock();
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.completed_at.is_some_and(|t| t < cutoff))
        });
        let pruned = before - state.jobs.len();
        if pruned > 0 {
            debug!(pruned, "pruned finished jobs");
        }
        pruned
    }

    /// Stop accepting work, fail every pending job as cancelled, and signal
    /// running jobs to stop.
    pub fn shutdown(&self) {
        let drained = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            let mut drained = Vec::new();
            while let Some(job_id) = state.pending.pop_front() {
                let Some(job) = state.jobs.get_mut(&job_id) else {
                    continue;
                };
                if transition(job, JobStatus::Failed).is_err() {
                    continue;
                }
                job.error = Some(JobFailure::from_error(&Error::Cancelled(job_id)));
                mark_terminal(job);
                state.in_flight.remove(&job.cache_key);
                drained.push(job.clone());
            }
            drained
        };

        self.shared.shutdown.cancel();
        info!(drained = drained.len(), "job queue shutting down");
        for job in &drained {
            self.report_finished(job, JobStatus::Scheduled, &Span::none());
        }
        self.shared.changed.send_replace(());
    }
}
