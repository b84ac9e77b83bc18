//! Error types for the academic engine.

use thiserror::Error;

use crate::model::job::JobId;
use crate::model::prediction::{ModelKind, ModelStatus};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid job kind: {0}")]
    InvalidJobKind(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("model {id} is not active (status: {status})")]
    ModelNotActive { id: String, status: ModelStatus },

    #[error("no active model of type {0}")]
    NoActiveModel(ModelKind),

    #[error("factor importances must sum to 1.0 (got {sum:.4})")]
    InvalidFactors { sum: f64 },

    #[error("job {0} was cancelled")]
    Cancelled(JobId),

    #[error("job {job_id} timed out after {after_ms}ms")]
    Timeout { job_id: JobId, after_ms: u64 },

    #[error("computation failed: {0}")]
    Computation(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap a collaborator failure, keeping the whole context chain.
    pub fn computation(err: anyhow::Error) -> Self {
        Error::Computation(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
