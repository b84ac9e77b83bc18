//! Outbound persistence for metrics snapshots, predictions and anomalies.
//!
//! The engine works fully in memory; a [`RecordStore`] is optional. Writes
//! go through [`persist`], which logs failures instead of surfacing them.

use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Error;

/// Which collection a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    PerformanceMetric,
    Prediction,
    Anomaly,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::PerformanceMetric => "performance_metric",
            RecordKind::Prediction => "prediction",
            RecordKind::Anomaly => "anomaly",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "performance_metric" => Ok(RecordKind::PerformanceMetric),
            "prediction" => Ok(RecordKind::Prediction),
            "anomaly" => Ok(RecordKind::Anomaly),
            other => Err(Error::Other(format!("unknown record kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub kind: RecordKind,
    /// Subject, entity or source the record is about.
    pub key: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl StoredRecord {
    pub fn new(kind: RecordKind, key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            key: key.into(),
            payload,
            recorded_at: Utc::now(),
        }
    }
}

/// Query filters. `None` matches everything. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub kind: Option<RecordKind>,
    pub key: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    fn matches(&self, record: &StoredRecord) -> bool {
        self.kind.is_none_or(|k| record.kind == k)
            && self.key.as_deref().is_none_or(|k| record.key == k)
            && self.since.is_none_or(|t| record.recorded_at >= t)
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(&self, record: StoredRecord) -> anyhow::Result<()>;
    async fn query(&self, filter: &RecordFilter) -> anyhow::Result<Vec<StoredRecord>>;
}

/// Serialize `payload` and insert it, logging instead of failing.
pub async fn persist<T>(store: &dyn RecordStore, kind: RecordKind, key: &str, payload: &T)
where
    T: Serialize + Sync,
{
    let payload = match serde_json::to_value(payload) {
        Ok(v) => v,
        Err(e) => {
            warn!(%kind, key, "cannot encode record: {e}");
            return;
        }
    };
    match store.insert(StoredRecord::new(kind, key, payload)).await {
        Ok(()) => debug!(%kind, key, "record persisted"),
        Err(e) => warn!(%kind, key, error = %format!("{e:#}"), "record store insert failed"),
    }
}

/// Process-local store, mostly for tests and single-binary deployments.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<StoredRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, record: StoredRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }

    async fn query(&self, filter: &RecordFilter) -> anyhow::Result<Vec<StoredRecord>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<StoredRecord> = records
            .iter()
            .rev()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}
