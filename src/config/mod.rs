//! Typed configuration.
//!
//! `Config` is loaded once at startup from environment variables. Engine
//! knobs live in [`EngineConfig`], which can also come from a TOML file named
//! by `ENGINE_CONFIG`; environment variables override the file.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::job::JobKind;

const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug)]
pub struct Config {
    /// Postgres URL for the optional record store.
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            engine: EngineConfig::from_env()?,
        })
    }
}

/// Tuning for the processing engine. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker slots.
    pub max_concurrency: usize,
    pub cache_ttl_default_secs: u64,
    pub error_log_capacity: usize,
    pub metrics_window_secs: u64,
    pub anomaly_confidence_threshold: f64,
    pub health_check_timeout_ms: u64,
    /// Default deadline for jobs that don't set one.
    pub job_timeout_secs: Option<u64>,
    pub prediction_validity_secs: u64,
    /// Per job kind TTL overrides, keyed by kind name. Kept last so it
    /// serializes as a trailing TOML table.
    pub cache_ttl_secs: BTreeMap<String, u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            cache_ttl_default_secs: 60 * 60,
            error_log_capacity: 100,
            metrics_window_secs: DAY_SECS,
            anomaly_confidence_threshold: 0.8,
            health_check_timeout_ms: 5_000,
            job_timeout_secs: None,
            prediction_validity_secs: 30 * DAY_SECS,
            cache_ttl_secs: BTreeMap::from([(JobKind::Prediction.to_string(), 30 * DAY_SECS)]),
        }
    }
}

impl EngineConfig {
    /// Defaults, overlaid by the `ENGINE_CONFIG` file, overlaid by `ENGINE_*` vars.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("ENGINE_CONFIG") {
            Ok(path) => Self::load(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Some(v) = parse_var("ENGINE_MAX_CONCURRENCY")? {
            config.max_concurrency = v;
        }
        if let Some(v) = parse_var("ENGINE_CACHE_TTL_SECS")? {
            config.cache_ttl_default_secs = v;
        }
        if let Some(v) = parse_var("ENGINE_ERROR_LOG_CAPACITY")? {
            config.error_log_capacity = v;
        }
        if let Some(v) = parse_var("ENGINE_METRICS_WINDOW_SECS")? {
            config.metrics_window_secs = v;
        }
        if let Some(v) = parse_var("ENGINE_ANOMALY_CONFIDENCE_THRESHOLD")? {
            config.anomaly_confidence_threshold = v;
        }
        if let Some(v) = parse_var("ENGINE_HEALTH_CHECK_TIMEOUT_MS")? {
            config.health_check_timeout_ms = v;
        }
        if let Some(v) = parse_var("ENGINE_JOB_TIMEOUT_SECS")? {
            config.job_timeout_secs = Some(v);
        }
        if let Some(v) = parse_var("ENGINE_PREDICTION_VALIDITY_SECS")? {
            config.prediction_validity_secs = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read engine config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad engine config {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be at least 1".into()));
        }
        if self.error_log_capacity == 0 {
            return Err(Error::Config("error_log_capacity must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.anomaly_confidence_threshold) {
            return Err(Error::Config(format!(
                "anomaly_confidence_threshold must be within [0, 1], got {}",
                self.anomaly_confidence_threshold
            )));
        }
        for kind in self.cache_ttl_secs.keys() {
            JobKind::from_str(kind)
                .map_err(|_| Error::Config(format!("cache_ttl_secs: unknown job kind {kind}")))?;
        }
        Ok(())
    }

    pub fn cache_ttl_default(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_default_secs)
    }

    /// TTL for cached results of the given kind.
    pub fn cache_ttl_for(&self, kind: JobKind) -> Duration {
        self.cache_ttl_secs
            .get(kind.as_str())
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or_else(|| self.cache_ttl_default())
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::from_secs(self.metrics_window_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }

    pub fn prediction_validity(&self) -> Duration {
        Duration::from_secs(self.prediction_validity_secs)
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}
