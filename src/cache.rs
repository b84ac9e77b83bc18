//! Result cache.
//!
//! Key -> value memo of completed job results with a TTL per entry. Hit and
//! miss counters are monotonic; `clear()` drops entries but keeps the
//! counters, which only `reset_stats()` zeroes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::debug;

use crate::config::EngineConfig;
use crate::model::job::{CacheKey, JobKind};
use crate::model::metrics::CacheStats;
use crate::telemetry::metrics;

/// One memoized result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

pub struct ResultCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    default_ttl: Duration,
    kind_ttl: HashMap<JobKind, Duration>,
}

impl ResultCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            default_ttl,
            kind_ttl: HashMap::new(),
        }
    }

    /// Build with per-kind TTLs from the engine config.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut cache = Self::new(config.cache_ttl_default());
        for kind in JobKind::ALL {
            cache.kind_ttl.insert(kind, config.cache_ttl_for(kind));
        }
        cache
    }

    /// TTL used for results of the given job kind.
    pub fn ttl_for(&self, kind: JobKind) -> Duration {
        self.kind_ttl.get(&kind).copied().unwrap_or(self.default_ttl)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up an unexpired value. Counts a hit or a miss; expired entries
    /// are evicted and count as misses.
    pub fn get(&self, key: &CacheKey) -> Option<serde_json::Value> {
        let now = Utc::now();
        let value = {
            let mut entries = self.lock();
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
                Some(_) => {
                    entries.remove(key);
                    debug!(key = %key, "cache entry expired");
                    None
                }
                None => None,
            }
        };

        let operation = if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            "hit"
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            "miss"
        };
        metrics::cache_operations().add(1, &[KeyValue::new("operation", operation)]);
        value
    }

    /// Presence check that leaves the counters alone.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = Utc::now();
        self.lock()
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    pub fn put(&self, key: CacheKey, value: serde_json::Value, ttl: Duration) {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = created_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.lock().insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                created_at,
                expires_at,
            },
        );
        metrics::cache_operations().add(1, &[KeyValue::new("operation", "put")]);
    }

    /// Drop one entry. Returns whether it was present.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.lock().remove(key).is_some();
        metrics::cache_operations().add(1, &[KeyValue::new("operation", "invalidate")]);
        removed
    }

    /// Drop every entry. In-flight jobs are unaffected; they write through
    /// when they finish.
    pub fn clear(&self) {
        self.lock().clear();
        metrics::cache_operations().add(1, &[KeyValue::new("operation", "clear")]);
    }

    /// Evict expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.lock().len(),
        }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}
