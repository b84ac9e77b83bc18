//! Result cache: keys, TTLs and counters.

use std::time::Duration;

use academic_engine::cache::ResultCache;
use academic_engine::config::EngineConfig;
use academic_engine::model::{CacheKey, JobKind};
use serde_json::json;

#[test]
fn key_ignores_parameter_order_but_not_kind() {
    let params = json!({ "year": "2024", "program": "L1-Math" });
    let a = CacheKey::derive(JobKind::Calculation, &params);
    let reordered = json!({ "program": "L1-Math", "year": "2024" });
    let b = CacheKey::derive(JobKind::Calculation, &reordered);
    let c = CacheKey::derive(JobKind::Prediction, &params);
    let next_year = json!({ "year": "2025", "program": "L1-Math" });
    let d = CacheKey::derive(JobKind::Calculation, &next_year);

    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_ne!(a, d);
    assert_eq!(a.0.len(), 64);
}

#[test]
fn hit_and_miss_counting() {
    let cache = ResultCache::new(Duration::from_secs(60));
    let key = CacheKey::derive(JobKind::Calculation, &json!({ "n": 1 }));

    assert!(cache.get(&key).is_none());
    cache.put(key.clone(), json!({ "average": 13.0 }), Duration::from_secs(60));
    assert_eq!(cache.get(&key), Some(json!({ "average": 13.0 })));
    assert!(cache.contains(&key));

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.hit_rate(), 50.0);
}

#[test]
fn empty_cache_hit_rate_is_zero() {
    let cache = ResultCache::new(Duration::from_secs(60));
    assert_eq!(cache.stats().hit_rate(), 0.0);
}

#[test]
fn expired_entries_are_misses() {
    let cache = ResultCache::new(Duration::from_secs(60));
    let key = CacheKey::derive(JobKind::Calculation, &json!({ "n": 1 }));

    cache.put(key.clone(), json!(1), Duration::ZERO);
    assert!(!cache.contains(&key));
    assert!(cache.get(&key).is_none());
    assert_eq!(cache.stats().misses, 1);
    assert_eq!(cache.stats().entries, 0);
}

#[test]
fn purge_removes_only_expired() {
    let cache = ResultCache::new(Duration::from_secs(60));
    let stale = CacheKey::derive(JobKind::Calculation, &json!({ "n": 1 }));
    let fresh = CacheKey::derive(JobKind::Calculation, &json!({ "n": 2 }));
    cache.put(stale, json!(1), Duration::ZERO);
    cache.put(fresh.clone(), json!(2), Duration::from_secs(60));

    assert_eq!(cache.purge_expired(), 1);
    assert!(cache.contains(&fresh));
}

#[test]
fn clear_keeps_counters_until_reset() {
    let cache = ResultCache::new(Duration::from_secs(60));
    let key = CacheKey::derive(JobKind::Calculation, &json!({ "n": 1 }));
    cache.put(key.clone(), json!(1), Duration::from_secs(60));
    cache.get(&key);

    cache.clear();
    let stats = cache.stats();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.hits, 1);

    cache.reset_stats();
    assert_eq!(cache.stats().hits, 0);
    assert!(!cache.invalidate(&key));
}

#[test]
fn per_kind_ttl_from_config() {
    let config = EngineConfig::default();
    let cache = ResultCache::from_config(&config);

    assert_eq!(cache.ttl_for(JobKind::Calculation), Duration::from_secs(3600));
    assert_eq!(
        cache.ttl_for(JobKind::Prediction),
        Duration::from_secs(30 * 24 * 3600)
    );
}
