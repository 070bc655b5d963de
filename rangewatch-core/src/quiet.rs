//! Quiet-period gate
//!
//! One quiet window per analyzer configuration, shared by every subject the
//! configuration covers. When any subject fires, the whole configuration
//! goes quiet, so a storm of crossings across a herd is throttled as a unit.
//!
//! The cache is read before an analyzer runs and written after it fires.
//! Concurrent writers are last-write-wins; a narrow double fire is accepted.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cache key of one configuration's quiet window
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnalyzerKey(String);

impl AnalyzerKey {
    pub fn for_config(config_id: &str) -> Self {
        AnalyzerKey(config_id.to_string())
    }

    pub fn config_id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnalyzerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "analyzer_silent__{}", self.0)
    }
}

/// Minimal key-value contract for the quiet-period state
pub trait QuietPeriodCache: Send + Sync {
    /// Last fire time, None when absent or expired at `now`
    fn get(&self, key: &AnalyzerKey, now: DateTime<Utc>) -> Option<DateTime<Utc>>;

    fn set(&self, key: &AnalyzerKey, fired_at: DateTime<Utc>, ttl: Duration);
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    fired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// In-process quiet-period cache
#[derive(Debug, Default)]
pub struct MemoryQuietCache {
    entries: RwLock<HashMap<AnalyzerKey, Entry>>,
}

impl MemoryQuietCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QuietPeriodCache for MemoryQuietCache {
    fn get(&self, key: &AnalyzerKey, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|e| now < e.expires_at)
            .map(|e| e.fired_at)
    }

    fn set(&self, key: &AnalyzerKey, fired_at: DateTime<Utc>, ttl: Duration) {
        let expires_at = fired_at + to_chrono(ttl);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, e| fired_at < e.expires_at);
        entries.insert(
            key.clone(),
            Entry {
                fired_at,
                expires_at,
            },
        );
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Read-before-fire, write-after-fire wrapper around a [`QuietPeriodCache`]
#[derive(Clone)]
pub struct QuietPeriodGate {
    cache: Arc<dyn QuietPeriodCache>,
}

impl QuietPeriodGate {
    pub fn new(cache: Arc<dyn QuietPeriodCache>) -> Self {
        QuietPeriodGate { cache }
    }

    /// True while `now - last fire < quiet_period`
    pub fn is_quiet(&self, key: &AnalyzerKey, quiet_period: Duration, now: DateTime<Utc>) -> bool {
        if quiet_period.is_zero() {
            return false;
        }
        self.cache
            .get(key, now)
            .is_some_and(|fired_at| now - fired_at < to_chrono(quiet_period))
    }

    /// Start the quiet window. A zero quiet period leaves no entry.
    pub fn mark_fired(&self, key: &AnalyzerKey, quiet_period: Duration, now: DateTime<Utc>) {
        if quiet_period.is_zero() {
            return;
        }
        log::info!("Pausing analyzer with id={}", key.config_id());
        self.cache.set(key, now, quiet_period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 10, 10, 2, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
    }

    #[test]
    fn test_key_display() {
        assert_eq!(AnalyzerKey::for_config("42").to_string(), "analyzer_silent__42");
    }

    #[test]
    fn test_quiet_window() {
        let gate = QuietPeriodGate::new(Arc::new(MemoryQuietCache::new()));
        let key = AnalyzerKey::for_config("cfg");
        let period = Duration::from_secs(9000);

        assert!(!gate.is_quiet(&key, period, t(0)));
        gate.mark_fired(&key, period, t(0));
        assert!(gate.is_quiet(&key, period, t(1)));
        assert!(gate.is_quiet(&key, period, t(149)));
        assert!(!gate.is_quiet(&key, period, t(150)));

        // Other configurations are unaffected
        assert!(!gate.is_quiet(&AnalyzerKey::for_config("other"), period, t(1)));
    }

    #[test]
    fn test_zero_quiet_period_never_quiet() {
        let cache = Arc::new(MemoryQuietCache::new());
        let gate = QuietPeriodGate::new(cache.clone());
        let key = AnalyzerKey::for_config("cfg");
        gate.mark_fired(&key, Duration::ZERO, t(0));
        assert!(cache.get(&key, t(0)).is_none());
        assert!(!gate.is_quiet(&key, Duration::ZERO, t(0)));
    }

    #[test]
    fn test_last_write_wins() {
        let cache = MemoryQuietCache::new();
        let key = AnalyzerKey::for_config("cfg");
        cache.set(&key, t(0), Duration::from_secs(600));
        cache.set(&key, t(5), Duration::from_secs(600));
        assert_eq!(cache.get(&key, t(12)), Some(t(5)));
        assert_eq!(cache.get(&key, t(15)), None);
    }
}
