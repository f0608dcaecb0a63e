//! Time-bounded cache of session parameters keyed by bearer token.
//!
//! Bearer callers present the same token on every request; deriving fresh
//! session parameters each time would mean one introspection call per
//! request. This cache keeps the derived parameters for a short window.
//! It is never the authority on token validity, only a shortcut past
//! redundant upstream calls.

use crate::session::SessionParams;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

fn default_interval_seconds() -> i64 {
    600
}

fn default_cleaning_interval_seconds() -> i64 {
    60
}

fn default_reset_on_get() -> bool {
    true
}

/// Tuning knobs for the bearer token cache.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// How long an untouched entry stays retrievable.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: i64,
    /// Minimum spacing between sweep passes over the whole map.
    #[serde(default = "default_cleaning_interval_seconds")]
    pub cleaning_interval_seconds: i64,
    /// Whether reading an entry restarts its idle timer.
    #[serde(default = "default_reset_on_get")]
    pub reset_on_get: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            cleaning_interval_seconds: default_cleaning_interval_seconds(),
            reset_on_get: default_reset_on_get(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    params: SessionParams,
    last_touch: DateTime<Utc>,
}

#[derive(Debug)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    last_cleaned: DateTime<Utc>,
}

/// Shared, time-bounded map from access token to [`SessionParams`].
///
/// Cloning shares the underlying map; the provider hands clones to every
/// request. Writes are last-write-wins; concurrent refreshes of the same
/// token may both hit upstream, which is acceptable because the result is
/// idempotent.
#[derive(Debug, Clone)]
pub struct BearerTokenCache {
    config: CacheConfig,
    inner: Arc<RwLock<CacheState>>,
}

impl BearerTokenCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Arc::new(RwLock::new(CacheState {
                entries: HashMap::new(),
                last_cleaned: Utc::now(),
            })),
        }
    }

    /// Looks up the parameters cached for a token.
    ///
    /// An entry idle for longer than the configured interval is treated as
    /// absent and dropped. Opportunistically sweeps the map, at most once
    /// per cleaning interval.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<SessionParams> {
        let now = Utc::now();
        let mut state = self.inner.write().unwrap();
        self.sweep(&mut state, now);

        let expired = match state.entries.get(key) {
            Some(entry) => now - entry.last_touch > self.interval(),
            None => return None,
        };
        if expired {
            state.entries.remove(key);
            return None;
        }

        let entry = state.entries.get_mut(key)?;
        if self.config.reset_on_get {
            entry.last_touch = now;
        }
        Some(entry.params.clone())
    }

    /// Stores (or overwrites) the parameters for a token.
    pub fn set(&self, key: impl Into<String>, params: SessionParams) {
        let now = Utc::now();
        let mut state = self.inner.write().unwrap();
        self.sweep(&mut state, now);
        state.entries.insert(
            key.into(),
            CacheEntry {
                params,
                last_touch: now,
            },
        );
    }

    /// Drops a token's entry, if present.
    pub fn remove(&self, key: &str) {
        self.inner.write().unwrap().entries.remove(key);
    }

    /// Number of entries currently held, including not-yet-swept stale
    /// ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn interval(&self) -> Duration {
        Duration::seconds(self.config.interval_seconds)
    }

    fn sweep(&self, state: &mut CacheState, now: DateTime<Utc>) {
        if now - state.last_cleaned < Duration::seconds(self.config.cleaning_interval_seconds) {
            return;
        }
        let interval = self.interval();
        state
            .entries
            .retain(|_, entry| now - entry.last_touch <= interval);
        state.last_cleaned = now;
    }

    /// Rewinds an entry's idle timer, as if it had last been touched
    /// `by` ago.
    #[cfg(test)]
    fn backdate(&self, key: &str, by: Duration) {
        let mut state = self.inner.write().unwrap();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.last_touch -= by;
        }
    }

    /// Rewinds the sweep clock so the next access runs a sweep.
    #[cfg(test)]
    fn force_next_sweep(&self) {
        let mut state = self.inner.write().unwrap();
        state.last_cleaned -= Duration::seconds(self.config.cleaning_interval_seconds + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(token: &str) -> SessionParams {
        SessionParams::from_bearer_token(token)
    }

    fn cache(interval: i64, reset_on_get: bool) -> BearerTokenCache {
        BearerTokenCache::new(CacheConfig {
            interval_seconds: interval,
            cleaning_interval_seconds: 60,
            reset_on_get,
        })
    }

    #[test]
    fn fresh_entries_are_retrievable() {
        let cache = cache(600, true);
        cache.set("at-1", params("at-1"));

        let got = cache.get("at-1").expect("cached");
        assert_eq!(got.access_token.as_deref(), Some("at-1"));
        assert!(cache.get("other").is_none());
    }

    #[test]
    fn idle_entries_expire_without_get_reset() {
        let cache = cache(600, false);
        cache.set("at-1", params("at-1"));

        // Just inside the window.
        cache.backdate("at-1", Duration::seconds(599));
        assert!(cache.get("at-1").is_some());

        // Just past it.
        cache.backdate("at-1", Duration::seconds(2));
        assert!(cache.get("at-1").is_none());
        // The stale entry was dropped on read.
        assert!(cache.is_empty());
    }

    #[test]
    fn reset_on_get_extends_the_window() {
        let cache = cache(600, true);
        cache.set("at-1", params("at-1"));

        cache.backdate("at-1", Duration::seconds(599));
        assert!(cache.get("at-1").is_some());

        // The read above restarted the timer, so another near-full idle
        // period still finds the entry.
        cache.backdate("at-1", Duration::seconds(599));
        assert!(cache.get("at-1").is_some());
    }

    #[test]
    fn sweep_is_rate_limited() {
        let cache = cache(600, false);
        cache.set("stale", params("stale"));
        cache.set("fresh", params("fresh"));
        cache.backdate("stale", Duration::seconds(601));

        // No sweep yet (cleaning interval has not elapsed), so the stale
        // entry still occupies a slot even though get() won't return it.
        cache.set("more", params("more"));
        assert_eq!(cache.len(), 3);

        cache.force_next_sweep();
        cache.set("another", params("another"));
        assert_eq!(cache.len(), 3); // stale swept, more + fresh + another
        assert!(cache.get("fresh").is_some());
    }

    #[test]
    fn remove_and_overwrite() {
        let cache = cache(600, true);
        cache.set("at-1", params("old"));
        cache.set("at-1", params("new"));
        assert_eq!(
            cache.get("at-1").expect("cached").access_token.as_deref(),
            Some("new")
        );

        cache.remove("at-1");
        assert!(cache.get("at-1").is_none());
    }

    #[test]
    fn clones_share_state() {
        let cache = cache(600, true);
        let clone = cache.clone();
        cache.set("at-1", params("at-1"));
        assert!(clone.get("at-1").is_some());
    }
}
