//! A group of buckets sharing one rate, burst and key template.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::bucket::Bucket;

/// Default interval between idle sweeps of a pool.
pub const DEFAULT_CLEAN_EVERY: Duration = Duration::from_secs(5 * 60);
/// Default time a bucket may go unused before a sweep removes it.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Cleanup schedule shared by every pool of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Minimum time between two sweeps
    pub clean_every: Duration,
    /// Buckets unused for longer than this are swept
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            clean_every: DEFAULT_CLEAN_EVERY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// A rate limit pool: one bucket per key, all with the same rate and burst.
///
/// The bucket map has its own lock, so callers in different pools never
/// contend with each other.
#[derive(Debug)]
pub struct Pool {
    name: String,
    rate: f64,
    burst: u32,
    key_template: String,
    settings: PoolSettings,
    state: RwLock<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    buckets: HashMap<String, Arc<Bucket>>,
    last_clean: Duration,
}

impl Pool {
    pub fn new(
        name: impl Into<String>,
        rate: f64,
        burst: u32,
        key_template: impl Into<String>,
        settings: PoolSettings,
        now: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            rate,
            burst,
            key_template: key_template.into(),
            settings,
            state: RwLock::new(PoolState {
                buckets: HashMap::new(),
                last_clean: now,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    pub fn key_template(&self) -> &str {
        &self.key_template
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.state.read().buckets.len()
    }

    /// The bucket for `key`, if one exists.
    pub fn bucket(&self, key: &str) -> Option<Arc<Bucket>> {
        self.state.read().buckets.get(key).cloned()
    }

    /// Get the bucket for `key`, creating a full one on first access.
    ///
    /// At most one bucket is ever installed per key: a miss on the read path
    /// is re-checked under the write lock before inserting.
    pub fn get_or_create_bucket(&self, key: &str, now: Duration) -> Arc<Bucket> {
        if let Some(bucket) = self.state.read().buckets.get(key) {
            return Arc::clone(bucket);
        }

        let mut state = self.state.write();
        if let Some(bucket) = state.buckets.get(key) {
            return Arc::clone(bucket);
        }

        trace!(pool = %self.name, key = %key, "Creating bucket");
        let bucket = Arc::new(Bucket::new(self.rate, self.burst, now));
        state.buckets.insert(key.to_string(), Arc::clone(&bucket));
        bucket
    }

    /// Sweep idle buckets if the cleanup interval has elapsed.
    ///
    /// Returns the number of buckets removed. When no sweep is due this only
    /// takes the read lock.
    pub fn maybe_cleanup(&self, now: Duration) -> usize {
        if !self.cleanup_due(self.state.read().last_clean, now) {
            return 0;
        }

        let mut state = self.state.write();
        if !self.cleanup_due(state.last_clean, now) {
            return 0;
        }

        self.sweep_locked(&mut state, now)
    }

    /// Remove idle buckets now, regardless of the cleanup schedule.
    pub fn sweep_idle(&self, now: Duration) -> usize {
        let mut state = self.state.write();
        self.sweep_locked(&mut state, now)
    }

    /// Remove every bucket, returning how many there were.
    pub fn reset(&self) -> usize {
        let mut state = self.state.write();
        let cleared = state.buckets.len();
        state.buckets.clear();
        cleared
    }

    /// Remove the bucket for `key`, returning whether it existed.
    pub fn reset_key(&self, key: &str) -> bool {
        self.state.write().buckets.remove(key).is_some()
    }

    fn cleanup_due(&self, last_clean: Duration, now: Duration) -> bool {
        now.saturating_sub(last_clean) > self.settings.clean_every
    }

    fn sweep_locked(&self, state: &mut PoolState, now: Duration) -> usize {
        let cutoff = now.saturating_sub(self.settings.idle_timeout).as_secs();
        let before = state.buckets.len();
        state.buckets.retain(|_, bucket| bucket.last_used() >= cutoff);
        state.last_clean = now;

        let removed = before - state.buckets.len();
        if removed > 0 {
            debug!(
                pool = %self.name,
                removed = removed,
                remaining = state.buckets.len(),
                "Swept idle buckets"
            );
        }
        removed
    }
}
