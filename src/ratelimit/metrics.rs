//! Admission counters and the snapshots exported to operators.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Allowed/denied counters, global and per pool.
///
/// Counters are independent atomics: a snapshot taken while calls are in
/// flight may see the global totals and a pool's counters at slightly
/// different moments.
#[derive(Debug, Default)]
pub struct Metrics {
    allowed: AtomicU64,
    denied: AtomicU64,
    pools: DashMap<String, PoolCounters>,
}

#[derive(Debug, Default)]
struct PoolCounters {
    allowed: AtomicU64,
    denied: AtomicU64,
}

impl PoolCounters {
    fn record(&self, allowed: bool) {
        let counter = if allowed { &self.allowed } else { &self.denied };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `pool` appear in snapshots before it sees traffic.
    pub fn register_pool(&self, pool: &str) {
        if !self.pools.contains_key(pool) {
            self.pools.entry(pool.to_string()).or_default();
        }
    }

    /// Count one admission decision for `pool`.
    pub fn record(&self, pool: &str, allowed: bool) {
        let global = if allowed { &self.allowed } else { &self.denied };
        global.fetch_add(1, Ordering::Relaxed);

        if let Some(counters) = self.pools.get(pool) {
            counters.record(allowed);
            return;
        }
        self.pools.entry(pool.to_string()).or_default().record(allowed);
    }

    pub fn allowed(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }

    pub fn denied(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }

    /// Counters for one pool, with the bucket gauge supplied by the caller.
    pub fn pool_stats(&self, pool: &str, active_buckets: usize) -> PoolStats {
        let (allowed, denied) = self
            .pools
            .get(pool)
            .map(|c| (c.allowed.load(Ordering::Relaxed), c.denied.load(Ordering::Relaxed)))
            .unwrap_or_default();

        PoolStats {
            allowed,
            denied,
            active_buckets,
        }
    }
}

/// Per-pool figures in a [`Snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub allowed: u64,
    pub denied: u64,
    pub active_buckets: usize,
}

/// Point-in-time copy of a limiter's metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub allowed: u64,
    pub denied: u64,
    /// Every realized pool, inline pools under their `_inline:` name
    pub pools: BTreeMap<String, PoolStats>,
}

impl Snapshot {
    pub fn pool(&self, name: &str) -> Option<&PoolStats> {
        self.pools.get(name)
    }

    /// Total live buckets across all pools.
    pub fn active_buckets(&self) -> usize {
        self.pools.values().map(|p| p.active_buckets).sum()
    }
}
