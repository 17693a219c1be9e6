//! The admission limiter.
//!
//! A [`Limiter`] owns the named pools declared in configuration and the inline
//! pools created on demand from per-call limit declarations. Each call to
//! [`Limiter::allow`] evaluates a list of limits in order and stops at the
//! first one that denies or fails.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::error::{LimiterError, Result};
use crate::template::{RequestContext, TemplateEngine, Usage};

use super::bucket::schedule;
use super::clock::{Clock, SystemClock};
use super::limit::{
    inline_pool_name, InlineSpec, LimitKind, LimitRef, PoolConfig, INLINE_POOL_PREFIX,
};
use super::metrics::{Metrics, Snapshot};
use super::pool::{Pool, PoolSettings};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Every limit had capacity
    Allowed,
    /// A limit ran out of tokens; retry no earlier than `retry_after`
    Denied { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    /// Zero when allowed.
    pub fn retry_after(&self) -> Duration {
        match self {
            Decision::Allowed => Duration::ZERO,
            Decision::Denied { retry_after } => *retry_after,
        }
    }

    /// Value for an HTTP `Retry-After` header, in whole seconds.
    pub fn retry_after_header(&self) -> Option<String> {
        match self {
            Decision::Allowed => None,
            Decision::Denied { retry_after } => Some(retry_after.as_secs().to_string()),
        }
    }
}

/// Retry-after for a token that becomes valid after `delay`.
///
/// The delay is rounded up to whole seconds and one more second is added, so
/// a client honouring an integer `Retry-After` never comes back early.
pub fn retry_after_for(delay: Duration) -> Duration {
    let mut secs = delay.as_secs();
    if delay.subsec_nanos() > 0 {
        secs = secs.saturating_add(1);
    }
    Duration::from_secs(secs.saturating_add(1))
}

/// Builder for a [`Limiter`] with a custom clock or cleanup schedule.
pub struct LimiterBuilder {
    engine: Arc<dyn TemplateEngine>,
    clock: Arc<dyn Clock>,
    settings: PoolSettings,
    pools: Vec<PoolConfig>,
}

impl LimiterBuilder {
    pub fn pools(mut self, pools: impl IntoIterator<Item = PoolConfig>) -> Self {
        self.pools.extend(pools);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(mut self, settings: PoolSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Validate every pool configuration and build the limiter.
    ///
    /// Fails on the first invalid configuration; no limiter is returned in
    /// that case.
    pub fn build(self) -> Result<Limiter> {
        let mut seen = HashSet::new();
        for (index, config) in self.pools.iter().enumerate() {
            validate_pool_config(index, config, &mut seen, self.engine.as_ref())?;
        }

        let now = self.clock.now();
        let metrics = Metrics::new();
        let pools: HashMap<String, Arc<Pool>> = self
            .pools
            .into_iter()
            .map(|config| {
                metrics.register_pool(&config.name);
                let pool = Pool::new(
                    config.name.clone(),
                    config.requests_per_second,
                    config.burst,
                    config.key_template,
                    self.settings,
                    now,
                );
                (config.name, Arc::new(pool))
            })
            .collect();

        info!(
            pools = pools.len(),
            clean_every = ?self.settings.clean_every,
            idle_timeout = ?self.settings.idle_timeout,
            "Rate limiter initialized"
        );

        Ok(Limiter {
            engine: self.engine,
            clock: self.clock,
            settings: self.settings,
            pools,
            inline_pools: RwLock::new(HashMap::new()),
            metrics,
        })
    }
}

fn validate_pool_config(
    index: usize,
    config: &PoolConfig,
    seen: &mut HashSet<String>,
    engine: &dyn TemplateEngine,
) -> Result<()> {
    let name = &config.name;
    if name.is_empty() {
        return Err(LimiterError::MissingPoolName { index });
    }
    if !seen.insert(name.clone()) {
        return Err(LimiterError::DuplicatePool(name.clone()));
    }

    let rps = config.requests_per_second;
    if !(rps.is_finite() && rps > 0.0) {
        return Err(LimiterError::InvalidRate {
            name: name.clone(),
            value: rps,
        });
    }
    if config.burst == 0 {
        return Err(LimiterError::InvalidBurst {
            name: name.clone(),
            value: config.burst,
        });
    }
    if schedule(rps, config.burst).is_none() {
        return Err(LimiterError::InvalidRate {
            name: name.clone(),
            value: rps,
        });
    }

    if config.key_template.is_empty() {
        return Err(LimiterError::MissingKeyTemplate { name: name.clone() });
    }
    engine
        .validate(&config.key_template, Usage::PreQuery)
        .map_err(|source| LimiterError::InvalidKeyTemplate {
            name: name.clone(),
            source,
        })
}

/// Templated multi-pool rate limiter.
///
/// Thread-safe; share it behind an `Arc`.
pub struct Limiter {
    engine: Arc<dyn TemplateEngine>,
    clock: Arc<dyn Clock>,
    settings: PoolSettings,
    /// Pools from configuration; the key set never changes after construction
    pools: HashMap<String, Arc<Pool>>,
    /// Inline pools indexed by signature
    inline_pools: RwLock<HashMap<String, Arc<Pool>>>,
    metrics: Metrics,
}

impl Limiter {
    /// Build a limiter from pool configurations with the system clock and the
    /// default cleanup schedule.
    pub fn new(pools: Vec<PoolConfig>, engine: Arc<dyn TemplateEngine>) -> Result<Self> {
        Self::builder(engine).pools(pools).build()
    }

    pub fn builder(engine: Arc<dyn TemplateEngine>) -> LimiterBuilder {
        LimiterBuilder {
            engine,
            clock: Arc::new(SystemClock),
            settings: PoolSettings::default(),
            pools: Vec::new(),
        }
    }

    /// Check a request against `limits`, in order.
    ///
    /// The first denial is returned as [`Decision::Denied`] and the first
    /// configuration or key evaluation problem as an error; either way the
    /// remaining limits are not evaluated. Tokens already taken from earlier
    /// limits in the same call are kept.
    pub fn allow(&self, limits: &[LimitRef], ctx: &RequestContext) -> Result<Decision> {
        for (index, limit) in limits.iter().enumerate() {
            match self.allow_one(limit, ctx) {
                Ok(Decision::Allowed) => {}
                Ok(denied) => {
                    debug!(
                        limit = index,
                        client_ip = %ctx.client_ip(),
                        retry_after = ?denied.retry_after(),
                        "Rate limit exceeded"
                    );
                    return Ok(denied);
                }
                Err(err) => {
                    warn!(limit = index, error = %err, "Rate limit evaluation failed");
                    return Err(err);
                }
            }
        }
        Ok(Decision::Allowed)
    }

    fn allow_one(&self, limit: &LimitRef, ctx: &RequestContext) -> Result<Decision> {
        let pool = match limit.kind()? {
            LimitKind::Unlimited => return Ok(Decision::Allowed),
            LimitKind::Named(name) => self
                .pools
                .get(name)
                .cloned()
                .ok_or_else(|| LimiterError::UnknownPool(name.to_string()))?,
            LimitKind::Inline(spec) => self.inline_pool(&spec)?,
        };

        let key = self
            .engine
            .execute_inline(pool.key_template(), ctx, Usage::PreQuery)
            .map_err(|source| LimiterError::KeyEvaluation {
                pool: pool.name().to_string(),
                source,
            })?;

        let now = self.clock.now();
        let bucket = pool.get_or_create_bucket(&key, now);
        bucket.touch(now);

        let reservation = bucket.reserve(now);
        let decision = if reservation.is_ready() {
            Decision::Allowed
        } else {
            let delay = reservation.delay();
            bucket.cancel(reservation);
            Decision::Denied {
                retry_after: retry_after_for(delay),
            }
        };

        trace!(
            pool = %pool.name(),
            key = %key,
            allowed = decision.is_allowed(),
            "Evaluated limit"
        );

        self.metrics.record(pool.name(), decision.is_allowed());
        pool.maybe_cleanup(now);

        Ok(decision)
    }

    /// The inline pool for these parameters, created on first use.
    ///
    /// A key template that does not validate never gets a pool.
    fn inline_pool(&self, spec: &InlineSpec<'_>) -> Result<Arc<Pool>> {
        let signature = spec.signature();
        if let Some(pool) = self.inline_pools.read().get(&signature) {
            return Ok(Arc::clone(pool));
        }

        self.engine
            .validate(spec.key_template, Usage::PreQuery)
            .map_err(|source| LimiterError::KeyEvaluation {
                pool: inline_pool_name(&signature),
                source,
            })?;

        let mut inline_pools = self.inline_pools.write();
        if let Some(pool) = inline_pools.get(&signature) {
            return Ok(Arc::clone(pool));
        }

        let pool = Arc::new(Pool::new(
            inline_pool_name(&signature),
            spec.requests_per_second,
            spec.burst,
            spec.key_template,
            self.settings,
            self.clock.now(),
        ));
        self.metrics.register_pool(pool.name());
        debug!(pool = %pool.name(), "Created inline pool");

        inline_pools.insert(signature, Arc::clone(&pool));
        Ok(pool)
    }

    /// Copy of the counters plus the live bucket count of every pool.
    ///
    /// Bucket counts are read pool by pool, so they are not an atomic view
    /// together with the counters.
    pub fn snapshot(&self) -> Snapshot {
        let pools: BTreeMap<_, _> = self
            .all_pools()
            .iter()
            .map(|pool| {
                let stats = self.metrics.pool_stats(pool.name(), pool.bucket_count());
                (pool.name().to_string(), stats)
            })
            .collect();

        let now = self.clock.now();
        let taken_at = DateTime::<Utc>::from_timestamp(now.as_secs() as i64, now.subsec_nanos())
            .unwrap_or_default();

        Snapshot {
            taken_at,
            allowed: self.metrics.allowed(),
            denied: self.metrics.denied(),
            pools,
        }
    }

    /// Clear the buckets of every pool, returning how many were removed.
    pub fn reset_all(&self) -> usize {
        let cleared: usize = self.all_pools().iter().map(|pool| pool.reset()).sum();
        info!(cleared = cleared, "Reset all rate limit pools");
        cleared
    }

    /// Clear the buckets of one pool, named or inline.
    pub fn reset_pool(&self, name: &str) -> Result<usize> {
        let pool = self
            .get_pool(name)
            .ok_or_else(|| LimiterError::UnknownPool(name.to_string()))?;
        let cleared = pool.reset();
        info!(pool = %name, cleared = cleared, "Reset rate limit pool");
        Ok(cleared)
    }

    /// Clear one bucket, returning whether it existed.
    pub fn reset_key(&self, pool: &str, key: &str) -> Result<bool> {
        let target = self
            .get_pool(pool)
            .ok_or_else(|| LimiterError::UnknownPool(pool.to_string()))?;
        let existed = target.reset_key(key);
        info!(pool = %pool, key = %key, existed = existed, "Reset rate limit key");
        Ok(existed)
    }

    /// Remove idle buckets from every pool now, ignoring the sweep schedule.
    pub fn sweep_idle(&self) -> usize {
        let now = self.clock.now();
        self.all_pools().iter().map(|pool| pool.sweep_idle(now)).sum()
    }

    /// Names of the configured pools, sorted.
    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up a configured pool, or an inline pool by its `_inline:` name.
    pub fn get_pool(&self, name: &str) -> Option<Arc<Pool>> {
        if let Some(pool) = self.pools.get(name) {
            return Some(Arc::clone(pool));
        }
        let signature = name.strip_prefix(INLINE_POOL_PREFIX)?;
        self.inline_pools.read().get(signature).cloned()
    }

    pub fn inline_pool_count(&self) -> usize {
        self.inline_pools.read().len()
    }

    fn all_pools(&self) -> Vec<Arc<Pool>> {
        let mut pools: Vec<Arc<Pool>> = self.pools.values().cloned().collect();
        pools.extend(self.inline_pools.read().values().cloned());
        pools
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, PoolStats};
    use crate::template::KeyTemplateEngine;
    use std::sync::Barrier;

    const T0: Duration = Duration::from_secs(1_700_000_000);
    const BY_IP: &str = "{{ .ClientIP }}";

    fn limiter_with_clock(pools: Vec<PoolConfig>) -> (Limiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let limiter = Limiter::builder(Arc::new(KeyTemplateEngine::new()))
            .pools(pools)
            .clock(clock.clone())
            .build()
            .unwrap();
        (limiter, clock)
    }

    fn limiter(pools: Vec<PoolConfig>) -> Limiter {
        limiter_with_clock(pools).0
    }

    fn build_err(pools: Vec<PoolConfig>) -> LimiterError {
        match Limiter::new(pools, Arc::new(KeyTemplateEngine::new())) {
            Ok(_) => panic!("expected construction to fail"),
            Err(err) => err,
        }
    }

    fn client(ip: &str) -> RequestContext {
        RequestContext::new(ip)
    }

    #[test]
    fn test_construction_accepts_valid_pools() {
        let limiter = limiter(vec![
            PoolConfig::new("per_ip", 10.0, 20, BY_IP),
            PoolConfig::new("per_key", 0.5, 1, "{{ require .Header.X-Api-Key }}"),
        ]);

        assert_eq!(limiter.pool_names(), vec!["per_ip", "per_key"]);
        assert_eq!(limiter.snapshot().pools.len(), 2);
    }

    #[test]
    fn test_construction_rejects_invalid_pools() {
        assert!(matches!(
            build_err(vec![PoolConfig::new("", 1.0, 1, BY_IP)]),
            LimiterError::MissingPoolName { index: 0 }
        ));
        assert!(matches!(
            build_err(vec![
                PoolConfig::new("p", 1.0, 1, BY_IP),
                PoolConfig::new("p", 2.0, 2, BY_IP),
            ]),
            LimiterError::DuplicatePool(name) if name == "p"
        ));
        assert!(matches!(
            build_err(vec![PoolConfig::new("p", 0.0, 1, BY_IP)]),
            LimiterError::InvalidRate { .. }
        ));
        assert!(matches!(
            build_err(vec![PoolConfig::new("p", f64::NAN, 1, BY_IP)]),
            LimiterError::InvalidRate { .. }
        ));
        assert!(matches!(
            build_err(vec![PoolConfig::new("p", 1.0, 0, BY_IP)]),
            LimiterError::InvalidBurst { .. }
        ));
        assert!(matches!(
            build_err(vec![PoolConfig::new("p", 1e-20, 1, BY_IP)]),
            LimiterError::InvalidRate { .. }
        ));
        assert!(matches!(
            build_err(vec![PoolConfig::new("p", 1.0, 1, "")]),
            LimiterError::MissingKeyTemplate { .. }
        ));
        assert!(matches!(
            build_err(vec![PoolConfig::new("p", 1.0, 1, "{{ .ClientIP")]),
            LimiterError::InvalidKeyTemplate { .. }
        ));
        assert!(matches!(
            build_err(vec![PoolConfig::new("p", 1.0, 1, "{{ .Result.id }}")]),
            LimiterError::InvalidKeyTemplate { .. }
        ));
    }

    #[test]
    fn test_construction_reports_first_offending_pool() {
        let err = build_err(vec![
            PoolConfig::new("good", 1.0, 1, BY_IP),
            PoolConfig::new("bad_rate", -1.0, 1, BY_IP),
            PoolConfig::new("bad_burst", 1.0, 0, BY_IP),
        ]);

        assert!(err.is_construction_error());
        assert!(err.to_string().contains("bad_rate"), "{}", err);
    }

    #[test]
    fn test_empty_limits_always_allow() {
        let limiter = limiter(vec![]);
        let decision = limiter.allow(&[], &client("10.0.0.1")).unwrap();

        assert_eq!(decision, Decision::Allowed);
        assert_eq!(decision.retry_after(), Duration::ZERO);
    }

    #[test]
    fn test_unlimited_ref_touches_nothing() {
        let limiter = limiter(vec![]);
        for _ in 0..10 {
            assert!(limiter
                .allow(&[LimitRef::unlimited()], &client("10.0.0.1"))
                .unwrap()
                .is_allowed());
        }

        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.allowed, 0);
        assert!(snapshot.pools.is_empty());
    }

    #[test]
    fn test_token_bucket_allows_burst_then_denies() {
        let limiter = limiter(vec![PoolConfig::new("p", 1.0, 2, BY_IP)]);
        let limits = [LimitRef::pool("p")];
        let ctx = client("10.0.0.1");

        let decisions: Vec<Decision> = (0..3)
            .map(|_| limiter.allow(&limits, &ctx).unwrap())
            .collect();

        assert!(decisions[0].is_allowed());
        assert!(decisions[1].is_allowed());
        assert!(!decisions[2].is_allowed());
        assert!(decisions[2].retry_after() > Duration::ZERO);
        assert_eq!(decisions[2].retry_after(), Duration::from_secs(2));
        assert_eq!(decisions[2].retry_after_header().as_deref(), Some("2"));
    }

    #[test]
    fn test_tokens_refill_with_time() {
        let (limiter, clock) = limiter_with_clock(vec![PoolConfig::new("p", 1.0, 1, BY_IP)]);
        let limits = [LimitRef::pool("p")];
        let ctx = client("10.0.0.1");

        assert!(limiter.allow(&limits, &ctx).unwrap().is_allowed());
        assert!(!limiter.allow(&limits, &ctx).unwrap().is_allowed());

        clock.advance(Duration::from_secs(1));
        assert!(limiter.allow(&limits, &ctx).unwrap().is_allowed());
    }

    #[test]
    fn test_denial_does_not_consume_capacity() {
        let (limiter, clock) = limiter_with_clock(vec![PoolConfig::new("p", 1.0, 1, BY_IP)]);
        let limits = [LimitRef::pool("p")];
        let ctx = client("10.0.0.1");

        assert!(limiter.allow(&limits, &ctx).unwrap().is_allowed());
        for _ in 0..20 {
            let denied = limiter.allow(&limits, &ctx).unwrap();
            assert_eq!(denied.retry_after(), Duration::from_secs(2));
        }

        clock.advance(Duration::from_secs(1));
        assert!(limiter.allow(&limits, &ctx).unwrap().is_allowed());
    }

    #[test]
    fn test_all_limits_must_allow() {
        let limiter = limiter(vec![
            PoolConfig::new("p1", 10.0, 10, BY_IP),
            PoolConfig::new("p2", 1.0, 1, BY_IP),
        ]);
        let limits = [LimitRef::pool("p1"), LimitRef::pool("p2")];
        let ctx = client("10.0.0.1");

        assert!(limiter.allow(&limits, &ctx).unwrap().is_allowed());
        assert!(!limiter.allow(&limits, &ctx).unwrap().is_allowed());

        // p1 still has capacity on its own.
        assert!(limiter
            .allow(&[LimitRef::pool("p1")], &ctx)
            .unwrap()
            .is_allowed());
    }

    #[test]
    fn test_earlier_limits_keep_tokens_when_a_later_limit_denies() {
        let limiter = limiter(vec![
            PoolConfig::new("p1", 1.0, 2, BY_IP),
            PoolConfig::new("p2", 1.0, 1, BY_IP),
        ]);
        let limits = [LimitRef::pool("p1"), LimitRef::pool("p2")];
        let ctx = client("10.0.0.1");

        assert!(limiter.allow(&limits, &ctx).unwrap().is_allowed());
        assert!(!limiter.allow(&limits, &ctx).unwrap().is_allowed());

        // The denied call spent p1's second token.
        assert!(!limiter
            .allow(&[LimitRef::pool("p1")], &ctx)
            .unwrap()
            .is_allowed());
    }

    #[test]
    fn test_denial_short_circuits_later_limits() {
        let limiter = limiter(vec![
            PoolConfig::new("tight", 1.0, 1, BY_IP),
            PoolConfig::new("loose", 10.0, 10, BY_IP),
        ]);
        let limits = [LimitRef::pool("tight"), LimitRef::pool("loose")];
        let ctx = client("10.0.0.1");

        limiter.allow(&limits, &ctx).unwrap();
        limiter.allow(&limits, &ctx).unwrap();

        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.pool("tight").unwrap().denied, 1);
        assert_eq!(snapshot.pool("loose").unwrap().allowed, 1);
        assert_eq!(snapshot.pool("loose").unwrap().denied, 0);
    }

    #[test]
    fn test_keys_are_isolated() {
        let limiter = limiter(vec![PoolConfig::new("p", 1.0, 1, BY_IP)]);
        let limits = [LimitRef::pool("p")];

        assert!(limiter.allow(&limits, &client("10.0.0.1")).unwrap().is_allowed());
        assert!(!limiter.allow(&limits, &client("10.0.0.1")).unwrap().is_allowed());
        assert!(limiter.allow(&limits, &client("10.0.0.2")).unwrap().is_allowed());

        assert_eq!(limiter.get_pool("p").unwrap().bucket_count(), 2);
    }

    #[test]
    fn test_header_keyed_pool() {
        let limiter = limiter(vec![PoolConfig::new(
            "per_key",
            1.0,
            1,
            "key:{{ require .Header.X-Api-Key }}",
        )]);
        let limits = [LimitRef::pool("per_key")];

        // Same key from different addresses shares a bucket.
        let a = client("10.0.0.1").with_header("X-Api-Key", "k1");
        let b = client("10.0.0.2").with_header("X-Api-Key", "k1");

        assert!(limiter.allow(&limits, &a).unwrap().is_allowed());
        assert!(!limiter.allow(&limits, &b).unwrap().is_allowed());
        assert!(limiter.get_pool("per_key").unwrap().bucket("key:k1").is_some());
    }

    #[test]
    fn test_unknown_pool_is_an_error() {
        let limiter = limiter(vec![PoolConfig::new("p1", 1.0, 1, BY_IP)]);
        let limits = [LimitRef::pool("missing"), LimitRef::pool("p1")];

        let err = limiter.allow(&limits, &client("10.0.0.1")).unwrap_err();
        assert!(matches!(err, LimiterError::UnknownPool(ref name) if name == "missing"));
        assert_eq!(err.to_string(), "pool \"missing\" not found");

        // The error stops evaluation before p1.
        assert_eq!(limiter.get_pool("p1").unwrap().bucket_count(), 0);
    }

    #[test]
    fn test_missing_required_key_is_an_error() {
        let limiter = limiter(vec![
            PoolConfig::new("by_ip", 10.0, 10, BY_IP),
            PoolConfig::new("by_key", 10.0, 10, "{{ require .Header.X-Api-Key }}"),
        ]);
        let limits = [LimitRef::pool("by_ip"), LimitRef::pool("by_key")];

        let err = limiter.allow(&limits, &client("10.0.0.1")).unwrap_err();
        assert!(matches!(err, LimiterError::KeyEvaluation { ref pool, .. } if pool == "by_key"));

        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.pool("by_ip").unwrap().allowed, 1);
        assert_eq!(snapshot.pool("by_key").unwrap(), &PoolStats::default());
        assert_eq!(snapshot.denied, 0);
    }

    #[test]
    fn test_invalid_inline_limit_is_an_error() {
        let limiter = limiter(vec![]);
        let limit = LimitRef {
            burst: Some(3),
            ..Default::default()
        };

        assert!(matches!(
            limiter.allow(&[limit], &client("10.0.0.1")),
            Err(LimiterError::InvalidLimit(_))
        ));
        assert_eq!(limiter.inline_pool_count(), 0);
    }

    #[test]
    fn test_inline_limits_are_deduplicated() {
        let limiter = limiter(vec![]);
        let first_site = [LimitRef::inline(1.0, 1, None)];
        let second_site = [LimitRef::inline(1.0, 1, None)];
        let ctx = client("10.0.0.1");

        assert!(limiter.allow(&first_site, &ctx).unwrap().is_allowed());
        assert!(!limiter.allow(&second_site, &ctx).unwrap().is_allowed());

        assert_eq!(limiter.inline_pool_count(), 1);

        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.pools.len(), 1);
        let stats = snapshot.pool("_inline:1:1:{{ .ClientIP }}").unwrap();
        assert_eq!(stats.allowed, 1);
        assert_eq!(stats.denied, 1);
        assert_eq!(stats.active_buckets, 1);
    }

    #[test]
    fn test_slow_pool_denies_after_burst() {
        let (limiter, _clock) = limiter_with_clock(vec![PoolConfig::new("slow", 1e-9, 1, BY_IP)]);
        let limits = [LimitRef::pool("slow")];
        let ctx = client("10.0.0.1");

        let decisions: Vec<bool> = (0..5)
            .map(|_| limiter.allow(&limits, &ctx).unwrap().is_allowed())
            .collect();
        assert_eq!(decisions, vec![true, false, false, false, false]);
    }

    #[test]
    fn test_invalid_inline_template_creates_no_pool() {
        let limiter = limiter(vec![]);
        let ctx = client("10.0.0.1");

        for n in 0..3 {
            let template = format!("{{{{ .Bogus{} }}}}", n);
            let limit = LimitRef::inline(1.0, 1, Some(template.as_str()));
            assert!(matches!(
                limiter.allow(&[limit], &ctx),
                Err(LimiterError::KeyEvaluation { .. })
            ));
        }

        assert_eq!(limiter.inline_pool_count(), 0);
        assert!(limiter.snapshot().pools.is_empty());
    }

    #[test]
    fn test_distinct_inline_limits_get_distinct_pools() {
        let limiter = limiter(vec![]);
        let ctx = client("10.0.0.1").with_path("/reports");

        limiter.allow(&[LimitRef::inline(1.0, 1, None)], &ctx).unwrap();
        limiter.allow(&[LimitRef::inline(1.0, 2, None)], &ctx).unwrap();
        limiter
            .allow(&[LimitRef::inline(1.0, 1, Some("{{ .Path }}"))], &ctx)
            .unwrap();

        assert_eq!(limiter.inline_pool_count(), 3);
        let pool = limiter.get_pool("_inline:1:1:{{ .Path }}").unwrap();
        assert!(pool.bucket("/reports").is_some());
    }

    #[test]
    fn test_reset_operations() {
        let limiter = limiter(vec![
            PoolConfig::new("p1", 1.0, 1, BY_IP),
            PoolConfig::new("p2", 1.0, 1, BY_IP),
        ]);
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            limiter.allow(&[LimitRef::pool("p1")], &client(ip)).unwrap();
        }
        limiter.allow(&[LimitRef::pool("p2")], &client("10.0.0.1")).unwrap();
        limiter
            .allow(&[LimitRef::inline(5.0, 5, None)], &client("10.0.0.1"))
            .unwrap();

        assert!(limiter.reset_key("p1", "10.0.0.3").unwrap());
        assert!(!limiter.reset_key("p1", "missing").unwrap());
        assert!(matches!(
            limiter.reset_key("nope", "10.0.0.1"),
            Err(LimiterError::UnknownPool(_))
        ));

        assert_eq!(limiter.reset_pool("p1").unwrap(), 2);
        assert_eq!(limiter.get_pool("p2").unwrap().bucket_count(), 1);
        assert!(matches!(
            limiter.reset_pool("nope"),
            Err(LimiterError::UnknownPool(_))
        ));

        assert_eq!(limiter.reset_all(), 2);
        assert_eq!(limiter.snapshot().active_buckets(), 0);
    }

    #[test]
    fn test_reset_inline_pool_by_name() {
        let limiter = limiter(vec![]);
        let limits = [LimitRef::inline(1.0, 1, None)];
        let ctx = client("10.0.0.1");

        limiter.allow(&limits, &ctx).unwrap();
        assert!(!limiter.allow(&limits, &ctx).unwrap().is_allowed());

        assert_eq!(limiter.reset_pool("_inline:1:1:{{ .ClientIP }}").unwrap(), 1);
        assert!(limiter.allow(&limits, &ctx).unwrap().is_allowed());
    }

    #[test]
    fn test_reset_key_restores_capacity() {
        let limiter = limiter(vec![PoolConfig::new("p", 1.0, 1, BY_IP)]);
        let limits = [LimitRef::pool("p")];
        let ctx = client("10.0.0.1");

        limiter.allow(&limits, &ctx).unwrap();
        assert!(!limiter.allow(&limits, &ctx).unwrap().is_allowed());

        assert!(limiter.reset_key("p", "10.0.0.1").unwrap());
        assert!(limiter.allow(&limits, &ctx).unwrap().is_allowed());
    }

    #[test]
    fn test_idle_buckets_are_swept_by_traffic() {
        let (limiter, clock) = limiter_with_clock(vec![PoolConfig::new("p", 1.0, 1, BY_IP)]);
        let limits = [LimitRef::pool("p")];

        limiter.allow(&limits, &client("10.0.0.1")).unwrap();
        clock.advance(Duration::from_secs(4 * 60));
        limiter.allow(&limits, &client("10.0.0.2")).unwrap();

        // 11 minutes after the first request, 7 after the second.
        clock.advance(Duration::from_secs(7 * 60));
        limiter.allow(&limits, &client("10.0.0.3")).unwrap();

        let pool = limiter.get_pool("p").unwrap();
        assert!(pool.bucket("10.0.0.1").is_none());
        assert!(pool.bucket("10.0.0.2").is_some());
        assert!(pool.bucket("10.0.0.3").is_some());
    }

    #[test]
    fn test_recent_access_keeps_bucket_alive() {
        let (limiter, clock) = limiter_with_clock(vec![PoolConfig::new("p", 100.0, 100, BY_IP)]);
        let limits = [LimitRef::pool("p")];
        let ctx = client("10.0.0.1");

        limiter.allow(&limits, &ctx).unwrap();
        clock.advance(Duration::from_secs(8 * 60));
        limiter.allow(&limits, &ctx).unwrap();
        clock.advance(Duration::from_secs(8 * 60));

        assert_eq!(limiter.sweep_idle(), 0);
        assert!(limiter.get_pool("p").unwrap().bucket("10.0.0.1").is_some());

        clock.advance(Duration::from_secs(3 * 60));
        assert_eq!(limiter.sweep_idle(), 1);
    }

    #[test]
    fn test_custom_cleanup_settings() {
        let clock = Arc::new(ManualClock::new(T0));
        let limiter = Limiter::builder(Arc::new(KeyTemplateEngine::new()))
            .pools(vec![PoolConfig::new("p", 1.0, 1, BY_IP)])
            .clock(clock.clone())
            .settings(PoolSettings {
                clean_every: Duration::from_secs(10),
                idle_timeout: Duration::from_secs(30),
            })
            .build()
            .unwrap();
        let limits = [LimitRef::pool("p")];

        limiter.allow(&limits, &client("10.0.0.1")).unwrap();
        clock.advance(Duration::from_secs(31));
        limiter.allow(&limits, &client("10.0.0.2")).unwrap();

        assert_eq!(limiter.get_pool("p").unwrap().bucket_count(), 1);
    }

    #[test]
    fn test_snapshot_counts() {
        let limiter = limiter(vec![
            PoolConfig::new("p1", 1.0, 2, BY_IP),
            PoolConfig::new("unused", 1.0, 1, BY_IP),
        ]);
        let limits = [LimitRef::pool("p1")];
        for _ in 0..5 {
            limiter.allow(&limits, &client("10.0.0.1")).unwrap();
        }

        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.allowed, 2);
        assert_eq!(snapshot.denied, 3);
        assert_eq!(snapshot.taken_at.timestamp(), T0.as_secs() as i64);

        let p1 = snapshot.pool("p1").unwrap();
        assert_eq!((p1.allowed, p1.denied, p1.active_buckets), (2, 3, 1));
        assert_eq!(snapshot.pool("unused").unwrap(), &PoolStats::default());
    }

    #[test]
    fn test_retry_after_rounding() {
        assert_eq!(retry_after_for(Duration::ZERO), Duration::from_secs(1));
        assert_eq!(retry_after_for(Duration::from_millis(300)), Duration::from_secs(2));
        assert_eq!(retry_after_for(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(retry_after_for(Duration::from_millis(1200)), Duration::from_secs(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_over_grant() {
        const CALLERS: usize = 64;
        const BURST: u32 = 10;

        let (limiter, _clock) = limiter_with_clock(vec![PoolConfig::new("p", 1.0, BURST, BY_IP)]);
        let limiter = Arc::new(limiter);
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let barrier = Arc::clone(&barrier);
                tokio::task::spawn_blocking(move || {
                    barrier.wait();
                    limiter
                        .allow(&[LimitRef::pool("p")], &client("10.9.9.9"))
                        .unwrap()
                        .is_allowed()
                })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }

        assert_eq!(allowed, BURST as usize);
        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.allowed, BURST as u64);
        assert_eq!(snapshot.denied, (CALLERS - BURST as usize) as u64);
        assert_eq!(snapshot.pool("p").unwrap().active_buckets, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inline_creation_yields_one_pool() {
        const CALLERS: usize = 32;

        let limiter = Arc::new(limiter(vec![]));
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let barrier = Arc::clone(&barrier);
                tokio::task::spawn_blocking(move || {
                    barrier.wait();
                    limiter
                        .allow(&[LimitRef::inline(1.0, 3, None)], &client("10.9.9.9"))
                        .unwrap()
                        .is_allowed()
                })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 3);
        assert_eq!(limiter.inline_pool_count(), 1);
    }
}
