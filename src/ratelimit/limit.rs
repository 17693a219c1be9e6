//! Pool configurations and per-call limit references.
//!
//! Pools are declared once in configuration and referenced by name, or
//! declared inline at a call site with their own rate, burst and key template.

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};
use crate::template::DEFAULT_KEY_TEMPLATE;

use super::bucket::schedule;

/// Prefix of the synthetic name given to inline pools.
pub const INLINE_POOL_PREFIX: &str = "_inline:";

/// Configuration for a named pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Unique pool name
    pub name: String,
    /// Sustained refill rate
    pub requests_per_second: f64,
    /// Bucket capacity
    pub burst: u32,
    /// Template producing the bucket key from request data
    pub key_template: String,
}

impl PoolConfig {
    pub fn new(
        name: impl Into<String>,
        requests_per_second: f64,
        burst: u32,
        key_template: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            requests_per_second,
            burst,
            key_template: key_template.into(),
        }
    }
}

/// A rate limit applied to one call.
///
/// Exactly one form is expected: `{pool}` referencing a named pool,
/// `{requests_per_second, burst, key_template?}` declaring an inline pool, or
/// `{}` meaning no limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_second: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_template: Option<String>,
}

/// What a [`LimitRef`] resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum LimitKind<'a> {
    /// Reference to a pool from configuration
    Named(&'a str),
    /// Ad-hoc pool identified by its signature
    Inline(InlineSpec<'a>),
    /// No limiting
    Unlimited,
}

/// Parameters of an inline pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InlineSpec<'a> {
    pub requests_per_second: f64,
    pub burst: u32,
    pub key_template: &'a str,
}

impl InlineSpec<'_> {
    /// Deterministic identity of the pool: `rps:burst:key_template`.
    pub fn signature(&self) -> String {
        format!(
            "{}:{}:{}",
            self.requests_per_second, self.burst, self.key_template
        )
    }
}

impl LimitRef {
    /// Reference a named pool.
    pub fn pool(name: impl Into<String>) -> Self {
        Self {
            pool: Some(name.into()),
            ..Default::default()
        }
    }

    /// Declare an inline pool. Without a key template, requests are keyed by
    /// client IP.
    pub fn inline(requests_per_second: f64, burst: u32, key_template: Option<&str>) -> Self {
        Self {
            requests_per_second: Some(requests_per_second),
            burst: Some(burst),
            key_template: key_template.map(str::to_string),
            ..Default::default()
        }
    }

    /// A limit that never denies.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Classify this reference.
    ///
    /// A pool name takes precedence over inline fields. An inline declaration
    /// must carry both a positive rate and a positive burst.
    pub fn kind(&self) -> Result<LimitKind<'_>> {
        if let Some(pool) = self.pool.as_deref().filter(|p| !p.is_empty()) {
            return Ok(LimitKind::Named(pool));
        }

        let key_template = self
            .key_template
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_KEY_TEMPLATE);

        match (self.requests_per_second, self.burst) {
            (None, None) => Ok(LimitKind::Unlimited),
            (Some(rps), Some(burst)) => {
                if !(rps.is_finite() && rps > 0.0) {
                    return Err(LimiterError::InvalidLimit(format!(
                        "requests_per_second must be positive, got {}",
                        rps
                    )));
                }
                if burst == 0 {
                    return Err(LimiterError::InvalidLimit(
                        "burst must be positive, got 0".to_string(),
                    ));
                }
                if schedule(rps, burst).is_none() {
                    return Err(LimiterError::InvalidLimit(format!(
                        "requests_per_second {} is too small for burst {}",
                        rps, burst
                    )));
                }
                Ok(LimitKind::Inline(InlineSpec {
                    requests_per_second: rps,
                    burst,
                    key_template,
                }))
            }
            _ => Err(LimiterError::InvalidLimit(
                "requests_per_second and burst must be set together".to_string(),
            )),
        }
    }
}

/// Synthetic pool name for an inline signature.
pub fn inline_pool_name(signature: &str) -> String {
    format!("{}{}", INLINE_POOL_PREFIX, signature)
}
