//! sqlgate - admission control for an HTTP-to-SQL proxy
//!
//! This crate implements the proxy's rate limiter: token buckets grouped into
//! named and inline pools, keyed per client by small templates evaluated
//! against request data.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod template;

pub use error::{LimiterError, Result};
pub use ratelimit::{Decision, LimitRef, Limiter, PoolConfig};
pub use template::{KeyTemplateEngine, RequestContext, TemplateEngine};
