//! Error types for the sqlgate limiter.

use thiserror::Error;

use crate::template::TemplateError;

/// Main error type for limiter operations.
///
/// Capacity denials are not errors: they are reported as
/// [`Decision::Denied`](crate::ratelimit::Decision::Denied). Every variant here
/// points at a configuration or deployment problem.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// A pool configuration has no name
    #[error("pool #{index}: name is required")]
    MissingPoolName { index: usize },

    /// Two pool configurations share a name
    #[error("duplicate pool name {0:?}")]
    DuplicatePool(String),

    /// Non-positive or non-finite requests per second
    #[error("pool {name:?}: requests_per_second must be positive, got {value}")]
    InvalidRate { name: String, value: f64 },

    /// Zero burst
    #[error("pool {name:?}: burst must be positive, got {value}")]
    InvalidBurst { name: String, value: u32 },

    /// Pool configured without a key template
    #[error("pool {name:?}: key_template is required")]
    MissingKeyTemplate { name: String },

    /// Key template rejected by the template engine
    #[error("pool {name:?}: invalid key_template: {source}")]
    InvalidKeyTemplate {
        name: String,
        #[source]
        source: TemplateError,
    },

    /// A limit references a named pool that does not exist
    #[error("pool {0:?} not found")]
    UnknownPool(String),

    /// A per-call inline limit is malformed
    #[error("invalid inline limit: {0}")]
    InvalidLimit(String),

    /// The key template could not be evaluated against the request
    #[error("evaluating key for pool {pool:?}: {source}")]
    KeyEvaluation {
        pool: String,
        #[source]
        source: TemplateError,
    },

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Whether this error was raised while building a limiter from pool configs.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            LimiterError::MissingPoolName { .. }
                | LimiterError::DuplicatePool(_)
                | LimiterError::InvalidRate { .. }
                | LimiterError::InvalidBurst { .. }
                | LimiterError::MissingKeyTemplate { .. }
                | LimiterError::InvalidKeyTemplate { .. }
        )
    }
}

impl From<config::ConfigError> for LimiterError {
    fn from(err: config::ConfigError) -> Self {
        LimiterError::Config(err.to_string())
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
