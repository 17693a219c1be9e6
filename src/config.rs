//! Configuration management for sqlgate.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};
use crate::ratelimit::{Limiter, LimiterBuilder, PoolConfig, PoolSettings};
use crate::template::TemplateEngine;

/// Prefix of environment variables overriding file settings,
/// e.g. `SQLGATE__RATE_LIMITING__CLEANUP_INTERVAL_SECS=60`.
pub const ENV_PREFIX: &str = "SQLGATE";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Named pools
    #[serde(default)]
    pub pools: Vec<PoolConfig>,

    /// Minimum interval between idle sweeps of a pool, in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Time a bucket may stay unused before it is swept, in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            pools: Vec::new(),
            cleanup_interval_secs: default_cleanup_interval(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_idle_timeout() -> u64 {
    600
}

impl RateLimitingConfig {
    /// Cleanup schedule for every pool.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            clean_every: Duration::from_secs(self.cleanup_interval_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }

    /// Builder preloaded with these pools and cleanup schedule.
    pub fn limiter_builder(&self, engine: Arc<dyn TemplateEngine>) -> LimiterBuilder {
        Limiter::builder(engine)
            .pools(self.pools.clone())
            .settings(self.pool_settings())
    }

    /// Build a limiter for these pools.
    pub fn build_limiter(&self, engine: Arc<dyn TemplateEngine>) -> Result<Limiter> {
        self.limiter_builder(engine).build()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatewayConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional YAML file layered with
    /// `SQLGATE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
