//! Process-wide engine configuration.
//!
//! Loaded once at startup (TOML on disk or defaults) and read-only afterwards.
//! Connections hand out `Arc` snapshots so a query keeps the configuration it
//! started with.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exec::retry::RetryPolicy;
use crate::relation::StorageMode;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// File contents were not valid TOML for this schema.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Path that failed.
        path: PathBuf,
        /// Underlying TOML failure.
        #[source]
        source: toml::de::Error,
    },
    /// A value was syntactically fine but out of range.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// Human readable reason.
        reason: String,
    },
}

/// Engine-wide settings consumed by the resolver and the execution coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Lowest-precedence storage mode for relationships.
    pub default_storage_mode: StorageMode,
    /// Maximum statements sent in one driver batch request.
    pub batch_size: usize,
    /// Default retry policy; per-call overrides never mutate it.
    pub retry: RetryPolicy,
    /// Send `Read` statements to the replica driver when one is configured.
    pub route_reads_to_replica: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_storage_mode: StorageMode::ForeignKey,
            batch_size: 100,
            retry: RetryPolicy::default(),
            route_reads_to_replica: true,
        }
    }
}

impl EngineConfig {
    /// Profile for clustered deployments: hybrid storage, more patient retries.
    pub fn resilient() -> Self {
        Self {
            default_storage_mode: StorageMode::Hybrid,
            batch_size: 250,
            retry: RetryPolicy {
                max_attempts: 8,
                initial_delay: Duration::from_millis(50),
                max_delay: Duration::from_secs(5),
                multiplier: 2.0,
                jitter: true,
            },
            route_reads_to_replica: true,
        }
    }

    /// Loads configuration from a TOML file. Missing keys fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        raw.into_config()
    }

    /// Parses configuration from an in-memory TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        raw.into_config()
    }

    /// Checks the invariants every consumer relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "batch_size",
                reason: "must be at least 1".into(),
            });
        }
        self.retry.validate()
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    default_storage_mode: Option<StorageMode>,
    batch_size: Option<usize>,
    route_reads_to_replica: Option<bool>,
    retry: RawRetry,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
struct RawRetry {
    max_attempts: Option<u32>,
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    multiplier: Option<f64>,
    jitter: Option<bool>,
}

impl RawConfig {
    fn into_config(self) -> Result<EngineConfig, ConfigError> {
        let defaults = EngineConfig::default();
        let retry_defaults = defaults.retry.clone();
        let retry = RetryPolicy {
            max_attempts: self.retry.max_attempts.unwrap_or(retry_defaults.max_attempts),
            initial_delay: self
                .retry
                .initial_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.initial_delay),
            max_delay: self
                .retry
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.max_delay),
            multiplier: self.retry.multiplier.unwrap_or(retry_defaults.multiplier),
            jitter: self.retry.jitter.unwrap_or(retry_defaults.jitter),
        };
        let config = EngineConfig {
            default_storage_mode: self
                .default_storage_mode
                .unwrap_or(defaults.default_storage_mode),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            retry,
            route_reads_to_replica: self
                .route_reads_to_replica
                .unwrap_or(defaults.route_reads_to_replica),
        };
        config.validate()?;
        Ok(config)
    }
}
