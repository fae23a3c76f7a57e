use std::path::{Path, PathBuf};

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cache::DEFAULT_MAX_BYTES;
use crate::logging::LogFormat;
use crate::queue::DEFAULT_NETWORK_POOL_SIZE;
use crate::retry::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_MS, ExponentialBackoff,
};

fn default_cache_max_bytes() -> u64 {
    DEFAULT_MAX_BYTES
}

fn default_network_pool_size() -> usize {
    DEFAULT_NETWORK_POOL_SIZE
}

fn default_retry_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_backoff_multiplier() -> f32 {
    DEFAULT_BACKOFF_MULTIPLIER
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Root directory of the on-disk response cache.
    pub cache_dir: PathBuf,
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: u64,
    #[serde(default = "default_network_pool_size")]
    pub network_pool_size: usize,
    #[serde(default = "default_retry_timeout_ms")]
    pub retry_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f32,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
}

impl Settings {
    /// Loads settings from a TOML file, with `COURIER__`-prefixed
    /// environment variables taking precedence over the file.
    pub fn load(path: &Path) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::from(path.to_path_buf()).required(true))
            .add_source(
                Environment::with_prefix("COURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(to_anyhow)?;
        let settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.cache_max_bytes > 0,
            "cache_max_bytes must be greater than 0 (got {})",
            self.cache_max_bytes
        );
        ensure!(
            self.network_pool_size > 0,
            "network_pool_size must be at least 1 (got {})",
            self.network_pool_size
        );
        ensure!(
            self.retry_timeout_ms > 0,
            "retry_timeout_ms must be greater than 0 (got {})",
            self.retry_timeout_ms
        );
        ensure!(
            self.backoff_multiplier >= 0.0,
            "backoff_multiplier must not be negative (got {})",
            self.backoff_multiplier
        );
        Ok(())
    }

    /// Retry policy matching the configured defaults, for requests that do
    /// not bring their own.
    pub fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            self.retry_timeout_ms,
            self.max_retries,
            self.backoff_multiplier,
        )
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}
