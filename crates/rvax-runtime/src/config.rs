//! Runtime tuning knobs.
//!
//! Values come from [`RuntimeConfig::default`], a JSON document ([`RuntimeConfig::from_json_str`])
//! or `RVAX_*` environment variables ([`RuntimeConfig::from_env`]). Every constructor validates
//! the result.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("invalid config document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Dispatching an event that is not outstanding is an error when set; a no-op otherwise.
    pub throw_on_missing_event: bool,
    /// Staging pool size as a multiple of the device's largest single DMA batch.
    pub staging_overcommit_factor: usize,
    /// Allocation granule of the staging pool.
    pub staging_block_size: u64,
    pub copy_threads_per_device: usize,
    pub error_threads_per_device: usize,
    /// Upper bound on a single wait for transport readiness while a queue is full.
    pub queue_full_poll_ms: u64,
    /// Response dispatcher readiness wait.
    pub response_poll_ms: u64,
    pub kernel_context_slots: usize,
    pub kernel_context_size: u64,
    /// How long the action runner sleeps when no transfer could make progress.
    pub runner_idle_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            throw_on_missing_event: true,
            staging_overcommit_factor: 4,
            staging_block_size: 4096,
            copy_threads_per_device: 2,
            error_threads_per_device: 1,
            queue_full_poll_ms: 1000,
            response_poll_ms: 10,
            kernel_context_slots: 8,
            kernel_context_size: 4096,
            runner_idle_ms: 5,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Start from the defaults and override every field whose `RVAX_*` variable is set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = env_bool("RVAX_THROW_ON_MISSING_EVENT")? {
            config.throw_on_missing_event = v;
        }
        if let Some(v) = env_parse("RVAX_STAGING_OVERCOMMIT_FACTOR")? {
            config.staging_overcommit_factor = v;
        }
        if let Some(v) = env_parse("RVAX_STAGING_BLOCK_SIZE")? {
            config.staging_block_size = v;
        }
        if let Some(v) = env_parse("RVAX_COPY_THREADS_PER_DEVICE")? {
            config.copy_threads_per_device = v;
        }
        if let Some(v) = env_parse("RVAX_ERROR_THREADS_PER_DEVICE")? {
            config.error_threads_per_device = v;
        }
        if let Some(v) = env_parse("RVAX_QUEUE_FULL_POLL_MS")? {
            config.queue_full_poll_ms = v;
        }
        if let Some(v) = env_parse("RVAX_RESPONSE_POLL_MS")? {
            config.response_poll_ms = v;
        }
        if let Some(v) = env_parse("RVAX_KERNEL_CONTEXT_SLOTS")? {
            config.kernel_context_slots = v;
        }
        if let Some(v) = env_parse("RVAX_KERNEL_CONTEXT_SIZE")? {
            config.kernel_context_size = v;
        }
        if let Some(v) = env_parse("RVAX_RUNNER_IDLE_MS")? {
            config.runner_idle_ms = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.staging_overcommit_factor == 0 {
            return Err(ConfigError::Invalid("staging_overcommit_factor must be > 0"));
        }
        if !self.staging_block_size.is_power_of_two() {
            return Err(ConfigError::Invalid(
                "staging_block_size must be a power of two",
            ));
        }
        if self.copy_threads_per_device == 0 || self.error_threads_per_device == 0 {
            return Err(ConfigError::Invalid("thread pools need at least one thread"));
        }
        if self.queue_full_poll_ms == 0 || self.response_poll_ms == 0 {
            return Err(ConfigError::Invalid("poll intervals must be > 0"));
        }
        Ok(())
    }

    pub fn queue_full_poll(&self) -> Duration {
        Duration::from_millis(self.queue_full_poll_ms)
    }

    pub fn response_poll(&self) -> Duration {
        Duration::from_millis(self.response_poll_ms)
    }

    pub fn runner_idle(&self) -> Duration {
        Duration::from_millis(self.runner_idle_ms)
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    let Ok(raw) = std::env::var(var) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv { var, value: raw })
}

fn env_bool(var: &'static str) -> Result<Option<bool>, ConfigError> {
    let Ok(raw) = std::env::var(var) else {
        return Ok(None);
    };
    let v = raw.trim();
    if v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
    {
        Ok(Some(true))
    } else if v == "0"
        || v.eq_ignore_ascii_case("false")
        || v.eq_ignore_ascii_case("no")
        || v.eq_ignore_ascii_case("off")
    {
        Ok(Some(false))
    } else {
        Err(ConfigError::InvalidEnv { var, value: raw })
    }
}
