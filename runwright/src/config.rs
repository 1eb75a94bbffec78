//! Engine configuration.
//!
//! Configuration is read from JSON and then overridden from `RUNWRIGHT_*`
//! environment variables.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::policy::RetryConfig;
use crate::utils::duration_from_secs_f64;

/// Configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document is not valid configuration JSON.
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// An environment override could not be parsed.
    #[error("Invalid value '{value}' for {var}")]
    InvalidEnv {
        /// Variable name.
        var: String,
        /// Offending value.
        value: String,
    },

    /// A field holds an unusable value.
    #[error("Invalid {field}: {message}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

fn default_step_timeout_secs() -> f64 {
    3600.0
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_notify_timeout_secs() -> u64 {
    10
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retry budget and backoff.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Timeout for steps that do not set their own.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: f64,
    /// How often in-flight executions are polled.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Cap on in-flight step executions per run; `None` is unbounded.
    #[serde(default)]
    pub max_parallel_steps: Option<usize>,
    /// How long a failure notification may take before it is abandoned.
    #[serde(default = "default_notify_timeout_secs")]
    pub notify_timeout_secs: u64,
    /// Worker every run is placed on, if set.
    #[serde(default)]
    pub preferred_worker: Option<String>,
    /// Environment variables injected into every step.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            default_step_timeout_secs: default_step_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_parallel_steps: None,
            notify_timeout_secs: default_notify_timeout_secs(),
            preferred_worker: None,
            env: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Parses configuration from JSON; missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("Failed to load config file {}", path.display()))
    }

    /// Applies overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup.
    pub fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(v) = parse_var(&lookup, "RUNWRIGHT_MAX_ATTEMPTS")? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "RUNWRIGHT_BASE_DELAY_MS")? {
            self.retry.base_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "RUNWRIGHT_MAX_DELAY_MS")? {
            self.retry.max_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "RUNWRIGHT_STEP_TIMEOUT_SECS")? {
            self.default_step_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "RUNWRIGHT_POLL_INTERVAL_MS")? {
            self.poll_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "RUNWRIGHT_MAX_PARALLEL_STEPS")? {
            self.max_parallel_steps = Some(v);
        }
        if let Some(worker) = lookup("RUNWRIGHT_WORKER").filter(|w| !w.trim().is_empty()) {
            self.preferred_worker = Some(worker);
        }
        self.validate()?;
        Ok(self)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts",
                message: "must be at least 1".into(),
            });
        }
        if !(self.default_step_timeout_secs.is_finite() && self.default_step_timeout_secs > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "default_step_timeout_secs",
                message: "must be a positive number".into(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval_ms",
                message: "must be positive".into(),
            });
        }
        if self.max_parallel_steps == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "max_parallel_steps",
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Default per-attempt timeout.
    #[must_use]
    pub fn default_step_timeout(&self) -> Duration {
        duration_from_secs_f64(self.default_step_timeout_secs)
    }

    /// Poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Notification timeout.
    #[must_use]
    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the default step timeout.
    #[must_use]
    pub fn with_default_step_timeout_secs(mut self, secs: f64) -> Self {
        self.default_step_timeout_secs = secs;
        self
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Caps in-flight steps per run.
    #[must_use]
    pub fn with_max_parallel_steps(mut self, cap: usize) -> Self {
        self.max_parallel_steps = Some(cap);
        self
    }

    /// Pins runs to a worker.
    #[must_use]
    pub fn with_preferred_worker(mut self, worker: impl Into<String>) -> Self {
        self.preferred_worker = Some(worker.into());
        self
    }

    /// Adds an environment variable for every step.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<T>, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv {
            var: var.to_string(),
            value: raw,
        })
}
