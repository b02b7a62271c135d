//! Controller configuration.
//!
//! Every field has a default, so an empty TOML document is a valid configuration.
//!
//! ```toml
//! arm_timeout_ms = 2000
//! status_poll_ms = 10
//! timeout_policy = "log_and_continue"
//!
//! [cache]
//! diff_threshold = 0.1
//! rel_tol = 1e-9
//!
//! [monitor]
//! software_margin_s = 1.0
//! poll_interval_ms = 50
//! abort_grace_ms = 500
//!
//! [acquisition]
//! rate = 100000.0
//! start_delay_s = 0.0
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use shotseq_backend::DEFAULT_EPSILON;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Could not read {path}: {msg}")]
    Read { path: String, msg: String },

    #[error("Could not parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What `end_buffered` does when the hardware does not report completion in time
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Abort and return the timeout error
    #[default]
    Fatal,
    /// Abort, log, save the results flagged `failed_shot` and carry on
    LogAndContinue,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Above this fraction of differing rows a full rewrite is issued
    pub diff_threshold: f64,
    /// Relative tolerance for float fields
    pub rel_tol: f64,
}
impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            diff_threshold: 0.10,
            rel_tol: 1e-9,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Added to each wait's scripted timeout before retriggering
    pub software_margin_s: f64,
    /// Upper bound on a single blocking counter read
    pub poll_interval_ms: u64,
    /// How long an abort waits for the monitor thread to go idle
    pub abort_grace_ms: u64,
    pub command_capacity: usize,
}
impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            software_margin_s: 1.0,
            poll_interval_ms: 50,
            abort_grace_ms: 500,
            command_capacity: 4,
        }
    }
}
impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Sample rate of the analog input (Hz)
    pub rate: f64,
    /// Fixed latency between the acquisition start and the shot trigger (s)
    pub start_delay_s: f64,
    pub epsilon: f64,
    /// Samples requested per read
    pub chunk_len: usize,
    /// Capacity of the chunk queue between the reader thread and the controller
    pub queue_capacity: usize,
    pub poll_interval_ms: u64,
    /// How long samples buffered by the input are still read once it was stopped
    pub drain_grace_ms: u64,
}
impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            rate: 1e5,
            start_delay_s: 0.0,
            epsilon: DEFAULT_EPSILON,
            chunk_len: 1000,
            queue_capacity: 64,
            poll_interval_ms: 20,
            drain_grace_ms: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Bound on reaching "armed" after `start()`
    pub arm_timeout_ms: u64,
    pub status_poll_ms: u64,
    pub timeout_policy: TimeoutPolicy,
    pub cache: CacheConfig,
    pub monitor: MonitorConfig,
    pub acquisition: AcquisitionConfig,
}
impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            arm_timeout_ms: 2000,
            status_poll_ms: 10,
            timeout_policy: TimeoutPolicy::Fatal,
            cache: CacheConfig::default(),
            monitor: MonitorConfig::default(),
            acquisition: AcquisitionConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: ControllerConfig =
            toml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.display().to_string(),
            msg: err.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.cache.diff_threshold) {
            return Err(ConfigError::Invalid(format!(
                "cache.diff_threshold must lie in [0, 1], got {}",
                self.cache.diff_threshold
            )));
        }
        if self.cache.rel_tol < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "cache.rel_tol must not be negative, got {}",
                self.cache.rel_tol
            )));
        }
        if self.monitor.software_margin_s < 0.0 || self.monitor.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "monitor.software_margin_s must not be negative and monitor.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.status_poll_ms == 0 {
            return Err(ConfigError::Invalid("status_poll_ms must be positive".to_string()));
        }
        if !(self.acquisition.rate.is_finite() && self.acquisition.rate > 0.0)
            || self.acquisition.chunk_len == 0
            || self.acquisition.queue_capacity == 0
        {
            return Err(ConfigError::Invalid(
                "acquisition.rate, acquisition.chunk_len and acquisition.queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn arm_timeout(&self) -> Duration {
        Duration::from_millis(self.arm_timeout_ms)
    }
    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }
}
