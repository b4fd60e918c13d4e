//! Coordinator configuration, loaded from TOML.
//!
//! Every key is optional. Durations are integer milliseconds (`*_ms`).
//!
//! ```toml
//! [scheduler]
//! tick_interval_ms = 10000
//! backoff_cap_index = 8
//!
//! [queue]
//! heartbeat_ms = 5000
//! topic_prefix = "prod"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::app::SchedulerSettings;
use crate::domain::IterationStrategy;
use crate::queue::QueueSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    pub scheduler: SchedulerConfig,
    pub lock: LockConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub batch_size: usize,
    pub backoff_cap_index: u32,
    pub backoff_unit_ms: u64,
    pub assigner_iterations: usize,
    pub stuck_check_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 10_000,
            batch_size: 100,
            backoff_cap_index: 8,
            backoff_unit_ms: 60_000,
            assigner_iterations: 3,
            stuck_check_interval_ms: 600_000,
        }
    }
}

impl SchedulerConfig {
    pub fn settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            batch_size: self.batch_size,
            strategy: IterationStrategy::Fibonacci {
                unit: Duration::from_millis(self.backoff_unit_ms),
                cap_index: self.backoff_cap_index,
            },
            assigner_iterations: self.assigner_iterations,
            stuck_check_interval: Duration::from_millis(self.stuck_check_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub wait_poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_poll_interval_ms: 100,
        }
    }
}

impl LockConfig {
    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    pub heartbeat_ms: u64,
    pub renewal_margin_ms: u64,
    pub get_wait_ms: u64,
    pub get_poll_ms: u64,
    pub standby_poll_ms: u64,
    pub default_retries: u32,
    pub message_ttl_ms: u64,
    pub topic_prefix: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 5_000,
            renewal_margin_ms: 500,
            get_wait_ms: 3_000,
            get_poll_ms: 1_000,
            standby_poll_ms: 1_000,
            default_retries: 3,
            message_ttl_ms: 7 * 24 * 3_600_000,
            topic_prefix: None,
        }
    }
}

impl QueueConfig {
    pub fn settings(&self) -> QueueSettings {
        QueueSettings {
            heartbeat: Duration::from_millis(self.heartbeat_ms),
            renewal_margin: Duration::from_millis(self.renewal_margin_ms),
            get_wait: Duration::from_millis(self.get_wait_ms),
            get_poll: Duration::from_millis(self.get_poll_ms),
            standby_poll: Duration::from_millis(self.standby_poll_ms),
            default_retries: self.default_retries,
            message_ttl: Duration::from_millis(self.message_ttl_ms),
            topic_prefix: self.topic_prefix.clone(),
        }
    }
}

impl CoordinatorConfig {
    /// Defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&data)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(data: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("scheduler.tick_interval_ms must be > 0".into()));
        }
        if self.scheduler.batch_size == 0 {
            return Err(ConfigError::Invalid("scheduler.batch_size must be > 0".into()));
        }
        if self.queue.heartbeat_ms == 0 {
            return Err(ConfigError::Invalid("queue.heartbeat_ms must be > 0".into()));
        }
        if self.queue.renewal_margin_ms >= self.queue.heartbeat_ms {
            return Err(ConfigError::Invalid(
                "queue.renewal_margin_ms must be smaller than queue.heartbeat_ms".into(),
            ));
        }
        Ok(())
    }
}
