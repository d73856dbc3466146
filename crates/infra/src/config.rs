//! Configuration loading and representation.
//!
//! Every setting has a default; `STOCKFLOW_*` environment variables override
//! them. Unset variables fall back silently, while set-but-invalid values are
//! rejected rather than guessed at.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::publisher::PublisherConfig;
use crate::scheduler::RetrySchedulerConfig;
use crate::stock_ledger::{LedgerConfig, LockingMode};

pub const LOCKING: &str = "STOCKFLOW_LOCKING";
pub const OPTIMISTIC_MAX_ATTEMPTS: &str = "STOCKFLOW_OPTIMISTIC_MAX_ATTEMPTS";
pub const OPTIMISTIC_BASE_DELAY_MS: &str = "STOCKFLOW_OPTIMISTIC_BASE_DELAY_MS";
pub const OPTIMISTIC_MAX_DELAY_MS: &str = "STOCKFLOW_OPTIMISTIC_MAX_DELAY_MS";
pub const LOCK_TIMEOUT_MS: &str = "STOCKFLOW_LOCK_TIMEOUT_MS";
pub const TOPIC: &str = "STOCKFLOW_TOPIC";
pub const SUCCESS_TOPIC: &str = "STOCKFLOW_SUCCESS_TOPIC";
pub const FAILURE_TOPIC: &str = "STOCKFLOW_FAILURE_TOPIC";
pub const PUBLISH_TIMEOUT_MS: &str = "STOCKFLOW_PUBLISH_TIMEOUT_MS";
pub const PUBLISH_MAX_IN_FLIGHT: &str = "STOCKFLOW_PUBLISH_MAX_IN_FLIGHT";
pub const RETRY_INTERVAL_SECS: &str = "STOCKFLOW_RETRY_INTERVAL_SECS";
pub const RETRY_MAX_ATTEMPTS: &str = "STOCKFLOW_RETRY_MAX_ATTEMPTS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Full runtime configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StockflowConfig {
    pub ledger: LedgerConfig,
    pub publisher: PublisherConfig,
    pub retry: RetrySchedulerConfig,
}

impl StockflowConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; unset keys keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut config = Self::default();

        if let Some(mode) = env.parse::<LockingMode>(LOCKING)? {
            config.ledger.mode = mode;
        }
        if let Some(n) = env.positive::<u32>(OPTIMISTIC_MAX_ATTEMPTS)? {
            config.ledger.retry.max_attempts = n;
        }
        if let Some(ms) = env.parse::<u64>(OPTIMISTIC_BASE_DELAY_MS)? {
            config.ledger.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env.parse::<u64>(OPTIMISTIC_MAX_DELAY_MS)? {
            config.ledger.retry.max_delay = Duration::from_millis(ms);
        }
        if config.ledger.retry.max_delay < config.ledger.retry.base_delay {
            warn!(
                base_delay_ms = config.ledger.retry.base_delay.as_millis() as u64,
                max_delay_ms = config.ledger.retry.max_delay.as_millis() as u64,
                "optimistic max delay below base delay; delays are capped at the max"
            );
        }
        if let Some(ms) = env.positive::<u64>(LOCK_TIMEOUT_MS)? {
            config.ledger.lock_timeout = Duration::from_millis(ms);
        }

        if let Some(topic) = env.text(TOPIC) {
            config.publisher.default_topic = topic;
        }
        config.publisher.success_topic = env.text(SUCCESS_TOPIC);
        config.publisher.failure_topic = env.text(FAILURE_TOPIC);
        if let Some(ms) = env.positive::<u64>(PUBLISH_TIMEOUT_MS)? {
            config.publisher.publish_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env.positive::<usize>(PUBLISH_MAX_IN_FLIGHT)? {
            config.publisher.max_in_flight = n;
        }

        if let Some(secs) = env.positive::<u64>(RETRY_INTERVAL_SECS)? {
            config.retry.interval = Duration::from_secs(secs);
        }
        if let Some(n) = env.positive::<u32>(RETRY_MAX_ATTEMPTS)? {
            config.retry.max_attempts = n;
        }

        debug!(
            locking = config.ledger.mode.as_str(),
            topic = %config.publisher.default_topic,
            retry_interval_secs = config.retry.interval.as_secs(),
            retry_max_attempts = config.retry.max_attempts,
            "configuration loaded"
        );
        Ok(config)
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &'static str) -> Option<String> {
        (self.0)(key)
    }

    /// Non-empty trimmed text; an empty value counts as unset.
    fn text(&self, key: &'static str) -> Option<String> {
        self.raw(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(value) = self.text(key) else {
            return Ok(None);
        };
        value
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(key, &value, e.to_string()))
    }

    fn positive<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr + PartialEq + Default,
        T::Err: std::fmt::Display,
    {
        match self.parse::<T>(key)? {
            Some(n) if n == T::default() => Err(ConfigError::invalid(key, "0", "must be greater than zero")),
            other => Ok(other),
        }
    }
}
