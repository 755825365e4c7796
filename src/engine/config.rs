//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::EngineError;
use crate::download::DEFAULT_USER_AGENT;
use crate::download::constants::CONNECT_TIMEOUT_SECS;
use crate::retry::{DEFAULT_MAX_ATTEMPTS, RetryPolicy};

/// Default number of simultaneous transfers.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Largest accepted concurrency bound.
pub const MAX_CONCURRENT_LIMIT: usize = 100;

/// Default interval of the scheduler tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Settings for a [`DownloadEngine`](super::DownloadEngine).
///
/// Missing fields take their defaults when deserialised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum simultaneous transfers (1..=100).
    pub max_concurrent: usize,
    /// Time allowed until response headers arrive, unless a task overrides it.
    pub connect_timeout: Option<Duration>,
    /// Limit on a whole transfer, unless a task overrides it.
    pub request_timeout: Option<Duration>,
    /// `User-Agent` sent when a task sets none.
    pub user_agent: String,
    /// Scheduler tick; also the cadence of progress syncs while transferring.
    pub tick_interval: Duration,
    /// Extra attempts for requests that fail before any response.
    pub request_retries: u32,
    /// Attempts for a repository write that hits a busy database.
    pub persistence_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            connect_timeout: Some(Duration::from_secs(CONNECT_TIMEOUT_SECS)),
            request_timeout: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            request_retries: 0,
            persistence_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    #[must_use]
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] for a bound outside
    /// 1..=100 and [`EngineError::InvalidConfig`] for a zero tick interval.
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_concurrency(self.max_concurrent)?;
        if self.tick_interval.is_zero() {
            return Err(EngineError::InvalidConfig(
                "tick_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Retry policy for transport requests.
    #[must_use]
    pub fn request_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(self.request_retries.saturating_add(1))
    }

    /// Retry policy for repository writes.
    #[must_use]
    pub fn persistence_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(self.persistence_attempts)
    }
}

pub(crate) fn validate_concurrency(value: usize) -> Result<(), EngineError> {
    if (1..=MAX_CONCURRENT_LIMIT).contains(&value) {
        Ok(())
    } else {
        Err(EngineError::InvalidConcurrency { value })
    }
}
