use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CheckpointError, Result};

pub const OPERATION_TIMEOUT_ENV: &str = "CHECKPOINT_OPERATION_TIMEOUT";
pub const MAX_CONFLICT_RETRIES_ENV: &str = "CHECKPOINT_MAX_CONFLICT_RETRIES";
pub const RETRY_DELAY_ENV: &str = "CHECKPOINT_RETRY_DELAY";

/// Behaviour shared by every component sitting on top of a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Upper bound on a single store operation, including lock waits.
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,
    /// How many times a lost head race is replayed before surfacing `Conflict`.
    pub max_conflict_retries: usize,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(10),
            max_conflict_retries: 5,
            retry_delay: Duration::from_millis(5),
        }
    }
}

impl CheckpointConfig {
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: usize) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Read overrides from the environment, falling back to defaults.
    ///
    /// Durations use humantime syntax (`250ms`, `10s`).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var(OPERATION_TIMEOUT_ENV) {
            config.operation_timeout = parse_duration(OPERATION_TIMEOUT_ENV, &raw)?;
        }
        if let Ok(raw) = std::env::var(MAX_CONFLICT_RETRIES_ENV) {
            config.max_conflict_retries = raw.trim().parse().map_err(|_| {
                CheckpointError::invalid_state(format!(
                    "{MAX_CONFLICT_RETRIES_ENV} must be a non-negative integer, got '{raw}'"
                ))
            })?;
        }
        if let Ok(raw) = std::env::var(RETRY_DELAY_ENV) {
            config.retry_delay = parse_duration(RETRY_DELAY_ENV, &raw)?;
        }

        Ok(config)
    }
}

fn parse_duration(var: &str, raw: &str) -> Result<Duration> {
    humantime_serde::re::humantime::parse_duration(raw.trim()).map_err(|e| {
        CheckpointError::invalid_state(format!("{var} is not a valid duration '{raw}': {e}"))
    })
}
