//! Retry policy with capped exponential backoff.
//!
//! Delays are deterministic (no jitter): attempt `n` that fails waits
//! `backoff_initial * backoff_multiplier^(n-1)`, capped at `backoff_max`,
//! before attempt `n + 1`. Runs are meant to be reproducible, and only one
//! orchestrator talks to a cluster at a time, so there is no herd to spread.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How often a failing operation is retried and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `1` means no retry.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(
        rename = "backoff_initial_seconds",
        with = "crate::serde_secs",
        default = "default_backoff_initial"
    )]
    pub backoff_initial: Duration,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(
        rename = "backoff_max_seconds",
        with = "crate::serde_secs",
        default = "default_backoff_max"
    )]
    pub backoff_max: Duration,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_initial() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(30)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_initial: default_backoff_initial(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max: default_backoff_max(),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    pub fn backoff(mut self, initial: Duration, multiplier: f64, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_multiplier = multiplier;
        self.backoff_max = max;
        self
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.backoff_initial.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.backoff_max.as_secs_f64() {
            return self.backoff_max;
        }
        Duration::from_secs_f64(secs)
    }

    /// Check the policy is usable. Returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        if self.backoff_initial > self.backoff_max {
            return Err(format!(
                "backoff_initial ({:?}) exceeds backoff_max ({:?})",
                self.backoff_initial, self.backoff_max
            ));
        }
        Ok(())
    }
}

/// Sleep for `delay` unless `cancel` fires first.
///
/// Returns `true` if the full delay elapsed, `false` if cancelled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
