//! Retry policy engine.
//!
//! A pure decision function: given the number of prior failures and the
//! monitor's policy, either schedule the next attempt after a backoff delay
//! or abandon the monitor. The engine performs no I/O; the coordinator
//! turns its output into worker commands.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay formula applied between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Always the base delay
    Fixed,
    /// Base delay multiplied by the 1-indexed attempt number
    Linear,
    /// Base delay doubled for every prior failure
    Exponential,
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" => Ok(BackoffStrategy::Exponential),
            other => Err(format!("unknown backoff strategy '{other}'")),
        }
    }
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffStrategy::Fixed => write!(f, "fixed"),
            BackoffStrategy::Linear => write!(f, "linear"),
            BackoffStrategy::Exponential => write!(f, "exponential"),
        }
    }
}

/// How a monitor reacts to operational failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures tolerated before shutdown. 0 shuts down on the first
    /// failure; `None` (null in the document) retries without bound.
    pub max_retries: Option<u32>,

    pub backoff_strategy: BackoffStrategy,

    /// Base delay in milliseconds, strictly positive
    pub retry_timeout: u64,
}

/// Command for a protocol worker after an operational failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Re-arm the probe after the delay
    Retry { delay: Duration },
    /// Cancel pending timers and terminate
    Shutdown,
}

/// Decide how to recover from the failure numbered `retry_count + 1`.
///
/// `retry_count` is the number of failures prior to the current one.
pub fn decide(retry_count: u32, policy: &RetryPolicy) -> RecoveryAction {
    if let Some(max_retries) = policy.max_retries {
        if retry_count >= max_retries {
            return RecoveryAction::Shutdown;
        }
    }

    let delay_ms = match policy.backoff_strategy {
        BackoffStrategy::Fixed => policy.retry_timeout,
        BackoffStrategy::Linear => policy.retry_timeout.saturating_mul(retry_count as u64 + 1),
        BackoffStrategy::Exponential => {
            policy.retry_timeout.saturating_mul(2u64.saturating_pow(retry_count))
        }
    };

    RecoveryAction::Retry { delay: Duration::from_millis(delay_ms) }
}
