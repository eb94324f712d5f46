use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay policy applied between retry attempts after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Constant delay before every retry
    #[serde(rename_all = "camelCase")]
    Fixed { base_delay_ms: u64 },

    /// Delay doubles with each completed attempt:
    /// `base_delay_ms * 2^(attempts_made - 1)`
    #[serde(rename_all = "camelCase")]
    Exponential { base_delay_ms: u64 },
}

impl BackoffPolicy {
    /// Delay to apply before the next retry, given the number of attempts
    /// already made (the attempt that just failed counts).
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Self::Fixed { base_delay_ms } => Duration::from_millis(base_delay_ms),
            Self::Exponential { base_delay_ms } => {
                let factor = 2u64.saturating_pow(attempts_made.saturating_sub(1));
                Duration::from_millis(base_delay_ms.saturating_mul(factor))
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential { base_delay_ms: 1_000 }
    }
}

/// Per-job execution options, merged from queue defaults and per-job
/// overrides at enqueue time (job overrides win field-wise).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    /// Higher priority jobs are dispatched first; ties break FIFO
    pub priority: i32,

    /// Initial delay before the job becomes eligible for pickup
    pub delay_ms: u64,

    /// Total execution attempts allowed (minimum 1)
    pub max_attempts: u32,

    /// Retry delay policy
    pub backoff: BackoffPolicy,

    /// How many completed jobs to retain per queue before pruning
    pub retain_on_complete: usize,

    /// How many failed jobs to retain per queue before pruning
    pub retain_on_fail: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay_ms: 0,
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            retain_on_complete: 100,
            retain_on_fail: 200,
        }
    }
}

impl JobOptions {
    /// Apply per-job overrides on top of these defaults.
    pub fn merged(&self, patch: &JobOptionsPatch) -> Self {
        Self {
            priority: patch.priority.unwrap_or(self.priority),
            delay_ms: patch.delay_ms.unwrap_or(self.delay_ms),
            max_attempts: patch.max_attempts.unwrap_or(self.max_attempts).max(1),
            backoff: patch.backoff.unwrap_or(self.backoff),
            retain_on_complete: patch.retain_on_complete.unwrap_or(self.retain_on_complete),
            retain_on_fail: patch.retain_on_fail.unwrap_or(self.retain_on_fail),
        }
    }
}

/// Partial options as submitted by callers. Field aliases keep the wire
/// form compatible with the desktop client (`delay`, `attempts`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptionsPatch {
    pub priority: Option<i32>,

    #[serde(alias = "delay")]
    pub delay_ms: Option<u64>,

    #[serde(alias = "attempts")]
    pub max_attempts: Option<u32>,

    pub backoff: Option<BackoffPolicy>,

    pub retain_on_complete: Option<usize>,

    pub retain_on_fail: Option<usize>,
}
