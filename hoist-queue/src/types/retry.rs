use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::WorkerId;

/// Exponential backoff policy with full jitter.
///
/// `delay = min(cap_ms, base_ms * multiplier^(attempt-1))`, then widened
/// by `jitter_fraction` in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub cap_ms: u64,
    pub multiplier: f64,
    /// In `[0, 1]`. 0 gives deterministic delays.
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_ms: 1_000,
            cap_ms: 3_600_000,
            multiplier: 2.0,
            jitter_fraction: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the given attempt (1-based).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(63);
        let raw = self.base_ms as f64 * self.multiplier.powi(exp as i32);
        let capped = raw.min(self.cap_ms as f64);

        let jitter = self.jitter_fraction.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return capped as u64;
        }
        let roll: f64 = rand::thread_rng().gen();
        (capped * (1.0 - jitter + 2.0 * jitter * roll)) as u64
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err("jitter_fraction must be in [0, 1]".into());
        }
        if self.multiplier < 1.0 {
            return Err("multiplier must be >= 1".into());
        }
        if self.cap_ms < self.base_ms {
            return Err("cap_ms must be >= base_ms".into());
        }
        Ok(())
    }
}

/// How a handler failure should be treated by the lifecycle engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Schedule a retry if attempts remain.
    Retryable,
    /// Dead-letter immediately, the input can never succeed.
    NonRetryable,
    /// Back off without consuming an attempt; carries a reset hint.
    Throttled,
    /// Dead-letter immediately regardless of attempts; reserved for
    /// errors the handler marks as unrecoverable.
    Poison,
}

/// Job execution outcome reported by a handler.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
    /// Minimum backoff for `Throttled` failures, from the rate-limit
    /// reset hint.
    pub retry_after_ms: Option<u64>,
}

impl JobError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::NonRetryable,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn throttled(message: impl Into<String>, retry_after_ms: u64) -> Self {
        Self {
            kind: FailureKind::Throttled,
            message: message.into(),
            retry_after_ms: Some(retry_after_ms),
        }
    }

    pub fn poison(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Poison,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, FailureKind::Retryable | FailureKind::Throttled)
    }
}

/// One entry of a job's error chain, preserved into the DLQ snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptError {
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub worker_id: Option<WorkerId>,
    pub kind: FailureKind,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_without_jitter() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_ms: 100,
            cap_ms: 60_000,
            multiplier: 2.0,
            jitter_fraction: 0.0,
        };
        assert_eq!(policy.delay_ms(1), 100);
        assert_eq!(policy.delay_ms(2), 200);
        assert_eq!(policy.delay_ms(3), 400);
    }

    #[test]
    fn cap_applies() {
        let policy = RetryPolicy {
            max_attempts: 30,
            base_ms: 100,
            cap_ms: 1_000,
            multiplier: 2.0,
            jitter_fraction: 0.0,
        };
        assert_eq!(policy.delay_ms(20), 1_000);
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_ms: 1_000,
            cap_ms: 60_000,
            multiplier: 2.0,
            jitter_fraction: 0.5,
        };
        for _ in 0..100 {
            let d = policy.delay_ms(1);
            assert!((500..=1_500).contains(&d), "delay out of band: {d}");
        }
    }

    #[test]
    fn overflow_safe_for_large_attempts() {
        let policy = RetryPolicy::default();
        // Must not panic or wrap for absurd attempt counts.
        assert_eq!(policy.delay_ms(10_000), policy.cap_ms);
    }

    #[test]
    fn validation_catches_bad_policies() {
        let mut policy = RetryPolicy::default();
        policy.max_attempts = 0;
        assert!(policy.validate().is_err());

        let mut policy = RetryPolicy::default();
        policy.jitter_fraction = 1.5;
        assert!(policy.validate().is_err());
    }
}
