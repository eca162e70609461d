use serde::{Deserialize, Serialize};

use hoist_core::tenant::RatePolicy;

use super::RetryPolicy;

/// Where a retried or reclaimed job rejoins its priority bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryPlacement {
    Head,
    #[default]
    Tail,
}

/// Per-queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,

    /// Hard cap on ready + delayed + in-flight jobs; enqueue fails with
    /// `queue_full` once reached.
    pub max_length: Option<u64>,

    pub paused: bool,

    /// Queue-level rate override; tenant-level limits apply when absent.
    pub rate_limit: Option<RatePolicy>,

    /// Retry policy applied when the submission carries none.
    pub default_retry: RetryPolicy,

    pub retry_placement: RetryPlacement,

    /// Keep succeeded jobs in a capped archive instead of dropping them.
    pub archive_completed: bool,
    pub archive_limit: usize,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_length: None,
            paused: false,
            rate_limit: None,
            default_retry: RetryPolicy::default(),
            retry_placement: RetryPlacement::default(),
            archive_completed: false,
            archive_limit: 1_000,
        }
    }

    pub fn with_max_length(mut self, max: u64) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn with_rate_limit(mut self, policy: RatePolicy) -> Self {
        self.rate_limit = Some(policy);
        self
    }

    pub fn with_default_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn with_retry_placement(mut self, placement: RetryPlacement) -> Self {
        self.retry_placement = placement;
        self
    }

    pub fn with_archive(mut self, limit: usize) -> Self {
        self.archive_completed = true;
        self.archive_limit = limit;
        self
    }
}

/// Per-queue counters. These reconcile with the union of the queue's
/// state partitions at all times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub ready: u64,
    pub delayed: u64,
    pub in_flight: u64,
    pub dead: u64,
    pub succeeded: u64,
    pub cancelled: u64,
    pub enqueued_total: u64,
}

impl QueueStats {
    /// Live backlog counted against queue caps and tenant quotas.
    pub fn backlog(&self) -> u64 {
        self.ready + self.delayed + self.in_flight
    }
}
