use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, Priority, RetryPolicy, RuleId};

/// Immutable job submission data.
///
/// `payload` holds the encoded job envelope (see `hoist_core::envelope`):
/// the queue layer treats it as opaque bytes; only the lifecycle engine
/// encodes and decodes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: JobId,
    pub job_type: String,
    pub queue: String,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub retry: RetryPolicy,

    /// Delayed jobs become eligible at this instant.
    pub not_before: Option<DateTime<Utc>>,

    /// Absolute deadline; a retry that would land past it dead-letters
    /// the job instead.
    pub deadline: Option<DateTime<Utc>>,

    /// Tenant-scoped at-most-once enqueue guard, TTL-bounded.
    pub idempotency_key: Option<String>,

    pub trace_id: Option<String>,

    /// Set when the job was materialized from a recurring rule; used to
    /// enforce the rule's `max_concurrent`.
    pub rule_id: Option<RuleId>,
}

impl JobMessage {
    pub fn new(job_type: impl Into<String>, queue: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            job_id: JobId::new(),
            job_type: job_type.into(),
            queue: queue.into(),
            payload,
            priority: Priority::default(),
            retry: RetryPolicy::default(),
            not_before: None,
            deadline: None,
            idempotency_key: None,
            trace_id: None,
            rule_id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn with_deadline(mut self, at: DateTime<Utc>) -> Self {
        self.deadline = Some(at);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_rule_id(mut self, rule_id: RuleId) -> Self {
        self.rule_id = Some(rule_id);
        self
    }

    /// Whether the job targets the delayed partition at enqueue time.
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map(|t| t > now).unwrap_or(false)
    }

    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}
