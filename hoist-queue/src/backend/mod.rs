pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use std::pin::Pin;
use std::time::Duration;

use hoist_core::tenant::TenantRecord;

use crate::error::QueueResult;
use crate::types::{
    DlqEntry, JobError, JobEvent, JobId, JobMessage, JobRecord, JobState, LeaseToken, LeasedJob,
    QueueCapabilities, QueueConfig, QueueCtx, QueueStats, RecurringRule, RuleId, WorkerId,
    WorkerInfo,
};

/// Type alias for boxed streams (stable Rust compatible).
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Result of an enqueue attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Enqueued { job_id: JobId },
    /// The idempotency key matched a live record; the original job id is
    /// returned so re-submits are safe.
    Duplicate { job_id: JobId },
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Enqueued { job_id } | Self::Duplicate { job_id } => job_id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// What `nack` should do with the job. The lifecycle engine evaluates
/// the retry policy and error class; the backend applies the decision
/// atomically.
#[derive(Debug, Clone, PartialEq)]
pub enum NackDisposition {
    Retry {
        visible_at: DateTime<Utc>,
        /// Throttled failures back off without consuming an attempt.
        count_attempt: bool,
    },
    Dead {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum NackOutcome {
    Requeued { visible_at: DateTime<Utc> },
    DeadLettered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was removed from its partition and is terminal.
    Cancelled,
    /// The job is claimed; cancellation was requested and the worker will
    /// observe it at the next lease extension.
    Requested,
    /// Already terminal; nothing to cancel.
    NotCancellable,
}

/// Storage primitives for the queue.
///
/// Every operation that touches more than one key is atomic: concurrent
/// workers and admins never observe torn state. Only this layer mutates
/// storage; everything above goes through it.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    // ---- job lifecycle ----

    /// Atomically: idempotency guard, tenant quota checks and counter
    /// bumps, queue caps, record write, partition insert.
    async fn enqueue(&self, ctx: &QueueCtx, message: JobMessage) -> QueueResult<EnqueueOutcome>;

    /// Move up to `max_batch` eligible jobs from the ready sequence to the
    /// in-flight set under fresh leases. Paused queues yield nothing.
    /// Fails with `Throttled` when the dequeue rate limit is exhausted.
    async fn claim(
        &self,
        ctx: &QueueCtx,
        queues: &[&str],
        worker: &WorkerId,
        lease: Duration,
        max_batch: usize,
    ) -> QueueResult<Vec<LeasedJob>>;

    /// Acknowledge success. Validates the lease token and rejects
    /// cancelled or terminal jobs.
    async fn ack(&self, ctx: &QueueCtx, job_id: &JobId, token: &LeaseToken) -> QueueResult<()>;

    /// Record a failed attempt and apply the engine's disposition.
    async fn nack(
        &self,
        ctx: &QueueCtx,
        job_id: &JobId,
        token: &LeaseToken,
        error: &JobError,
        disposition: NackDisposition,
    ) -> QueueResult<NackOutcome>;

    /// Extend the lease; validates ownership. Fails with `JobCancelled`
    /// once cancellation has been requested, which is how workers learn
    /// to stop.
    async fn extend_lease(
        &self,
        ctx: &QueueCtx,
        job_id: &JobId,
        token: &LeaseToken,
        extra: Duration,
    ) -> QueueResult<DateTime<Utc>>;

    /// Return a claimed job to the ready sequence without consuming an
    /// attempt (graceful drain past its deadline).
    async fn release_lease(
        &self,
        ctx: &QueueCtx,
        job_id: &JobId,
        token: &LeaseToken,
    ) -> QueueResult<()>;

    async fn cancel(&self, ctx: &QueueCtx, job_id: &JobId) -> QueueResult<CancelOutcome>;

    /// Return jobs with expired leases to the ready sequence, bumping
    /// their attempt count; dead-letters jobs that exhausted attempts.
    /// Idempotent; run periodically by the scheduler.
    async fn reclaim_expired(&self, ctx: &QueueCtx, queue: &str, limit: usize)
        -> QueueResult<Vec<JobId>>;

    /// Move delayed and backoff-waiting jobs whose visibility time has
    /// passed into the ready sequence. Returns the number promoted.
    async fn promote_due(&self, ctx: &QueueCtx, queue: &str, limit: usize) -> QueueResult<u64>;

    /// Move a delayed or ready job to a new visibility time. Claimed and
    /// terminal jobs are not reschedulable.
    async fn reschedule(
        &self,
        ctx: &QueueCtx,
        job_id: &JobId,
        new_time: DateTime<Utc>,
    ) -> QueueResult<()>;

    // ---- inspection ----

    async fn get_record(&self, ctx: &QueueCtx, job_id: &JobId) -> QueueResult<JobRecord>;

    /// List a queue's jobs in enqueue-sequence order, optionally filtered
    /// by state, starting after the given sequence number. Read-only.
    async fn list_jobs(
        &self,
        ctx: &QueueCtx,
        queue: &str,
        state: Option<JobState>,
        after_seq: Option<u64>,
        limit: usize,
    ) -> QueueResult<Vec<JobRecord>>;

    async fn queue_stats(&self, ctx: &QueueCtx, queue: &str) -> QueueResult<QueueStats>;

    async fn list_queues(&self, ctx: &QueueCtx) -> QueueResult<Vec<String>>;

    // ---- queue configuration ----

    async fn get_queue_config(&self, ctx: &QueueCtx, queue: &str) -> QueueResult<QueueConfig>;

    async fn put_queue_config(&self, ctx: &QueueCtx, config: QueueConfig) -> QueueResult<()>;

    async fn set_paused(&self, ctx: &QueueCtx, queue: &str, paused: bool) -> QueueResult<()>;

    /// Remove all jobs in the given states. Destructive; gated upstream.
    async fn purge(&self, ctx: &QueueCtx, queue: &str, states: &[JobState]) -> QueueResult<u64>;

    // ---- dead-letter queue ----

    async fn dlq_entries(
        &self,
        ctx: &QueueCtx,
        queue: &str,
        offset: usize,
        limit: usize,
    ) -> QueueResult<Vec<DlqEntry>>;

    /// Return one dead job to a live queue. Atomic per job.
    async fn dlq_requeue(
        &self,
        ctx: &QueueCtx,
        queue: &str,
        job_id: &JobId,
        target_queue: Option<&str>,
        reset_attempts: bool,
        new_payload: Option<Vec<u8>>,
    ) -> QueueResult<()>;

    async fn dlq_purge(&self, ctx: &QueueCtx, queue: &str) -> QueueResult<u64>;

    /// Replace a stored job's payload envelope (admin transform).
    async fn replace_payload(
        &self,
        ctx: &QueueCtx,
        job_id: &JobId,
        payload: Vec<u8>,
    ) -> QueueResult<()>;

    // ---- recurring rules ----

    async fn put_rule(&self, ctx: &QueueCtx, rule: RecurringRule) -> QueueResult<()>;

    async fn get_rule(&self, ctx: &QueueCtx, rule_id: &RuleId) -> QueueResult<RecurringRule>;

    async fn delete_rule(&self, ctx: &QueueCtx, rule_id: &RuleId) -> QueueResult<()>;

    async fn list_rules(&self, ctx: &QueueCtx) -> QueueResult<Vec<RecurringRule>>;

    /// Conditional insert of the (rule, fire time) materialization guard.
    /// Returns false when the pair already fired; this is what makes rule
    /// evaluation idempotent across restarts.
    async fn try_mark_fired(
        &self,
        ctx: &QueueCtx,
        rule_id: &RuleId,
        fire_time: DateTime<Utc>,
        ttl: Duration,
    ) -> QueueResult<bool>;

    /// Count of non-terminal jobs materialized from the rule.
    async fn rule_inflight(&self, ctx: &QueueCtx, rule_id: &RuleId) -> QueueResult<u64>;

    // ---- tenant registry (system scope) ----

    async fn put_tenant(&self, record: TenantRecord) -> QueueResult<()>;

    async fn get_tenant(&self, tenant_id: &str) -> QueueResult<Option<TenantRecord>>;

    async fn delete_tenant(&self, tenant_id: &str) -> QueueResult<()>;

    async fn list_tenants(&self) -> QueueResult<Vec<TenantRecord>>;

    /// Every tenant with any presence in storage (registry, queues or
    /// rules), registered or implicit. Drives the scheduler sweep.
    async fn list_tenant_ids(&self) -> QueueResult<Vec<String>>;

    // ---- worker registry ----

    async fn register_worker(&self, ctx: &QueueCtx, info: WorkerInfo) -> QueueResult<()>;

    async fn worker_heartbeat(&self, ctx: &QueueCtx, worker: &WorkerId) -> QueueResult<()>;

    async fn set_worker_drain(&self, ctx: &QueueCtx, worker: &WorkerId, drain: bool)
        -> QueueResult<()>;

    async fn list_workers(&self, ctx: &QueueCtx) -> QueueResult<Vec<WorkerInfo>>;

    /// Drop workers whose heartbeat is older than `ttl`; their in-flight
    /// jobs are recovered by `reclaim_expired` when the leases lapse.
    async fn expire_workers(&self, ctx: &QueueCtx, ttl: Duration) -> QueueResult<Vec<WorkerId>>;

    // ---- observability ----

    /// Lifecycle event stream (lossy for slow consumers).
    fn events(&self) -> BoxStream<JobEvent>;

    fn capabilities(&self) -> QueueCapabilities;

    async fn ping(&self) -> QueueResult<()>;
}
