//! In-memory backend.
//!
//! The reference implementation of the storage contract, used by tests
//! and single-process deployments. One lock guards all state, so every
//! trait operation is naturally atomic; the Redis backend reproduces the
//! same semantics with one Lua script per operation.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::warn;

use hoist_core::tenant::TenantRecord;

use crate::backend::{
    BoxStream, CancelOutcome, EnqueueOutcome, NackDisposition, NackOutcome, QueueBackend,
};
use crate::dlq::error_fingerprint;
use crate::error::{QueueError, QueueResult};
use crate::quota::{at_soft_threshold, Direction, TenantUsage, TokenBucket};
use crate::types::{
    AttemptError, DlqEntry, FailureKind, JobError, JobEvent, JobId, JobMessage, JobRecord,
    JobState, JobStatus, LeaseToken, LeasedJob, QueueCapabilities, QueueConfig, QueueCtx,
    QueueStats, RecurringRule, RetryPlacement, RuleId, WorkerId, WorkerInfo,
};

/// Ordering key within the ready sequence: higher priority first, then
/// FIFO by insertion position. Head placements use negative positions.
type ReadyKey = (Reverse<u8>, i64);

#[derive(Debug)]
struct QueueState {
    config: QueueConfig,
    /// Enqueue sequence source; also the pagination sort key.
    next_seq: u64,
    /// Ready-position counters; head inserts walk downward.
    pos_tail: i64,
    pos_head: i64,
    ready: BTreeMap<ReadyKey, JobId>,
    /// Delayed and backoff-waiting jobs, keyed by visibility instant.
    delayed: BTreeMap<(i64, i64), JobId>,
    /// Claimed jobs with their lease expiry.
    inflight: HashMap<JobId, DateTime<Utc>>,
    dlq: VecDeque<DlqEntry>,
    archive: VecDeque<JobId>,
    enqueued_total: u64,
    succeeded_total: u64,
    cancelled_total: u64,
}

impl QueueState {
    fn new(name: &str) -> Self {
        Self {
            config: QueueConfig::new(name),
            next_seq: 0,
            pos_tail: 0,
            pos_head: 0,
            ready: BTreeMap::new(),
            delayed: BTreeMap::new(),
            inflight: HashMap::new(),
            dlq: VecDeque::new(),
            archive: VecDeque::new(),
            enqueued_total: 0,
            succeeded_total: 0,
            cancelled_total: 0,
        }
    }

    fn backlog(&self) -> u64 {
        (self.ready.len() + self.delayed.len() + self.inflight.len()) as u64
    }

    fn push_ready(&mut self, priority: u8, job_id: JobId, placement: RetryPlacement) {
        let pos = match placement {
            RetryPlacement::Tail => {
                self.pos_tail += 1;
                self.pos_tail
            }
            RetryPlacement::Head => {
                self.pos_head -= 1;
                self.pos_head
            }
        };
        self.ready.insert((Reverse(priority), pos), job_id);
    }

    fn push_delayed(&mut self, visible_at: DateTime<Utc>, job_id: JobId) {
        self.pos_tail += 1;
        self.delayed
            .insert((visible_at.timestamp_millis(), self.pos_tail), job_id);
    }

    fn remove_from_partitions(&mut self, job_id: &JobId) {
        self.ready.retain(|_, id| id != job_id);
        self.delayed.retain(|_, id| id != job_id);
        self.inflight.remove(job_id);
    }
}

#[derive(Debug)]
struct IdemEntry {
    job_id: JobId,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    tenants: HashMap<String, TenantRecord>,
    usage: HashMap<String, TenantUsage>,
    queues: HashMap<(String, String), QueueState>,
    jobs: HashMap<JobId, JobRecord>,
    idempotency: HashMap<(String, String), IdemEntry>,
    rules: HashMap<(String, String), RecurringRule>,
    fired: HashMap<(String, String, i64), DateTime<Utc>>,
    workers: HashMap<(String, String), WorkerInfo>,
    rate_buckets: HashMap<(String, String, Direction), TokenBucket>,
}

impl Inner {
    fn queue_mut(&mut self, tenant: &str, queue: &str) -> &mut QueueState {
        self.queues
            .entry((tenant.to_string(), queue.to_string()))
            .or_insert_with(|| QueueState::new(queue))
    }

    fn queue(&self, tenant: &str, queue: &str) -> Option<&QueueState> {
        self.queues.get(&(tenant.to_string(), queue.to_string()))
    }

    fn tenant_or_default(&self, tenant_id: &str) -> TenantRecord {
        self.tenants
            .get(tenant_id)
            .cloned()
            .unwrap_or_else(|| TenantRecord::new(tenant_id))
    }

    fn tenant_backlog(&self, tenant_id: &str) -> u64 {
        self.queues
            .iter()
            .filter(|((t, _), _)| t == tenant_id)
            .map(|(_, q)| q.backlog())
            .sum()
    }

    /// Job record lookup with the tenant check every operation performs.
    /// Cross-tenant ids report not-found, never forbidden, so ids do not
    /// leak across namespaces.
    fn record_mut(&mut self, ctx: &QueueCtx, job_id: &JobId) -> QueueResult<&mut JobRecord> {
        match self.jobs.get_mut(job_id) {
            Some(record) if record.tenant_id == ctx.tenant_id => Ok(record),
            _ => Err(QueueError::JobNotFound(job_id.to_string())),
        }
    }

    fn record(&self, ctx: &QueueCtx, job_id: &JobId) -> QueueResult<&JobRecord> {
        match self.jobs.get(job_id) {
            Some(record) if record.tenant_id == ctx.tenant_id => Ok(record),
            _ => Err(QueueError::JobNotFound(job_id.to_string())),
        }
    }
}

pub struct MemoryBackend {
    inner: Arc<RwLock<Inner>>,
    events: broadcast::Sender<JobEvent>,
    idem_ttl: Duration,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            events,
            idem_ttl: Duration::from_secs(24 * 3600),
        }
    }

    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idem_ttl = ttl;
        self
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    /// Validate lease ownership and liveness for ack/nack/extend.
    fn check_lease(record: &JobRecord, token: &LeaseToken, now: DateTime<Utc>) -> QueueResult<()> {
        match &record.status {
            JobStatus::Cancelled { .. } => return Err(QueueError::JobCancelled),
            s if s.is_terminal() => return Err(QueueError::JobAlreadyTerminal),
            _ => {}
        }
        if record.lease_token.as_ref() != Some(token) {
            return Err(QueueError::InvalidLeaseToken);
        }
        if let Some(until) = record.lease_until {
            if now >= until {
                return Err(QueueError::LeaseExpired);
            }
        }
        Ok(())
    }

    fn promote_locked(
        inner: &mut Inner,
        tenant: &str,
        queue: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Vec<(JobId, JobEvent)> {
        let mut promoted = Vec::new();
        let now_ms = now.timestamp_millis();

        // Paused queues hold their delayed jobs back too.
        let due: Vec<(i64, i64)> = match inner.queue(tenant, queue) {
            Some(q) if !q.config.paused => q
                .delayed
                .range(..=(now_ms, i64::MAX))
                .take(limit)
                .map(|(k, _)| *k)
                .collect(),
            _ => return promoted,
        };

        for key in due {
            let job_id = {
                let q = inner.queue_mut(tenant, queue);
                match q.delayed.remove(&key) {
                    Some(id) => id,
                    None => continue,
                }
            };
            let (priority, placement, alive) = match inner.jobs.get_mut(&job_id) {
                Some(record) => {
                    let placement = match record.status {
                        JobStatus::Retrying { .. } => None, // per queue config
                        _ => Some(RetryPlacement::Tail),
                    };
                    let alive = !record.status.is_terminal();
                    if alive {
                        record.status = JobStatus::Ready;
                        record.updated_at = now;
                    }
                    (record.message.priority.get(), placement, alive)
                }
                None => continue,
            };
            if !alive {
                continue;
            }
            let q = inner.queue_mut(tenant, queue);
            let placement = placement.unwrap_or(q.config.retry_placement);
            q.push_ready(priority, job_id.clone(), placement);
            promoted.push((
                job_id.clone(),
                JobEvent::Promoted {
                    job_id,
                    queue: queue.to_string(),
                    at: now,
                },
            ));
        }
        promoted
    }

    fn dead_letter_locked(
        inner: &mut Inner,
        record_id: &JobId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<JobEvent> {
        let record = inner.jobs.get_mut(record_id)?;
        record.die(reason, now);
        let snapshot = record.clone();
        let tenant = snapshot.tenant_id.clone();
        let queue_name = snapshot.message.queue.clone();
        let fingerprint = error_fingerprint(snapshot.last_error.as_deref().unwrap_or(reason));
        let q = inner.queue_mut(&tenant, &queue_name);
        q.inflight.remove(record_id);
        q.dlq.push_back(DlqEntry {
            record: snapshot,
            original_queue: queue_name,
            fingerprint,
            died_at: now,
        });
        Some(JobEvent::Dead {
            job_id: record_id.clone(),
            error: reason.to_string(),
            at: now,
        })
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryBackend {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            events: self.events.clone(),
            idem_ttl: self.idem_ttl,
        }
    }
}

/// Deterministic test helpers; tests drive lease expiry explicitly
/// instead of sleeping through wall-clock leases.
impl MemoryBackend {
    pub fn force_lease_expiry(&self, job_id: &JobId) {
        let mut inner = self.inner.write();
        let expired = Utc::now() - chrono::Duration::seconds(1);
        let key = match inner.jobs.get_mut(job_id) {
            Some(record) => {
                if let JobStatus::Claimed { ref mut lease_until } = record.status {
                    *lease_until = expired;
                }
                record.lease_until = Some(expired);
                (record.tenant_id.clone(), record.message.queue.clone())
            }
            None => return,
        };
        if let Some(q) = inner.queues.get_mut(&key) {
            if let Some(entry) = q.inflight.get_mut(job_id) {
                *entry = expired;
            }
        }
    }

    pub fn force_idempotency_expiry(&self, tenant: &str, key: &str) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner
            .idempotency
            .get_mut(&(tenant.to_string(), key.to_string()))
        {
            entry.expires_at = Utc::now() - chrono::Duration::seconds(1);
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn enqueue(&self, ctx: &QueueCtx, message: JobMessage) -> QueueResult<EnqueueOutcome> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let tenant = inner.tenant_or_default(&ctx.tenant_id);
        if !tenant.is_active() {
            return Err(QueueError::TenantSuspended(ctx.tenant_id.clone()));
        }

        // Idempotency guard first: a duplicate is not an error and must
        // not consume quota.
        if let Some(key) = &message.idempotency_key {
            let scope = (ctx.tenant_id.clone(), key.clone());
            if let Some(entry) = inner.idempotency.get(&scope) {
                if entry.expires_at > now {
                    return Ok(EnqueueOutcome::Duplicate {
                        job_id: entry.job_id.clone(),
                    });
                }
            }
        }

        let payload_size = message.payload_size();
        if payload_size > tenant.quotas.max_payload_bytes {
            return Err(QueueError::PayloadTooLarge {
                size: payload_size,
                max: tenant.quotas.max_payload_bytes,
            });
        }

        let queue_exists = inner.queue(&ctx.tenant_id, &message.queue).is_some();
        if !queue_exists {
            let queue_count = inner
                .queues
                .keys()
                .filter(|(t, _)| *t == ctx.tenant_id)
                .count() as u32;
            if queue_count >= tenant.quotas.max_queues {
                return Err(QueueError::QuotaExceeded(format!(
                    "tenant {} is at its queue cap ({})",
                    ctx.tenant_id, tenant.quotas.max_queues
                )));
            }
        }

        // Queue and tenant backlog caps.
        if let Some(q) = inner.queue(&ctx.tenant_id, &message.queue) {
            if let Some(max_length) = q.config.max_length {
                if q.backlog() >= max_length {
                    return Err(QueueError::QueueFull(format!(
                        "queue {} is at its length cap ({max_length})",
                        message.queue
                    )));
                }
            }
        }
        let backlog = inner.tenant_backlog(&ctx.tenant_id);
        if backlog >= tenant.quotas.max_backlog {
            return Err(QueueError::QueueFull(format!(
                "tenant {} backlog is at its cap ({})",
                ctx.tenant_id, tenant.quotas.max_backlog
            )));
        } else if at_soft_threshold(backlog, tenant.quotas.max_backlog) {
            warn!(tenant = %ctx.tenant_id, backlog, limit = tenant.quotas.max_backlog,
                "tenant backlog approaching cap");
        }

        // Rolling windows and storage.
        {
            let usage = inner.usage.entry(ctx.tenant_id.clone()).or_default();
            let hour = usage.hour.sum(now);
            if hour >= tenant.quotas.max_jobs_per_hour {
                return Err(QueueError::QuotaExceeded(format!(
                    "tenant {} exceeded {} jobs/hour",
                    ctx.tenant_id, tenant.quotas.max_jobs_per_hour
                )));
            } else if at_soft_threshold(hour, tenant.quotas.max_jobs_per_hour) {
                warn!(tenant = %ctx.tenant_id, used = hour, limit = tenant.quotas.max_jobs_per_hour,
                    "hourly job quota approaching cap");
            }
            let day = usage.day.sum(now);
            if day >= tenant.quotas.max_jobs_per_day {
                return Err(QueueError::QuotaExceeded(format!(
                    "tenant {} exceeded {} jobs/day",
                    ctx.tenant_id, tenant.quotas.max_jobs_per_day
                )));
            } else if at_soft_threshold(day, tenant.quotas.max_jobs_per_day) {
                warn!(tenant = %ctx.tenant_id, used = day, limit = tenant.quotas.max_jobs_per_day,
                    "daily job quota approaching cap");
            }
            let storage = usage.storage_bytes + payload_size as u64;
            if storage > tenant.quotas.max_storage_bytes {
                return Err(QueueError::StorageExceeded(format!(
                    "tenant {} exceeded {} storage bytes",
                    ctx.tenant_id, tenant.quotas.max_storage_bytes
                )));
            } else if at_soft_threshold(storage, tenant.quotas.max_storage_bytes) {
                warn!(tenant = %ctx.tenant_id, used = storage, limit = tenant.quotas.max_storage_bytes,
                    "storage quota approaching cap");
            }
        }

        // Enqueue-side rate limit.
        let policy = inner
            .queue(&ctx.tenant_id, &message.queue)
            .and_then(|q| q.config.rate_limit)
            .unwrap_or(tenant.rate_limits.enqueue);
        if !policy.is_unlimited() {
            let key = (
                ctx.tenant_id.clone(),
                message.queue.clone(),
                Direction::Enqueue,
            );
            let bucket = inner
                .rate_buckets
                .entry(key)
                .or_insert_with(|| TokenBucket::full(&policy, now));
            if let Err(retry_after_ms) = bucket.try_take(&policy, now, 1.0) {
                return Err(QueueError::Throttled { retry_after_ms });
            }
        }

        // All checks passed; mutate.
        let tenant_id = ctx.tenant_id.clone();
        let queue_name = message.queue.clone();
        let job_type = message.job_type.clone();
        let idempotency_key = message.idempotency_key.clone();
        let delayed = message.is_delayed(now);
        let not_before = message.not_before;
        let priority = message.priority.get();

        let q = inner.queue_mut(&tenant_id, &queue_name);
        q.next_seq += 1;
        q.enqueued_total += 1;
        let seq = q.next_seq;
        let record = JobRecord::new(tenant_id.as_str(), message, seq, now);
        let job_id = record.job_id.clone();
        if delayed {
            let visible = not_before.unwrap_or(now);
            q.push_delayed(visible, job_id.clone());
        } else {
            q.push_ready(priority, job_id.clone(), RetryPlacement::Tail);
        }
        inner.jobs.insert(job_id.clone(), record);

        if let Some(key) = idempotency_key {
            let expires_at = now
                + chrono::Duration::from_std(self.idem_ttl)
                    .unwrap_or_else(|_| chrono::Duration::hours(24));
            inner.idempotency.insert(
                (tenant_id.clone(), key),
                IdemEntry {
                    job_id: job_id.clone(),
                    expires_at,
                },
            );
        }

        let usage = inner.usage.entry(tenant_id.clone()).or_default();
        usage.hour.incr(now, 1);
        usage.day.incr(now, 1);
        usage.storage_bytes += payload_size as u64;

        drop(inner);
        self.emit(JobEvent::Enqueued {
            job_id: job_id.clone(),
            tenant_id,
            queue: queue_name,
            job_type,
            at: now,
        });
        Ok(EnqueueOutcome::Enqueued { job_id })
    }

    async fn claim(
        &self,
        ctx: &QueueCtx,
        queues: &[&str],
        worker: &WorkerId,
        lease: Duration,
        max_batch: usize,
    ) -> QueueResult<Vec<LeasedJob>> {
        let now = Utc::now();
        let lease_until = now
            + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(30));
        let mut inner = self.inner.write();
        let tenant = inner.tenant_or_default(&ctx.tenant_id);

        let mut leased: Vec<LeasedJob> = Vec::new();
        let mut events: Vec<JobEvent> = Vec::new();
        let mut throttle_wait: Option<u64> = None;

        for queue_name in queues {
            if leased.len() >= max_batch {
                break;
            }

            // Opportunistic promotion keeps claim latency independent of
            // the scheduler tick.
            let promoted =
                Self::promote_locked(&mut inner, &ctx.tenant_id, queue_name, now, max_batch.max(64));
            events.extend(promoted.into_iter().map(|(_, e)| e));

            let Some(q) = inner.queue(&ctx.tenant_id, queue_name) else {
                continue;
            };
            if q.config.paused {
                continue;
            }
            let policy = q
                .config
                .rate_limit
                .unwrap_or(tenant.rate_limits.dequeue);

            let keys: Vec<ReadyKey> = q.ready.keys().cloned().collect();
            for key in keys {
                if leased.len() >= max_batch {
                    break;
                }
                let job_id = match inner
                    .queue(&ctx.tenant_id, queue_name)
                    .and_then(|q| q.ready.get(&key))
                {
                    Some(id) => id.clone(),
                    None => continue,
                };

                let eligible = match inner.jobs.get(&job_id) {
                    Some(record) => record.status.is_eligible(now),
                    None => false,
                };
                if !eligible {
                    // Stale index entry (cancelled, purged or claimed
                    // elsewhere); drop it and keep scanning.
                    inner
                        .queue_mut(&ctx.tenant_id, queue_name)
                        .ready
                        .remove(&key);
                    continue;
                }

                if !policy.is_unlimited() {
                    let bucket_key = (
                        ctx.tenant_id.clone(),
                        queue_name.to_string(),
                        Direction::Dequeue,
                    );
                    let bucket = inner
                        .rate_buckets
                        .entry(bucket_key)
                        .or_insert_with(|| TokenBucket::full(&policy, now));
                    if let Err(wait) = bucket.try_take(&policy, now, 1.0) {
                        throttle_wait = Some(throttle_wait.map_or(wait, |w| w.min(wait)));
                        break;
                    }
                }

                let token = LeaseToken::new();
                let record = match inner.jobs.get_mut(&job_id) {
                    Some(r) => r,
                    None => continue,
                };
                record.start_claim(worker.clone(), token.clone(), lease_until, now);
                record.cancel_requested = false;
                let snapshot = record.clone();

                let q = inner.queue_mut(&ctx.tenant_id, queue_name);
                q.ready.remove(&key);
                q.inflight.insert(job_id.clone(), lease_until);

                events.push(JobEvent::Claimed {
                    job_id: job_id.clone(),
                    worker_id: worker.clone(),
                    lease_until,
                    at: now,
                });
                leased.push(LeasedJob {
                    record: snapshot,
                    lease_token: token,
                    lease_until,
                });
            }
        }

        drop(inner);
        for event in events {
            self.emit(event);
        }
        if leased.is_empty() {
            if let Some(retry_after_ms) = throttle_wait {
                return Err(QueueError::Throttled { retry_after_ms });
            }
        }
        Ok(leased)
    }

    async fn ack(&self, ctx: &QueueCtx, job_id: &JobId, token: &LeaseToken) -> QueueResult<()> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let record = inner.record_mut(ctx, job_id)?;
        Self::check_lease(record, token, now)?;

        record.succeed(now);
        let payload_size = record.message.payload_size() as u64;
        let queue_name = record.message.queue.clone();
        let tenant_id = record.tenant_id.clone();

        let mut evicted = Vec::new();
        let archived = {
            let q = inner.queue_mut(&tenant_id, &queue_name);
            q.inflight.remove(job_id);
            q.succeeded_total += 1;
            if q.config.archive_completed {
                q.archive.push_back(job_id.clone());
                while q.archive.len() > q.config.archive_limit {
                    if let Some(old) = q.archive.pop_front() {
                        evicted.push(old);
                    }
                }
                true
            } else {
                false
            }
        };
        for old in evicted {
            inner.jobs.remove(&old);
        }
        if !archived {
            inner.jobs.remove(job_id);
        }
        if let Some(usage) = inner.usage.get_mut(&tenant_id) {
            usage.storage_bytes = usage.storage_bytes.saturating_sub(payload_size);
        }

        drop(inner);
        self.emit(JobEvent::Succeeded {
            job_id: job_id.clone(),
            at: now,
        });
        Ok(())
    }

    async fn nack(
        &self,
        ctx: &QueueCtx,
        job_id: &JobId,
        token: &LeaseToken,
        error: &JobError,
        disposition: NackDisposition,
    ) -> QueueResult<NackOutcome> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let (queue_name, attempts, max_attempts) = {
            let record = inner.record_mut(ctx, job_id)?;
            Self::check_lease(record, token, now)?;
            record.error_chain.push(AttemptError {
                attempt: record.attempt_count,
                at: now,
                worker_id: record.last_worker.clone(),
                kind: error.kind,
                message: error.message.clone(),
            });
            record.last_error = Some(error.message.clone());
            (
                record.message.queue.clone(),
                record.attempt_count,
                record.message.retry.max_attempts,
            )
        };

        match disposition {
            NackDisposition::Retry {
                visible_at,
                count_attempt,
            } => {
                // Backstop for the attempt-cap invariant: a retry that
                // would exceed max_attempts dead-letters instead.
                if count_attempt && attempts >= max_attempts {
                    let reason = format!("max attempts exceeded: {}", error.message);
                    let event = Self::dead_letter_locked(&mut inner, job_id, &reason, now);
                    drop(inner);
                    if let Some(event) = event {
                        self.emit(event);
                    }
                    return Ok(NackOutcome::DeadLettered);
                }
                if let Some(record) = inner.jobs.get_mut(job_id) {
                    record.schedule_retry(visible_at, count_attempt, now);
                }
                let q = inner.queue_mut(&ctx.tenant_id, &queue_name);
                q.inflight.remove(job_id);
                q.push_delayed(visible_at, job_id.clone());
                drop(inner);
                self.emit(JobEvent::Retrying {
                    job_id: job_id.clone(),
                    visible_at,
                    error: error.message.clone(),
                    at: now,
                });
                Ok(NackOutcome::Requeued { visible_at })
            }
            NackDisposition::Dead { reason } => {
                let event = Self::dead_letter_locked(&mut inner, job_id, &reason, now);
                drop(inner);
                if let Some(event) = event {
                    self.emit(event);
                }
                Ok(NackOutcome::DeadLettered)
            }
        }
    }

    async fn extend_lease(
        &self,
        ctx: &QueueCtx,
        job_id: &JobId,
        token: &LeaseToken,
        extra: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let record = inner.record_mut(ctx, job_id)?;
        Self::check_lease(record, token, now)?;

        // A pending cancel request is delivered here: finalize the
        // cancellation and tell the worker to stop.
        if record.cancel_requested {
            record.cancel(now);
            let queue_name = record.message.queue.clone();
            let q = inner.queue_mut(&ctx.tenant_id, &queue_name);
            q.inflight.remove(job_id);
            q.cancelled_total += 1;
            drop(inner);
            self.emit(JobEvent::Cancelled {
                job_id: job_id.clone(),
                at: now,
            });
            return Err(QueueError::JobCancelled);
        }

        let new_until = record
            .lease_until
            .unwrap_or(now)
            + chrono::Duration::from_std(extra).unwrap_or_else(|_| chrono::Duration::seconds(30));
        record.lease_until = Some(new_until);
        record.status = JobStatus::Claimed {
            lease_until: new_until,
        };
        record.updated_at = now;
        let queue_name = record.message.queue.clone();
        if let Some(entry) = inner
            .queue_mut(&ctx.tenant_id, &queue_name)
            .inflight
            .get_mut(job_id)
        {
            *entry = new_until;
        }
        Ok(new_until)
    }

    async fn release_lease(
        &self,
        ctx: &QueueCtx,
        job_id: &JobId,
        token: &LeaseToken,
    ) -> QueueResult<()> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let record = inner.record_mut(ctx, job_id)?;
        Self::check_lease(record, token, now)?;

        record.status = JobStatus::Ready;
        record.lease_token = None;
        record.lease_until = None;
        record.updated_at = now;
        let priority = record.message.priority.get();
        let queue_name = record.message.queue.clone();

        let q = inner.queue_mut(&ctx.tenant_id, &queue_name);
        q.inflight.remove(job_id);
        // Released jobs go to the head so another worker picks them up
        // immediately instead of waiting out the lease.
        q.push_ready(priority, job_id.clone(), RetryPlacement::Head);
        drop(inner);
        self.emit(JobEvent::Reclaimed {
            job_id: job_id.clone(),
            queue: queue_name,
            at: now,
        });
        Ok(())
    }

    async fn cancel(&self, ctx: &QueueCtx, job_id: &JobId) -> QueueResult<CancelOutcome> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let record = inner.record_mut(ctx, job_id)?;

        if record.status.is_terminal() {
            return Ok(CancelOutcome::NotCancellable);
        }
        if record.status.is_claimed() {
            record.cancel_requested = true;
            record.updated_at = now;
            return Ok(CancelOutcome::Requested);
        }

        record.cancel(now);
        let queue_name = record.message.queue.clone();
        let payload_size = record.message.payload_size() as u64;
        let q = inner.queue_mut(&ctx.tenant_id, &queue_name);
        q.remove_from_partitions(job_id);
        q.cancelled_total += 1;
        if let Some(usage) = inner.usage.get_mut(&ctx.tenant_id) {
            usage.storage_bytes = usage.storage_bytes.saturating_sub(payload_size);
        }
        drop(inner);
        self.emit(JobEvent::Cancelled {
            job_id: job_id.clone(),
            at: now,
        });
        Ok(CancelOutcome::Cancelled)
    }

    async fn reclaim_expired(
        &self,
        ctx: &QueueCtx,
        queue: &str,
        limit: usize,
    ) -> QueueResult<Vec<JobId>> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let expired: Vec<JobId> = match inner.queue(&ctx.tenant_id, queue) {
            Some(q) => q
                .inflight
                .iter()
                .filter(|(_, expiry)| **expiry <= now)
                .take(limit)
                .map(|(id, _)| id.clone())
                .collect(),
            None => Vec::new(),
        };

        let mut reclaimed = Vec::new();
        let mut events = Vec::new();
        for job_id in expired {
            let exhausted = inner
                .jobs
                .get(&job_id)
                .map(|r| r.attempt_count + 1 > r.message.retry.max_attempts);
            match exhausted {
                None => {
                    // Stale in-flight entry with no record.
                    inner
                        .queue_mut(&ctx.tenant_id, queue)
                        .inflight
                        .remove(&job_id);
                    continue;
                }
                Some(true) => {
                    if let Some(event) =
                        Self::dead_letter_locked(&mut inner, &job_id, "lease_expired", now)
                    {
                        events.push(event);
                    }
                }
                Some(false) => {
                    let priority = match inner.jobs.get_mut(&job_id) {
                        Some(record) => {
                            record.attempt_count += 1;
                            record.last_error = Some("lease_expired".to_string());
                            record.error_chain.push(AttemptError {
                                attempt: record.attempt_count,
                                at: now,
                                worker_id: record.last_worker.clone(),
                                kind: FailureKind::Retryable,
                                message: "lease_expired".to_string(),
                            });
                            record.status = JobStatus::Ready;
                            record.lease_token = None;
                            record.lease_until = None;
                            record.updated_at = now;
                            record.message.priority.get()
                        }
                        None => continue,
                    };
                    let q = inner.queue_mut(&ctx.tenant_id, queue);
                    q.inflight.remove(&job_id);
                    let placement = q.config.retry_placement;
                    q.push_ready(priority, job_id.clone(), placement);
                    events.push(JobEvent::Reclaimed {
                        job_id: job_id.clone(),
                        queue: queue.to_string(),
                        at: now,
                    });
                }
            }
            reclaimed.push(job_id);
        }

        drop(inner);
        for event in events {
            self.emit(event);
        }
        Ok(reclaimed)
    }

    async fn promote_due(&self, ctx: &QueueCtx, queue: &str, limit: usize) -> QueueResult<u64> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let promoted = Self::promote_locked(&mut inner, &ctx.tenant_id, queue, now, limit);
        let count = promoted.len() as u64;
        drop(inner);
        for (_, event) in promoted {
            self.emit(event);
        }
        Ok(count)
    }

    async fn reschedule(
        &self,
        ctx: &QueueCtx,
        job_id: &JobId,
        new_time: DateTime<Utc>,
    ) -> QueueResult<()> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let record = inner.record_mut(ctx, job_id)?;
        if !matches!(record.status, JobStatus::Pending | JobStatus::Ready) {
            return Err(QueueError::NotReschedulable);
        }

        record.message.not_before = Some(new_time);
        let delayed = new_time > now;
        record.status = if delayed {
            JobStatus::Pending
        } else {
            JobStatus::Ready
        };
        record.updated_at = now;
        let priority = record.message.priority.get();
        let queue_name = record.message.queue.clone();

        let q = inner.queue_mut(&ctx.tenant_id, &queue_name);
        q.remove_from_partitions(job_id);
        if delayed {
            q.push_delayed(new_time, job_id.clone());
        } else {
            q.push_ready(priority, job_id.clone(), RetryPlacement::Tail);
        }
        Ok(())
    }

    async fn get_record(&self, ctx: &QueueCtx, job_id: &JobId) -> QueueResult<JobRecord> {
        let inner = self.inner.read();
        inner.record(ctx, job_id).cloned()
    }

    async fn list_jobs(
        &self,
        ctx: &QueueCtx,
        queue: &str,
        state: Option<JobState>,
        after_seq: Option<u64>,
        limit: usize,
    ) -> QueueResult<Vec<JobRecord>> {
        let inner = self.inner.read();
        let mut records: Vec<JobRecord> = inner
            .jobs
            .values()
            .filter(|r| r.tenant_id == ctx.tenant_id && r.message.queue == queue)
            .filter(|r| state.map(|s| s.matches(&r.status)).unwrap_or(true))
            .filter(|r| after_seq.map(|s| r.seq > s).unwrap_or(true))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.seq);
        records.truncate(limit);
        Ok(records)
    }

    async fn queue_stats(&self, ctx: &QueueCtx, queue: &str) -> QueueResult<QueueStats> {
        let inner = self.inner.read();
        let q = inner
            .queue(&ctx.tenant_id, queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
        Ok(QueueStats {
            ready: q.ready.len() as u64,
            delayed: q.delayed.len() as u64,
            in_flight: q.inflight.len() as u64,
            dead: q.dlq.len() as u64,
            succeeded: q.succeeded_total,
            cancelled: q.cancelled_total,
            enqueued_total: q.enqueued_total,
        })
    }

    async fn list_queues(&self, ctx: &QueueCtx) -> QueueResult<Vec<String>> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner
            .queues
            .keys()
            .filter(|(t, _)| *t == ctx.tenant_id)
            .map(|(_, q)| q.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_queue_config(&self, ctx: &QueueCtx, queue: &str) -> QueueResult<QueueConfig> {
        let inner = self.inner.read();
        inner
            .queue(&ctx.tenant_id, queue)
            .map(|q| q.config.clone())
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))
    }

    async fn put_queue_config(&self, ctx: &QueueCtx, config: QueueConfig) -> QueueResult<()> {
        let mut inner = self.inner.write();
        let name = config.name.clone();
        inner.queue_mut(&ctx.tenant_id, &name).config = config;
        Ok(())
    }

    async fn set_paused(&self, ctx: &QueueCtx, queue: &str, paused: bool) -> QueueResult<()> {
        let mut inner = self.inner.write();
        inner.queue_mut(&ctx.tenant_id, queue).config.paused = paused;
        Ok(())
    }

    async fn purge(&self, ctx: &QueueCtx, queue: &str, states: &[JobState]) -> QueueResult<u64> {
        let mut inner = self.inner.write();
        let victims: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|r| r.tenant_id == ctx.tenant_id && r.message.queue == queue)
            .filter(|r| states.iter().any(|s| s.matches(&r.status)))
            .map(|r| r.job_id.clone())
            .collect();

        let mut removed = 0u64;
        for job_id in victims {
            if let Some(record) = inner.jobs.remove(&job_id) {
                let payload_size = record.message.payload_size() as u64;
                let q = inner.queue_mut(&ctx.tenant_id, queue);
                q.remove_from_partitions(&job_id);
                q.dlq.retain(|e| e.record.job_id != job_id);
                q.archive.retain(|id| *id != job_id);
                if !record.status.is_terminal() {
                    if let Some(usage) = inner.usage.get_mut(&ctx.tenant_id) {
                        usage.storage_bytes = usage.storage_bytes.saturating_sub(payload_size);
                    }
                }
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn dlq_entries(
        &self,
        ctx: &QueueCtx,
        queue: &str,
        offset: usize,
        limit: usize,
    ) -> QueueResult<Vec<DlqEntry>> {
        let inner = self.inner.read();
        Ok(inner
            .queue(&ctx.tenant_id, queue)
            .map(|q| q.dlq.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn dlq_requeue(
        &self,
        ctx: &QueueCtx,
        queue: &str,
        job_id: &JobId,
        target_queue: Option<&str>,
        reset_attempts: bool,
        new_payload: Option<Vec<u8>>,
    ) -> QueueResult<()> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        let entry_idx = inner
            .queue(&ctx.tenant_id, queue)
            .and_then(|q| q.dlq.iter().position(|e| e.record.job_id == *job_id))
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        let _ = inner
            .queue_mut(&ctx.tenant_id, queue)
            .dlq
            .remove(entry_idx);

        let record = inner.record_mut(ctx, job_id)?;
        if reset_attempts {
            record.attempt_count = 0;
        }
        if let Some(payload) = new_payload {
            let old = record.message.payload_size() as u64;
            let new = payload.len() as u64;
            record.message.payload = payload;
            let tenant_id = record.tenant_id.clone();
            if let Some(usage) = inner.usage.get_mut(&tenant_id) {
                usage.storage_bytes = usage.storage_bytes.saturating_sub(old) + new;
            }
        }
        let record = inner.record_mut(ctx, job_id)?;
        let target = target_queue.unwrap_or(queue).to_string();
        record.message.queue = target.clone();
        record.status = JobStatus::Ready;
        record.last_worker = None;
        record.lease_token = None;
        record.lease_until = None;
        record.cancel_requested = false;
        record.updated_at = now;
        let priority = record.message.priority.get();
        let job_type = record.message.job_type.clone();

        let new_seq = {
            let q = inner.queue_mut(&ctx.tenant_id, &target);
            q.next_seq += 1;
            q.push_ready(priority, job_id.clone(), RetryPlacement::Tail);
            q.next_seq
        };
        if let Some(record) = inner.jobs.get_mut(job_id) {
            record.seq = new_seq;
        }

        drop(inner);
        self.emit(JobEvent::Enqueued {
            job_id: job_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            queue: target,
            job_type,
            at: now,
        });
        Ok(())
    }

    async fn dlq_purge(&self, ctx: &QueueCtx, queue: &str) -> QueueResult<u64> {
        let mut inner = self.inner.write();
        let Some(q) = inner
            .queues
            .get_mut(&(ctx.tenant_id.clone(), queue.to_string()))
        else {
            return Ok(0);
        };
        let drained: Vec<JobId> = q.dlq.drain(..).map(|e| e.record.job_id).collect();
        let count = drained.len() as u64;
        for job_id in drained {
            inner.jobs.remove(&job_id);
        }
        Ok(count)
    }

    async fn replace_payload(
        &self,
        ctx: &QueueCtx,
        job_id: &JobId,
        payload: Vec<u8>,
    ) -> QueueResult<()> {
        let mut inner = self.inner.write();
        let record = inner.record_mut(ctx, job_id)?;
        let old = record.message.payload_size() as u64;
        let new = payload.len() as u64;
        record.message.payload = payload.clone();
        record.updated_at = Utc::now();
        let queue_name = record.message.queue.clone();

        if let Some(q) = inner
            .queues
            .get_mut(&(ctx.tenant_id.clone(), queue_name))
        {
            if let Some(entry) = q.dlq.iter_mut().find(|e| e.record.job_id == *job_id) {
                entry.record.message.payload = payload;
            }
        }
        if let Some(usage) = inner.usage.get_mut(&ctx.tenant_id) {
            usage.storage_bytes = usage.storage_bytes.saturating_sub(old) + new;
        }
        Ok(())
    }

    async fn put_rule(&self, ctx: &QueueCtx, rule: RecurringRule) -> QueueResult<()> {
        let mut inner = self.inner.write();
        inner
            .rules
            .insert((ctx.tenant_id.clone(), rule.id.0.clone()), rule);
        Ok(())
    }

    async fn get_rule(&self, ctx: &QueueCtx, rule_id: &RuleId) -> QueueResult<RecurringRule> {
        let inner = self.inner.read();
        inner
            .rules
            .get(&(ctx.tenant_id.clone(), rule_id.0.clone()))
            .cloned()
            .ok_or_else(|| QueueError::RuleNotFound(rule_id.to_string()))
    }

    async fn delete_rule(&self, ctx: &QueueCtx, rule_id: &RuleId) -> QueueResult<()> {
        let mut inner = self.inner.write();
        inner
            .rules
            .remove(&(ctx.tenant_id.clone(), rule_id.0.clone()))
            .map(|_| ())
            .ok_or_else(|| QueueError::RuleNotFound(rule_id.to_string()))
    }

    async fn list_rules(&self, ctx: &QueueCtx) -> QueueResult<Vec<RecurringRule>> {
        let inner = self.inner.read();
        let mut rules: Vec<RecurringRule> = inner
            .rules
            .iter()
            .filter(|((t, _), _)| *t == ctx.tenant_id)
            .map(|(_, r)| r.clone())
            .collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rules)
    }

    async fn try_mark_fired(
        &self,
        ctx: &QueueCtx,
        rule_id: &RuleId,
        fire_time: DateTime<Utc>,
        ttl: Duration,
    ) -> QueueResult<bool> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let key = (
            ctx.tenant_id.clone(),
            rule_id.0.clone(),
            fire_time.timestamp_millis(),
        );
        if let Some(expires) = inner.fired.get(&key) {
            if *expires > now {
                return Ok(false);
            }
        }
        let expires =
            now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(7));
        inner.fired.insert(key, expires);
        Ok(true)
    }

    async fn rule_inflight(&self, ctx: &QueueCtx, rule_id: &RuleId) -> QueueResult<u64> {
        let inner = self.inner.read();
        Ok(inner
            .jobs
            .values()
            .filter(|r| {
                r.tenant_id == ctx.tenant_id
                    && r.message.rule_id.as_ref() == Some(rule_id)
                    && !r.status.is_terminal()
            })
            .count() as u64)
    }

    async fn put_tenant(&self, record: TenantRecord) -> QueueResult<()> {
        let mut inner = self.inner.write();
        inner.tenants.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_tenant(&self, tenant_id: &str) -> QueueResult<Option<TenantRecord>> {
        let inner = self.inner.read();
        Ok(inner.tenants.get(tenant_id).cloned())
    }

    async fn delete_tenant(&self, tenant_id: &str) -> QueueResult<()> {
        let mut inner = self.inner.write();
        if inner.tenants.remove(tenant_id).is_none() {
            return Err(QueueError::TenantNotFound(tenant_id.to_string()));
        }
        inner.usage.remove(tenant_id);
        inner.queues.retain(|(t, _), _| t != tenant_id);
        inner.jobs.retain(|_, r| r.tenant_id != tenant_id);
        inner.idempotency.retain(|(t, _), _| t != tenant_id);
        inner.rules.retain(|(t, _), _| t != tenant_id);
        inner.fired.retain(|(t, _, _), _| t != tenant_id);
        inner.workers.retain(|(t, _), _| t != tenant_id);
        inner.rate_buckets.retain(|(t, _, _), _| t != tenant_id);
        Ok(())
    }

    async fn list_tenants(&self) -> QueueResult<Vec<TenantRecord>> {
        let inner = self.inner.read();
        let mut tenants: Vec<TenantRecord> = inner.tenants.values().cloned().collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tenants)
    }

    async fn list_tenant_ids(&self) -> QueueResult<Vec<String>> {
        let inner = self.inner.read();
        let mut ids: Vec<String> = inner
            .tenants
            .keys()
            .cloned()
            .chain(inner.queues.keys().map(|(t, _)| t.clone()))
            .chain(inner.rules.keys().map(|(t, _)| t.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn register_worker(&self, ctx: &QueueCtx, info: WorkerInfo) -> QueueResult<()> {
        let mut inner = self.inner.write();
        inner
            .workers
            .insert((ctx.tenant_id.clone(), info.id.0.clone()), info);
        Ok(())
    }

    async fn worker_heartbeat(&self, ctx: &QueueCtx, worker: &WorkerId) -> QueueResult<()> {
        let mut inner = self.inner.write();
        let info = inner
            .workers
            .get_mut(&(ctx.tenant_id.clone(), worker.0.clone()))
            .ok_or_else(|| QueueError::WorkerNotFound(worker.to_string()))?;
        info.last_heartbeat = Utc::now();
        Ok(())
    }

    async fn set_worker_drain(
        &self,
        ctx: &QueueCtx,
        worker: &WorkerId,
        drain: bool,
    ) -> QueueResult<()> {
        let mut inner = self.inner.write();
        let info = inner
            .workers
            .get_mut(&(ctx.tenant_id.clone(), worker.0.clone()))
            .ok_or_else(|| QueueError::WorkerNotFound(worker.to_string()))?;
        info.draining = drain;
        Ok(())
    }

    async fn list_workers(&self, ctx: &QueueCtx) -> QueueResult<Vec<WorkerInfo>> {
        let inner = self.inner.read();
        let mut workers: Vec<WorkerInfo> = inner
            .workers
            .iter()
            .filter(|((t, _), _)| *t == ctx.tenant_id)
            .map(|(_, w)| w.clone())
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }

    async fn expire_workers(&self, ctx: &QueueCtx, ttl: Duration) -> QueueResult<Vec<WorkerId>> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut inner = self.inner.write();
        let expired: Vec<(String, String)> = inner
            .workers
            .iter()
            .filter(|((t, _), w)| *t == ctx.tenant_id && w.heartbeat_expired(now, ttl))
            .map(|(k, _)| k.clone())
            .collect();
        let mut ids = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(info) = inner.workers.remove(&key) {
                ids.push(info.id);
            }
        }
        Ok(ids)
    }

    fn events(&self) -> BoxStream<JobEvent> {
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};
        let receiver = self.events.subscribe();
        Box::pin(BroadcastStream::new(receiver).filter_map(|result| result.ok()))
    }

    fn capabilities(&self) -> QueueCapabilities {
        QueueCapabilities::full()
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    fn ctx() -> QueueCtx {
        QueueCtx::new("test-tenant")
    }

    fn message(queue: &str) -> JobMessage {
        JobMessage::new("test_job", queue, b"payload".to_vec())
    }

    async fn claim_one(backend: &MemoryBackend, queue: &str) -> Option<LeasedJob> {
        backend
            .claim(
                &ctx(),
                &[queue],
                &WorkerId::from("w1"),
                Duration::from_secs(30),
                1,
            )
            .await
            .unwrap()
            .into_iter()
            .next()
    }

    #[tokio::test]
    async fn enqueue_claim_ack() {
        let backend = MemoryBackend::new();
        let outcome = backend.enqueue(&ctx(), message("q")).await.unwrap();
        let job_id = outcome.job_id().clone();

        let leased = claim_one(&backend, "q").await.unwrap();
        assert_eq!(leased.record.job_id, job_id);
        assert_eq!(leased.record.attempt_count, 1);

        backend
            .ack(&ctx(), &job_id, &leased.lease_token)
            .await
            .unwrap();
        let stats = backend.queue_stats(&ctx(), "q").await.unwrap();
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.succeeded, 1);
    }

    #[tokio::test]
    async fn ack_requires_live_lease() {
        let backend = MemoryBackend::new();
        backend.enqueue(&ctx(), message("q")).await.unwrap();
        let leased = claim_one(&backend, "q").await.unwrap();

        let bad = backend
            .ack(&ctx(), leased.job_id(), &LeaseToken::from("stale"))
            .await;
        assert!(matches!(bad, Err(QueueError::InvalidLeaseToken)));

        backend.force_lease_expiry(leased.job_id());
        let expired = backend.ack(&ctx(), leased.job_id(), &leased.lease_token).await;
        assert!(matches!(expired, Err(QueueError::LeaseExpired)));
    }

    #[tokio::test]
    async fn nack_retry_goes_to_delayed_until_promoted() {
        let backend = MemoryBackend::new();
        backend.enqueue(&ctx(), message("q")).await.unwrap();
        let leased = claim_one(&backend, "q").await.unwrap();

        let visible_at = Utc::now() + chrono::Duration::seconds(60);
        let outcome = backend
            .nack(
                &ctx(),
                leased.job_id(),
                &leased.lease_token,
                &JobError::retryable("boom"),
                NackDisposition::Retry {
                    visible_at,
                    count_attempt: true,
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, NackOutcome::Requeued { .. }));

        let record = backend.get_record(&ctx(), leased.job_id()).await.unwrap();
        assert_eq!(record.attempt_count, 2);
        assert!(matches!(record.status, JobStatus::Retrying { .. }));

        // Not claimable before its visibility time.
        assert!(claim_one(&backend, "q").await.is_none());
    }

    #[tokio::test]
    async fn nack_past_visible_time_is_claimable_again() {
        let backend = MemoryBackend::new();
        backend.enqueue(&ctx(), message("q")).await.unwrap();
        let leased = claim_one(&backend, "q").await.unwrap();

        let visible_at = Utc::now() - chrono::Duration::seconds(1);
        backend
            .nack(
                &ctx(),
                leased.job_id(),
                &leased.lease_token,
                &JobError::retryable("boom"),
                NackDisposition::Retry {
                    visible_at,
                    count_attempt: true,
                },
            )
            .await
            .unwrap();

        let again = claim_one(&backend, "q").await.unwrap();
        assert_eq!(again.record.job_id, *leased.job_id());
        assert_eq!(again.record.attempt_count, 2);
    }

    #[tokio::test]
    async fn retry_beyond_cap_dead_letters() {
        let backend = MemoryBackend::new();
        let mut msg = message("q");
        msg.retry.max_attempts = 1;
        backend.enqueue(&ctx(), msg).await.unwrap();
        let leased = claim_one(&backend, "q").await.unwrap();

        let outcome = backend
            .nack(
                &ctx(),
                leased.job_id(),
                &leased.lease_token,
                &JobError::retryable("boom"),
                NackDisposition::Retry {
                    visible_at: Utc::now(),
                    count_attempt: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, NackOutcome::DeadLettered);
        let entries = backend.dlq_entries(&ctx(), "q", 0, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.attempt_count, 1);
    }

    #[tokio::test]
    async fn idempotent_enqueue_returns_original() {
        let backend = MemoryBackend::new();
        let msg = message("q").with_idempotency_key("k1");
        let first = backend.enqueue(&ctx(), msg.clone()).await.unwrap();
        assert!(!first.is_duplicate());

        let mut second_msg = message("q").with_idempotency_key("k1");
        second_msg.payload = b"different".to_vec();
        let second = backend.enqueue(&ctx(), second_msg).await.unwrap();
        assert!(second.is_duplicate());
        assert_eq!(first.job_id(), second.job_id());

        // Only the first writer's payload exists.
        let record = backend.get_record(&ctx(), first.job_id()).await.unwrap();
        assert_eq!(record.message.payload, b"payload");

        // The key expires; a new enqueue succeeds.
        backend.force_idempotency_expiry("test-tenant", "k1");
        let third = backend.enqueue(&ctx(), message("q").with_idempotency_key("k1")).await.unwrap();
        assert!(!third.is_duplicate());
    }

    #[tokio::test]
    async fn idempotency_is_tenant_scoped() {
        let backend = MemoryBackend::new();
        let other = QueueCtx::new("other-tenant");
        let a = backend
            .enqueue(&ctx(), message("q").with_idempotency_key("k"))
            .await
            .unwrap();
        let b = backend
            .enqueue(&other, message("q").with_idempotency_key("k"))
            .await
            .unwrap();
        assert!(!b.is_duplicate());
        assert_ne!(a.job_id(), b.job_id());
    }

    #[tokio::test]
    async fn priority_then_fifo() {
        let backend = MemoryBackend::new();
        let low = message("q").with_priority(Priority::new(1).unwrap());
        let high_first = message("q").with_priority(Priority::new(8).unwrap());
        let high_second = message("q").with_priority(Priority::new(8).unwrap());

        let low_id = backend.enqueue(&ctx(), low).await.unwrap().job_id().clone();
        let h1 = backend
            .enqueue(&ctx(), high_first)
            .await
            .unwrap()
            .job_id()
            .clone();
        let h2 = backend
            .enqueue(&ctx(), high_second)
            .await
            .unwrap()
            .job_id()
            .clone();

        assert_eq!(claim_one(&backend, "q").await.unwrap().record.job_id, h1);
        assert_eq!(claim_one(&backend, "q").await.unwrap().record.job_id, h2);
        assert_eq!(claim_one(&backend, "q").await.unwrap().record.job_id, low_id);
    }

    #[tokio::test]
    async fn delayed_jobs_wait_for_promotion() {
        let backend = MemoryBackend::new();
        let msg = message("q").with_not_before(Utc::now() + chrono::Duration::seconds(60));
        let job_id = backend.enqueue(&ctx(), msg).await.unwrap().job_id().clone();

        assert!(claim_one(&backend, "q").await.is_none());
        let record = backend.get_record(&ctx(), &job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        let stats = backend.queue_stats(&ctx(), "q").await.unwrap();
        assert_eq!(stats.delayed, 1);
    }

    #[tokio::test]
    async fn promote_due_moves_ripe_jobs() {
        let backend = MemoryBackend::new();
        let msg = message("q").with_not_before(Utc::now() - chrono::Duration::seconds(1));
        // not_before in the past goes straight to ready at enqueue.
        backend.enqueue(&ctx(), msg).await.unwrap();
        assert!(claim_one(&backend, "q").await.is_some());
    }

    #[tokio::test]
    async fn paused_queue_claims_nothing() {
        let backend = MemoryBackend::new();
        backend.enqueue(&ctx(), message("q")).await.unwrap();
        backend.set_paused(&ctx(), "q", true).await.unwrap();
        assert!(claim_one(&backend, "q").await.is_none());
        backend.set_paused(&ctx(), "q", false).await.unwrap();
        assert!(claim_one(&backend, "q").await.is_some());
    }

    #[tokio::test]
    async fn reclaim_returns_expired_lease_to_ready() {
        let backend = MemoryBackend::new();
        backend.enqueue(&ctx(), message("q")).await.unwrap();
        let first = claim_one(&backend, "q").await.unwrap();
        backend.force_lease_expiry(first.job_id());

        let reclaimed = backend.reclaim_expired(&ctx(), "q", 16).await.unwrap();
        assert_eq!(reclaimed, vec![first.job_id().clone()]);

        let second = claim_one(&backend, "q").await.unwrap();
        assert_eq!(second.record.job_id, *first.job_id());
        assert_eq!(second.record.attempt_count, 2);
        assert_eq!(second.record.last_error.as_deref(), Some("lease_expired"));
        assert_ne!(second.lease_token, first.lease_token);

        // The old token is dead.
        let stale = backend.ack(&ctx(), first.job_id(), &first.lease_token).await;
        assert!(stale.is_err());
    }

    #[tokio::test]
    async fn reclaim_exhausted_attempts_dead_letters() {
        let backend = MemoryBackend::new();
        let mut msg = message("q");
        msg.retry.max_attempts = 1;
        backend.enqueue(&ctx(), msg).await.unwrap();
        let leased = claim_one(&backend, "q").await.unwrap();
        backend.force_lease_expiry(leased.job_id());

        backend.reclaim_expired(&ctx(), "q", 16).await.unwrap();
        let record = backend.get_record(&ctx(), leased.job_id()).await.unwrap();
        assert!(matches!(record.status, JobStatus::Dead { .. }));
        assert_eq!(backend.dlq_entries(&ctx(), "q", 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_semantics() {
        let backend = MemoryBackend::new();

        // Ready job cancels outright.
        let a = backend
            .enqueue(&ctx(), message("q"))
            .await
            .unwrap()
            .job_id()
            .clone();
        assert_eq!(
            backend.cancel(&ctx(), &a).await.unwrap(),
            CancelOutcome::Cancelled
        );
        assert!(claim_one(&backend, "q").await.is_none());

        // Claimed job gets a request; the worker sees it at extension.
        let b = backend
            .enqueue(&ctx(), message("q"))
            .await
            .unwrap()
            .job_id()
            .clone();
        let leased = claim_one(&backend, "q").await.unwrap();
        assert_eq!(
            backend.cancel(&ctx(), &b).await.unwrap(),
            CancelOutcome::Requested
        );
        let res = backend
            .extend_lease(&ctx(), &b, &leased.lease_token, Duration::from_secs(10))
            .await;
        assert!(matches!(res, Err(QueueError::JobCancelled)));
        let record = backend.get_record(&ctx(), &b).await.unwrap();
        assert!(matches!(record.status, JobStatus::Cancelled { .. }));

        // Terminal job is not cancellable.
        assert_eq!(
            backend.cancel(&ctx(), &b).await.unwrap(),
            CancelOutcome::NotCancellable
        );
    }

    #[tokio::test]
    async fn release_lease_makes_job_immediately_claimable() {
        let backend = MemoryBackend::new();
        backend.enqueue(&ctx(), message("q")).await.unwrap();
        let leased = claim_one(&backend, "q").await.unwrap();

        backend
            .release_lease(&ctx(), leased.job_id(), &leased.lease_token)
            .await
            .unwrap();
        let again = claim_one(&backend, "q").await.unwrap();
        assert_eq!(again.record.job_id, *leased.job_id());
        // Attempt count unchanged: a release is not a failure.
        assert_eq!(again.record.attempt_count, 1);
    }

    #[tokio::test]
    async fn tenant_isolation_hides_foreign_jobs() {
        let backend = MemoryBackend::new();
        let job_id = backend
            .enqueue(&ctx(), message("q"))
            .await
            .unwrap()
            .job_id()
            .clone();

        let other = QueueCtx::new("other-tenant");
        assert!(matches!(
            backend.get_record(&other, &job_id).await,
            Err(QueueError::JobNotFound(_))
        ));
        assert!(backend
            .claim(&other, &["q"], &WorkerId::from("w"), Duration::from_secs(5), 1)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn queue_full_and_payload_caps() {
        let backend = MemoryBackend::new();
        let cfg = QueueConfig::new("q").with_max_length(1);
        backend.put_queue_config(&ctx(), cfg).await.unwrap();

        backend.enqueue(&ctx(), message("q")).await.unwrap();
        let full = backend.enqueue(&ctx(), message("q")).await;
        assert!(matches!(full, Err(QueueError::QueueFull(_))));

        let mut tenant = TenantRecord::new("test-tenant");
        tenant.quotas.max_payload_bytes = 4;
        backend.put_tenant(tenant).await.unwrap();
        let too_big = backend.enqueue(&ctx(), message("q2")).await;
        assert!(matches!(too_big, Err(QueueError::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn hourly_quota_enforced_atomically() {
        let backend = MemoryBackend::new();
        let mut tenant = TenantRecord::new("test-tenant");
        tenant.quotas.max_jobs_per_hour = 2;
        backend.put_tenant(tenant).await.unwrap();

        backend.enqueue(&ctx(), message("q")).await.unwrap();
        backend.enqueue(&ctx(), message("q")).await.unwrap();
        let over = backend.enqueue(&ctx(), message("q")).await;
        assert!(matches!(over, Err(QueueError::QuotaExceeded(_))));

        // The failed enqueue did not bump any counter.
        let stats = backend.queue_stats(&ctx(), "q").await.unwrap();
        assert_eq!(stats.enqueued_total, 2);
        assert_eq!(stats.backlog(), 2);
    }

    #[tokio::test]
    async fn enqueue_rate_limit_throttles() {
        let backend = MemoryBackend::new();
        let mut tenant = TenantRecord::new("test-tenant");
        tenant.rate_limits.enqueue = hoist_core::tenant::RatePolicy::new(1, 1);
        backend.put_tenant(tenant).await.unwrap();

        backend.enqueue(&ctx(), message("q")).await.unwrap();
        let throttled = backend.enqueue(&ctx(), message("q")).await;
        match throttled {
            Err(QueueError::Throttled { retry_after_ms }) => assert!(retry_after_ms > 0),
            other => panic!("expected throttled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn suspended_tenant_cannot_enqueue() {
        let backend = MemoryBackend::new();
        let mut tenant = TenantRecord::new("test-tenant");
        tenant.status = hoist_core::tenant::TenantStatus::Suspended;
        backend.put_tenant(tenant).await.unwrap();
        let res = backend.enqueue(&ctx(), message("q")).await;
        assert!(matches!(res, Err(QueueError::TenantSuspended(_))));
    }

    #[tokio::test]
    async fn dlq_requeue_resets_and_moves() {
        let backend = MemoryBackend::new();
        let mut msg = message("q");
        msg.retry.max_attempts = 1;
        backend.enqueue(&ctx(), msg).await.unwrap();
        let leased = claim_one(&backend, "q").await.unwrap();
        backend
            .nack(
                &ctx(),
                leased.job_id(),
                &leased.lease_token,
                &JobError::non_retryable("bad input"),
                NackDisposition::Dead {
                    reason: "bad input".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(backend.dlq_entries(&ctx(), "q", 0, 10).await.unwrap().len(), 1);

        backend
            .dlq_requeue(&ctx(), "q", leased.job_id(), Some("q-retry"), true, None)
            .await
            .unwrap();
        assert!(backend.dlq_entries(&ctx(), "q", 0, 10).await.unwrap().is_empty());

        let record = backend.get_record(&ctx(), leased.job_id()).await.unwrap();
        assert_eq!(record.status, JobStatus::Ready);
        assert_eq!(record.attempt_count, 0);
        assert_eq!(record.message.queue, "q-retry");
        // The error chain survives for forensics.
        assert_eq!(record.error_chain.len(), 1);

        let again = claim_one(&backend, "q-retry").await.unwrap();
        assert_eq!(again.record.job_id, *leased.job_id());
    }

    #[tokio::test]
    async fn reschedule_only_waiting_jobs() {
        let backend = MemoryBackend::new();
        let future = Utc::now() + chrono::Duration::hours(1);
        let job_id = backend
            .enqueue(&ctx(), message("q"))
            .await
            .unwrap()
            .job_id()
            .clone();

        backend.reschedule(&ctx(), &job_id, future).await.unwrap();
        let record = backend.get_record(&ctx(), &job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert!(claim_one(&backend, "q").await.is_none());

        // Bring it back to now and claim it; claimed jobs refuse.
        backend
            .reschedule(&ctx(), &job_id, Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        let _leased = claim_one(&backend, "q").await.unwrap();
        let res = backend.reschedule(&ctx(), &job_id, future).await;
        assert!(matches!(res, Err(QueueError::NotReschedulable)));
    }

    #[tokio::test]
    async fn list_jobs_pages_by_sequence() {
        let backend = MemoryBackend::new();
        for _ in 0..5 {
            backend.enqueue(&ctx(), message("q")).await.unwrap();
        }
        let first = backend.list_jobs(&ctx(), "q", None, None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let after = first.last().unwrap().seq;
        let second = backend
            .list_jobs(&ctx(), "q", None, Some(after), 10)
            .await
            .unwrap();
        assert_eq!(second.len(), 3);
        assert!(second.iter().all(|r| r.seq > after));
    }

    #[tokio::test]
    async fn fired_guard_is_idempotent() {
        let backend = MemoryBackend::new();
        let rule = RuleId::from("rule-1");
        let fire = Utc::now();
        assert!(backend
            .try_mark_fired(&ctx(), &rule, fire, Duration::from_secs(3600))
            .await
            .unwrap());
        assert!(!backend
            .try_mark_fired(&ctx(), &rule, fire, Duration::from_secs(3600))
            .await
            .unwrap());
        // A different fire time is a different pair.
        assert!(backend
            .try_mark_fired(
                &ctx(),
                &rule,
                fire + chrono::Duration::seconds(60),
                Duration::from_secs(3600)
            )
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn worker_registry_lifecycle() {
        let backend = MemoryBackend::new();
        let id = WorkerId::from("w1");
        let info = WorkerInfo::new(id.clone(), "test-tenant", vec!["q".into()], 4);
        backend.register_worker(&ctx(), info).await.unwrap();
        backend.worker_heartbeat(&ctx(), &id).await.unwrap();
        backend.set_worker_drain(&ctx(), &id, true).await.unwrap();
        assert!(backend.list_workers(&ctx()).await.unwrap()[0].draining);

        // A zero ttl expires everything.
        let expired = backend
            .expire_workers(&ctx(), Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(expired, vec![id]);
        assert!(backend.list_workers(&ctx()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_removes_selected_states() {
        let backend = MemoryBackend::new();
        backend.enqueue(&ctx(), message("q")).await.unwrap();
        backend.enqueue(&ctx(), message("q")).await.unwrap();
        let _leased = claim_one(&backend, "q").await.unwrap();

        let removed = backend.purge(&ctx(), "q", &[JobState::Ready]).await.unwrap();
        assert_eq!(removed, 1);
        let stats = backend.queue_stats(&ctx(), "q").await.unwrap();
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.in_flight, 1);
    }
}
