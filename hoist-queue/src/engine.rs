//! Job lifecycle engine.
//!
//! Sits between callers and the storage primitives: validates
//! submissions, encodes and decrypts job envelopes, evaluates retry
//! policy against the error taxonomy, and routes exhausted or poisoned
//! jobs to the DLQ. Backoff lives here, not in the backend: backends
//! apply dispositions, the engine decides them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use hoist_core::envelope::{Envelope, EnvelopeCodec, EnvelopeHeader, RetrySnapshot};
use hoist_core::tenant::{validate_queue_name, validate_tenant_id};

use crate::backend::{EnqueueOutcome, NackDisposition, NackOutcome, QueueBackend};
use crate::error::{QueueError, QueueResult};
use crate::types::{
    FailureKind, JobError, JobId, JobMessage, JobRecord, LeaseToken, LeasedJob, Priority,
    QueueCtx, RetryPolicy, RuleId, WorkerId,
};

const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Caller-facing job submission.
#[derive(Debug, Clone, Default)]
pub struct EnqueueRequest {
    pub queue: String,
    pub job_type: String,
    /// Plaintext payload; the engine wraps it in an envelope (and seals
    /// it for encrypted tenants) before storage.
    pub payload: Vec<u8>,
    pub priority: Option<u8>,
    pub not_before: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub retry: Option<RetryPolicy>,
    pub idempotency_key: Option<String>,
    pub trace_id: Option<String>,
    pub rule_id: Option<RuleId>,
}

#[derive(Debug, Clone)]
pub struct EnqueueReceipt {
    pub job_id: JobId,
    pub duplicate: bool,
    /// Terminal status name of the original job when a duplicate submit
    /// arrives after it finished.
    pub terminal_status: Option<String>,
}

/// A claimed job with its decoded envelope, ready for dispatch.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub leased: LeasedJob,
    pub envelope: Envelope,
}

pub struct LifecycleEngine {
    backend: Arc<dyn QueueBackend>,
    codec: EnvelopeCodec,
    /// Floor applied to throttled backoffs lacking a reset hint.
    throttle_min_backoff_ms: u64,
}

impl LifecycleEngine {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            codec: EnvelopeCodec::new(),
            throttle_min_backoff_ms: 1_000,
        }
    }

    pub fn with_codec(mut self, codec: EnvelopeCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn codec(&self) -> &EnvelopeCodec {
        &self.codec
    }

    /// Validate, envelope-encode and enqueue a job.
    #[instrument(skip(self, request), fields(tenant = %ctx.tenant_id, queue = %request.queue, job_type = %request.job_type))]
    pub async fn enqueue(&self, ctx: &QueueCtx, request: EnqueueRequest) -> QueueResult<EnqueueReceipt> {
        validate_tenant_id(&ctx.tenant_id).map_err(QueueError::from_core)?;
        validate_queue_name(&request.queue).map_err(QueueError::from_core)?;
        if request.job_type.is_empty() {
            return Err(QueueError::Validation("job_type must not be empty".into()));
        }
        let priority = match request.priority {
            Some(p) => Priority::new(p)?,
            None => Priority::default(),
        };
        if let Some(key) = &request.idempotency_key {
            if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(QueueError::Validation(format!(
                    "idempotency key length must be 1..={MAX_IDEMPOTENCY_KEY_LEN}"
                )));
            }
        }
        let now = Utc::now();
        if let (Some(not_before), Some(deadline)) = (request.not_before, request.deadline) {
            if deadline <= not_before {
                return Err(QueueError::Validation(
                    "deadline must be after not_before".into(),
                ));
            }
        }

        let tenant = self.backend.get_tenant(&ctx.tenant_id).await?;
        let encrypted = tenant.as_ref().map(|t| t.encryption.is_some()).unwrap_or(false);

        let retry = match request.retry {
            Some(retry) => retry,
            None => match self.backend.get_queue_config(ctx, &request.queue).await {
                Ok(config) => config.default_retry,
                Err(QueueError::QueueNotFound(_)) => RetryPolicy::default(),
                Err(e) => return Err(e),
            },
        };
        retry.validate().map_err(QueueError::Validation)?;

        let job_id = JobId::new();
        let envelope = Envelope {
            tenant_id: ctx.tenant_id.clone(),
            job_id: job_id.to_string(),
            header: EnvelopeHeader {
                queue: request.queue.clone(),
                job_type: request.job_type.clone(),
                priority: priority.get(),
                enqueued_at_ms: now.timestamp_millis(),
                not_before_ms: request.not_before.map(|t| t.timestamp_millis()),
                deadline_ms: request.deadline.map(|t| t.timestamp_millis()),
                retry: RetrySnapshot {
                    max_attempts: retry.max_attempts,
                    base_ms: retry.base_ms,
                    cap_ms: retry.cap_ms,
                    multiplier: retry.multiplier,
                    jitter_fraction: retry.jitter_fraction,
                },
                idempotency_key: request.idempotency_key.clone(),
                trace_id: request.trace_id.clone().or_else(|| ctx.trace_id.clone()),
            },
            payload: request.payload,
        };
        let encoded = self
            .codec
            .encode(&envelope, encrypted)
            .await
            .map_err(QueueError::from_core)?;

        let message = JobMessage {
            job_id: job_id.clone(),
            job_type: request.job_type,
            queue: request.queue,
            payload: encoded,
            priority,
            retry,
            not_before: request.not_before,
            deadline: request.deadline,
            idempotency_key: request.idempotency_key,
            trace_id: request.trace_id.or_else(|| ctx.trace_id.clone()),
            rule_id: request.rule_id,
        };

        match self.backend.enqueue(ctx, message).await? {
            EnqueueOutcome::Enqueued { job_id } => {
                debug!(job_id = %job_id, "job enqueued");
                Ok(EnqueueReceipt {
                    job_id,
                    duplicate: false,
                    terminal_status: None,
                })
            }
            EnqueueOutcome::Duplicate { job_id } => {
                let terminal_status = match self.backend.get_record(ctx, &job_id).await {
                    Ok(record) if record.status.is_terminal() => {
                        Some(record.status.name().to_string())
                    }
                    _ => None,
                };
                debug!(job_id = %job_id, "duplicate enqueue folded into original");
                Ok(EnqueueReceipt {
                    job_id,
                    duplicate: true,
                    terminal_status,
                })
            }
        }
    }

    /// Claim and decode up to `max_batch` jobs. Jobs whose envelope fails
    /// to open are dead-lettered in place (`decrypt_failed` is not
    /// retryable) and skipped.
    pub async fn claim(
        &self,
        ctx: &QueueCtx,
        queues: &[&str],
        worker: &WorkerId,
        lease: Duration,
        max_batch: usize,
    ) -> QueueResult<Vec<ClaimedJob>> {
        let leased = self
            .backend
            .claim(ctx, queues, worker, lease, max_batch)
            .await?;
        let mut out = Vec::with_capacity(leased.len());
        for job in leased {
            let decoded = self.codec.decode(&job.record.message.payload).await;
            match decoded {
                Ok(envelope) => out.push(ClaimedJob {
                    leased: job,
                    envelope,
                }),
                Err(err) => {
                    let reason = hoist_core::errors::CoreError::normalize(err).message;
                    warn!(job_id = %job.record.job_id, error = %reason, "envelope failed to open, dead-lettering");
                    let job_error = JobError::non_retryable(format!("bad envelope: {reason}"));
                    let _ = self
                        .backend
                        .nack(
                            ctx,
                            &job.record.job_id,
                            &job.lease_token,
                            &job_error,
                            NackDisposition::Dead {
                                reason: job_error.message.clone(),
                            },
                        )
                        .await;
                }
            }
        }
        Ok(out)
    }

    pub async fn report_success(
        &self,
        ctx: &QueueCtx,
        job_id: &JobId,
        token: &LeaseToken,
    ) -> QueueResult<()> {
        self.backend.ack(ctx, job_id, token).await
    }

    /// Classify a handler failure and apply the resulting disposition.
    #[instrument(skip(self, record, token, error), fields(job_id = %record.job_id, kind = ?error.kind))]
    pub async fn report_failure(
        &self,
        ctx: &QueueCtx,
        record: &JobRecord,
        token: &LeaseToken,
        error: JobError,
    ) -> QueueResult<NackOutcome> {
        let disposition = self.dispose(record, &error, Utc::now());
        self.backend
            .nack(ctx, &record.job_id, token, &error, disposition)
            .await
    }

    /// Retry policy evaluation; pure so it can be tested with a pinned
    /// clock.
    fn dispose(&self, record: &JobRecord, error: &JobError, now: DateTime<Utc>) -> NackDisposition {
        match error.kind {
            FailureKind::Poison => NackDisposition::Dead {
                reason: format!("poison: {}", error.message),
            },
            FailureKind::NonRetryable => NackDisposition::Dead {
                reason: error.message.clone(),
            },
            FailureKind::Throttled => {
                let backoff = error
                    .retry_after_ms
                    .unwrap_or(self.throttle_min_backoff_ms)
                    .max(self.throttle_min_backoff_ms);
                NackDisposition::Retry {
                    visible_at: now + chrono::Duration::milliseconds(backoff as i64),
                    count_attempt: false,
                }
            }
            FailureKind::Retryable => {
                let policy = &record.message.retry;
                if record.attempt_count + 1 > policy.max_attempts {
                    return NackDisposition::Dead {
                        reason: format!("max attempts exceeded: {}", error.message),
                    };
                }
                let delay = policy.delay_ms(record.attempt_count);
                let visible_at = now + chrono::Duration::milliseconds(delay as i64);
                if let Some(deadline) = record.message.deadline {
                    if visible_at > deadline {
                        return NackDisposition::Dead {
                            reason: "deadline_exceeded".to_string(),
                        };
                    }
                }
                NackDisposition::Retry {
                    visible_at,
                    count_attempt: true,
                }
            }
        }
    }

    pub async fn extend_lease(
        &self,
        ctx: &QueueCtx,
        job_id: &JobId,
        token: &LeaseToken,
        extra: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        self.backend.extend_lease(ctx, job_id, token, extra).await
    }

    pub async fn release_lease(
        &self,
        ctx: &QueueCtx,
        job_id: &JobId,
        token: &LeaseToken,
    ) -> QueueResult<()> {
        self.backend.release_lease(ctx, job_id, token).await
    }

    /// Decode a stored record's envelope (admin inspection/transforms).
    pub async fn open_envelope(&self, record: &JobRecord) -> QueueResult<Envelope> {
        self.codec
            .decode(&record.message.payload)
            .await
            .map_err(QueueError::from_core)
    }

    /// Re-encode an envelope after a payload transform, preserving the
    /// tenant's encryption setting.
    pub async fn seal_envelope(&self, ctx: &QueueCtx, envelope: &Envelope) -> QueueResult<Vec<u8>> {
        let tenant = self.backend.get_tenant(&ctx.tenant_id).await?;
        let encrypted = tenant.map(|t| t.encryption.is_some()).unwrap_or(false);
        self.codec
            .encode(envelope, encrypted)
            .await
            .map_err(QueueError::from_core)
    }
}
