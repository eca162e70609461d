//! Redis backend.
//!
//! Jobs live in one hash per job (scalar lifecycle fields, the message
//! JSON and the payload envelope); partitions are ZSETs (ready by
//! priority+position, delayed and in-flight by time) and lists (DLQ,
//! archive). Every multi-key transition runs as one Lua script, so the
//! backend exposes the same atomicity the in-memory implementation gets
//! from its single lock.
//!
//! Lifecycle events are published to a per-tenant channel and fanned
//! back into the local event stream by a subscriber task, which also
//! surfaces events produced by other processes sharing the store.

mod scripts;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use hoist_core::tenant::TenantRecord;
use hoist_core::Keyspace;

use crate::backend::{
    BoxStream, CancelOutcome, EnqueueOutcome, NackDisposition, NackOutcome, QueueBackend,
};
use crate::dlq::error_fingerprint;
use crate::error::{QueueError, QueueResult};
use crate::types::{
    AttemptError, DlqEntry, FailureKind, JobError, JobEvent, JobId, JobMessage, JobRecord,
    JobState, JobStatus, LeaseToken, LeasedJob, QueueCapabilities, QueueConfig, QueueCtx,
    QueueStats, RecurringRule, RetryPlacement, RuleId, WorkerId, WorkerInfo,
};

use scripts::RedisScripts;

/// Page size used when walking the per-queue jobs index.
const LIST_PAGE: usize = 256;

fn store_err(err: RedisError) -> QueueError {
    QueueError::StoreUnavailable(err.to_string())
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn kind_str(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::Retryable => "retryable",
        FailureKind::NonRetryable => "non_retryable",
        FailureKind::Throttled => "throttled",
        FailureKind::Poison => "poison",
    }
}

/// Error-chain entry as stored in Redis (written by Lua with epoch-ms
/// timestamps; `worker_id` may be a cjson `false` when absent).
#[derive(serde::Deserialize)]
struct StoredAttemptError {
    attempt: u32,
    at_ms: i64,
    #[serde(default)]
    worker_id: serde_json::Value,
    kind: String,
    message: String,
}

impl StoredAttemptError {
    fn into_attempt_error(self) -> AttemptError {
        let worker_id = match self.worker_id {
            serde_json::Value::String(s) if !s.is_empty() => Some(WorkerId::from(s)),
            _ => None,
        };
        let kind = match self.kind.as_str() {
            "non_retryable" => FailureKind::NonRetryable,
            "throttled" => FailureKind::Throttled,
            "poison" => FailureKind::Poison,
            _ => FailureKind::Retryable,
        };
        AttemptError {
            attempt: self.attempt,
            at: ms_to_datetime(self.at_ms),
            worker_id,
            kind,
            message: self.message,
        }
    }
}

pub struct RedisBackend {
    conn: ConnectionManager,
    scripts: RedisScripts,
    events: broadcast::Sender<JobEvent>,
    idem_ttl: Duration,
    /// Fingerprint for reclaim-driven dead-letters, fixed per process.
    lease_expired_fingerprint: String,
}

impl RedisBackend {
    /// Persisted layout version; bump together with migration support.
    pub const SCHEMA_VERSION: &'static str = "1";

    /// Connect and spawn the event subscriber task.
    pub async fn connect(url: &str) -> QueueResult<Self> {
        let client = Client::open(url).map_err(store_err)?;
        let mut conn = client
            .get_connection_manager()
            .await
            .map_err(store_err)?;

        let stored: Option<String> = redis::cmd("SET")
            .arg(Keyspace::schema_version())
            .arg(Self::SCHEMA_VERSION)
            .arg("NX")
            .arg("GET")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        if let Some(existing) = stored {
            if existing != Self::SCHEMA_VERSION {
                return Err(QueueError::StoreUnavailable(format!(
                    "store has schema version {existing}, this build speaks {}",
                    Self::SCHEMA_VERSION
                )));
            }
        }

        let (events, _) = broadcast::channel(1024);

        let tx = events.clone();
        let sub_client = client.clone();
        tokio::spawn(async move {
            loop {
                match sub_client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.psubscribe("hoist:events:*").await {
                            warn!(error = %e, "event subscription failed");
                        } else {
                            let mut stream = pubsub.on_message();
                            while let Some(msg) = stream.next().await {
                                if let Ok(payload) = msg.get_payload::<String>() {
                                    if let Ok(event) = serde_json::from_str::<JobEvent>(&payload) {
                                        let _ = tx.send(event);
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "event subscriber reconnecting");
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });

        Ok(Self {
            conn,
            scripts: RedisScripts::new(),
            events,
            idem_ttl: Duration::from_secs(24 * 3600),
            lease_expired_fingerprint: error_fingerprint("lease_expired"),
        })
    }

    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idem_ttl = ttl;
        self
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn publish(&self, tenant: &str, event: &JobEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let mut conn = self.conn();
            let channel = Keyspace::events_channel(tenant);
            let result: Result<i64, RedisError> = redis::cmd("PUBLISH")
                .arg(channel)
                .arg(json)
                .query_async(&mut conn)
                .await;
            if let Err(e) = result {
                debug!(error = %e, "event publish failed");
            }
        }
    }

    fn job_prefix(tenant: &str) -> String {
        format!("t:{tenant}:job:")
    }

    async fn fetch_tenant(&self, tenant_id: &str) -> QueueResult<TenantRecord> {
        Ok(self
            .get_tenant(tenant_id)
            .await?
            .unwrap_or_else(|| TenantRecord::new(tenant_id)))
    }

    async fn fetch_queue_config(&self, ctx: &QueueCtx, queue: &str) -> QueueResult<Option<QueueConfig>> {
        let mut conn = self.conn();
        let raw: Option<Vec<u8>> = conn
            .hget(Keyspace::queue_meta(&ctx.tenant_id, queue), "config")
            .await
            .map_err(store_err)?;
        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                QueueError::Internal(format!("stored queue config: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Rebuild a `JobRecord` from its hash and error list.
    async fn fetch_record(&self, ctx: &QueueCtx, job_id: &JobId) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.conn();
        let key = Keyspace::job(&ctx.tenant_id, job_id.as_str());
        let hash: HashMap<String, Vec<u8>> = conn.hgetall(&key).await.map_err(store_err)?;
        if hash.is_empty() {
            return Ok(None);
        }
        let errors: Vec<Vec<u8>> = conn
            .lrange(Keyspace::job_errors(&ctx.tenant_id, job_id.as_str()), 0, -1)
            .await
            .map_err(store_err)?;
        Ok(Some(record_from_hash(&ctx.tenant_id, hash, errors)?))
    }

    async fn require_record(&self, ctx: &QueueCtx, job_id: &JobId) -> QueueResult<JobRecord> {
        self.fetch_record(ctx, job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))
    }

    fn map_tag(tag: &str, job_id: &JobId) -> QueueError {
        match tag {
            "not_found" => QueueError::JobNotFound(job_id.to_string()),
            "cancelled" => QueueError::JobCancelled,
            "terminal" => QueueError::JobAlreadyTerminal,
            "not_owner" => QueueError::InvalidLeaseToken,
            "expired" => QueueError::LeaseExpired,
            "not_reschedulable" => QueueError::NotReschedulable,
            other => QueueError::Internal(format!("unexpected script reply: {other}")),
        }
    }
}

fn field_str(hash: &HashMap<String, Vec<u8>>, field: &str) -> Option<String> {
    hash.get(field)
        .map(|v| String::from_utf8_lossy(v).into_owned())
}

fn field_i64(hash: &HashMap<String, Vec<u8>>, field: &str) -> i64 {
    field_str(hash, field)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn record_from_hash(
    tenant_id: &str,
    hash: HashMap<String, Vec<u8>>,
    errors: Vec<Vec<u8>>,
) -> QueueResult<JobRecord> {
    let message_json = hash
        .get("message")
        .ok_or_else(|| QueueError::Internal("job hash missing message".into()))?;
    let mut message: JobMessage = serde_json::from_slice(message_json)
        .map_err(|e| QueueError::Internal(format!("stored job message: {e}")))?;
    message.payload = hash.get("payload").cloned().unwrap_or_default();
    if let Some(queue) = field_str(&hash, "queue") {
        message.queue = queue;
    }
    let not_before_ms = field_i64(&hash, "not_before_ms");
    if not_before_ms > 0 {
        message.not_before = Some(ms_to_datetime(not_before_ms));
    }

    let status_name = field_str(&hash, "status").unwrap_or_else(|| "ready".into());
    let status_ts = ms_to_datetime(field_i64(&hash, "status_ts"));
    let status = match status_name.as_str() {
        "pending" => JobStatus::Pending,
        "claimed" => JobStatus::Claimed {
            lease_until: status_ts,
        },
        "retrying" => JobStatus::Retrying {
            visible_at: status_ts,
        },
        "succeeded" => JobStatus::Succeeded { at: status_ts },
        "dead" => JobStatus::Dead { at: status_ts },
        "cancelled" => JobStatus::Cancelled { at: status_ts },
        _ => JobStatus::Ready,
    };

    let lease_token = field_str(&hash, "lease_token").filter(|s| !s.is_empty());
    let error_chain = errors
        .iter()
        .filter_map(|raw| serde_json::from_slice::<StoredAttemptError>(raw).ok())
        .map(StoredAttemptError::into_attempt_error)
        .collect();

    Ok(JobRecord {
        job_id: message.job_id.clone(),
        tenant_id: tenant_id.to_string(),
        message,
        attempt_count: field_i64(&hash, "attempt_count") as u32,
        seq: field_i64(&hash, "seq") as u64,
        created_at: ms_to_datetime(field_i64(&hash, "created_at_ms")),
        updated_at: ms_to_datetime(field_i64(&hash, "updated_at_ms")),
        last_error: field_str(&hash, "last_error").filter(|s| !s.is_empty()),
        last_worker: field_str(&hash, "last_worker")
            .filter(|s| !s.is_empty())
            .map(WorkerId::from),
        lease_until: matches!(status, JobStatus::Claimed { .. }).then_some(status_ts),
        lease_token: lease_token.map(LeaseToken::from),
        cancel_requested: field_i64(&hash, "cancel_requested") == 1,
        error_chain,
        status,
    })
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn enqueue(&self, ctx: &QueueCtx, message: JobMessage) -> QueueResult<EnqueueOutcome> {
        let now = Utc::now();
        let tenant = self.fetch_tenant(&ctx.tenant_id).await?;
        if !tenant.is_active() {
            return Err(QueueError::TenantSuspended(ctx.tenant_id.clone()));
        }
        let config = self.fetch_queue_config(ctx, &message.queue).await?;
        let rate = config
            .as_ref()
            .and_then(|c| c.rate_limit)
            .unwrap_or(tenant.rate_limits.enqueue);
        let max_length = config
            .as_ref()
            .and_then(|c| c.max_length)
            .map(|v| v as i64)
            .unwrap_or(-1);

        let tenant_id = &ctx.tenant_id;
        let queue = &message.queue;
        let job_id = message.job_id.clone();
        let payload = message.payload.clone();
        let mut stored = message.clone();
        stored.payload = Vec::new();
        let message_json = serde_json::to_vec(&stored)?;

        let idem_key = message
            .idempotency_key
            .clone()
            .map(|k| Keyspace::idempotency(tenant_id, &k));
        let rule_key = message
            .rule_id
            .as_ref()
            .map(|r| Keyspace::rule_active(tenant_id, r.as_str()));
        let now_s = now.timestamp();

        let mut conn = self.conn();
        let mut inv = self.scripts.enqueue.prepare_invoke();
        inv.key(Keyspace::job(tenant_id, job_id.as_str()))
            .key(Keyspace::ready(tenant_id, queue))
            .key(Keyspace::delayed(tenant_id, queue))
            .key(Keyspace::inflight(tenant_id, queue))
            .key(Keyspace::queue_meta(tenant_id, queue))
            .key(Keyspace::queue_index(tenant_id))
            .key(idem_key.unwrap_or_else(|| format!("t:{tenant_id}:idem:__none__")))
            .key(Keyspace::quotas(tenant_id, "hour"))
            .key(Keyspace::quotas(tenant_id, "day"))
            .key(Keyspace::storage_bytes(tenant_id))
            .key(Keyspace::rate_bucket(tenant_id, queue, "enqueue"))
            .key(Keyspace::backlog(tenant_id))
            .key(Keyspace::active_tenants())
            .key(Keyspace::jobs_index(tenant_id, queue))
            .key(rule_key.unwrap_or_else(|| format!("t:{tenant_id}:rule:__none__:active")))
            .arg(job_id.as_str())
            .arg(if message.idempotency_key.is_some() { "1" } else { "0" })
            .arg(self.idem_ttl.as_millis() as i64)
            .arg(payload)
            .arg(message_json)
            .arg(i64::from(message.priority.get()))
            .arg(message.not_before.map(|t| t.timestamp_millis()).unwrap_or(-1))
            .arg(now.timestamp_millis())
            .arg(message.payload.len() as i64)
            .arg(tenant.quotas.max_payload_bytes as i64)
            .arg(tenant.quotas.max_jobs_per_hour as i64)
            .arg(tenant.quotas.max_jobs_per_day as i64)
            .arg(tenant.quotas.max_storage_bytes as i64)
            .arg(tenant.quotas.max_backlog as i64)
            .arg(i64::from(rate.rps))
            .arg(i64::from(rate.burst))
            .arg(now_s.div_euclid(60))
            .arg(now_s.div_euclid(3600))
            .arg(tenant_id.as_str())
            .arg(max_length)
            .arg(i64::from(message.retry.max_attempts))
            .arg(queue.as_str())
            .arg(if message.rule_id.is_some() { "1" } else { "" });
        let reply: Vec<String> = inv.invoke_async(&mut conn).await.map_err(store_err)?;

        let tag = reply.first().map(String::as_str).unwrap_or("");
        match tag {
            "ok" => {
                self.publish(
                    tenant_id,
                    &JobEvent::Enqueued {
                        job_id: job_id.clone(),
                        tenant_id: tenant_id.clone(),
                        queue: queue.clone(),
                        job_type: message.job_type.clone(),
                        at: now,
                    },
                )
                .await;
                Ok(EnqueueOutcome::Enqueued { job_id })
            }
            "dup" => Ok(EnqueueOutcome::Duplicate {
                job_id: JobId::from(reply.get(1).cloned().unwrap_or_default()),
            }),
            "payload_too_large" => Err(QueueError::PayloadTooLarge {
                size: message.payload.len(),
                max: tenant.quotas.max_payload_bytes,
            }),
            "queue_full" => Err(QueueError::QueueFull(format!(
                "queue {queue} is at its length cap"
            ))),
            "backlog_full" => Err(QueueError::QueueFull(format!(
                "tenant {tenant_id} backlog is at its cap"
            ))),
            "quota_hour" => Err(QueueError::QuotaExceeded(format!(
                "tenant {tenant_id} exceeded its hourly job quota"
            ))),
            "quota_day" => Err(QueueError::QuotaExceeded(format!(
                "tenant {tenant_id} exceeded its daily job quota"
            ))),
            "storage" => Err(QueueError::StorageExceeded(format!(
                "tenant {tenant_id} exceeded its storage quota"
            ))),
            "throttled" => Err(QueueError::Throttled {
                retry_after_ms: reply
                    .get(1)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1_000),
            }),
            other => Err(QueueError::Internal(format!(
                "unexpected enqueue reply: {other}"
            ))),
        }
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
        let tenant = self.fetch_tenant(&ctx.tenant_id).await?;
        let tenant_id = &ctx.tenant_id;
        let prefix = Self::job_prefix(tenant_id);

        let mut leased = Vec::new();
        let mut throttle_wait: Option<u64> = None;
        let mut conn = self.conn();

        for queue in queues {
            if leased.len() >= max_batch {
                break;
            }
            let remaining = max_batch - leased.len();
            let config = self.fetch_queue_config(ctx, queue).await?;
            let rate = config
                .as_ref()
                .and_then(|c| c.rate_limit)
                .unwrap_or(tenant.rate_limits.dequeue);
            let tokens: Vec<LeaseToken> = (0..remaining).map(|_| LeaseToken::new()).collect();

            let mut inv = self.scripts.claim.prepare_invoke();
            inv.key(Keyspace::ready(tenant_id, queue))
                .key(Keyspace::delayed(tenant_id, queue))
                .key(Keyspace::inflight(tenant_id, queue))
                .key(Keyspace::queue_meta(tenant_id, queue))
                .key(Keyspace::rate_bucket(tenant_id, queue, "dequeue"))
                .arg(now.timestamp_millis())
                .arg(lease.as_millis() as i64)
                .arg(remaining as i64)
                .arg(worker.as_str())
                .arg(i64::from(rate.rps))
                .arg(i64::from(rate.burst))
                .arg(prefix.as_str());
            for token in &tokens {
                inv.arg(token.as_str());
            }
            let reply: Vec<String> = inv.invoke_async(&mut conn).await.map_err(store_err)?;

            match reply.first().map(String::as_str) {
                Some("throttled") => {
                    let wait = reply.get(1).and_then(|v| v.parse().ok()).unwrap_or(1_000);
                    throttle_wait = Some(throttle_wait.map_or(wait, |w: u64| w.min(wait)));
                }
                Some("ok") => {
                    for (idx, id) in reply.iter().skip(1).enumerate() {
                        let job_id = JobId::from(id.as_str());
                        let record = self.require_record(ctx, &job_id).await?;
                        let lease_until = record.lease_until.unwrap_or(now);
                        self.publish(
                            tenant_id,
                            &JobEvent::Claimed {
                                job_id: job_id.clone(),
                                worker_id: worker.clone(),
                                lease_until,
                                at: now,
                            },
                        )
                        .await;
                        leased.push(LeasedJob {
                            record,
                            lease_token: tokens[idx].clone(),
                            lease_until,
                        });
                    }
                }
                _ => {}
            }
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
        let tenant_id = &ctx.tenant_id;
        // The queue and rule tag live in the job hash.
        let record = self.require_record(ctx, job_id).await?;
        let queue = &record.message.queue;
        let rule_key = record
            .message
            .rule_id
            .as_ref()
            .map(|r| Keyspace::rule_active(tenant_id, r.as_str()));

        let mut conn = self.conn();
        let mut inv = self.scripts.ack.prepare_invoke();
        inv.key(Keyspace::job(tenant_id, job_id.as_str()))
            .key(Keyspace::inflight(tenant_id, queue))
            .key(Keyspace::queue_meta(tenant_id, queue))
            .key(Keyspace::storage_bytes(tenant_id))
            .key(Keyspace::backlog(tenant_id))
            .key(Keyspace::jobs_index(tenant_id, queue))
            .key(Keyspace::job_errors(tenant_id, job_id.as_str()))
            .key(rule_key
                .clone()
                .unwrap_or_else(|| format!("t:{tenant_id}:rule:__none__:active")))
            .key(Keyspace::archive(tenant_id, queue))
            .arg(token.as_str())
            .arg(now.timestamp_millis())
            .arg(job_id.as_str())
            .arg(Self::job_prefix(tenant_id))
            .arg(if rule_key.is_some() { "1" } else { "" });
        let reply: Vec<String> = inv.invoke_async(&mut conn).await.map_err(store_err)?;

        match reply.first().map(String::as_str) {
            Some("ok") => {
                self.publish(
                    tenant_id,
                    &JobEvent::Succeeded {
                        job_id: job_id.clone(),
                        at: now,
                    },
                )
                .await;
                Ok(())
            }
            Some(tag) => Err(Self::map_tag(tag, job_id)),
            None => Err(QueueError::Internal("empty ack reply".into())),
        }
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
        let tenant_id = &ctx.tenant_id;
        let record = self.require_record(ctx, job_id).await?;
        let queue = &record.message.queue;
        let rule_key = record
            .message
            .rule_id
            .as_ref()
            .map(|r| Keyspace::rule_active(tenant_id, r.as_str()));

        let (mode, visible_ms, count_attempt, reason) = match &disposition {
            NackDisposition::Retry {
                visible_at,
                count_attempt,
            } => (
                "retry",
                visible_at.timestamp_millis(),
                *count_attempt,
                error.message.clone(),
            ),
            NackDisposition::Dead { reason } => ("dead", 0, false, reason.clone()),
        };
        let fingerprint = error_fingerprint(&reason);

        let mut conn = self.conn();
        let mut inv = self.scripts.nack.prepare_invoke();
        inv.key(Keyspace::job(tenant_id, job_id.as_str()))
            .key(Keyspace::inflight(tenant_id, queue))
            .key(Keyspace::delayed(tenant_id, queue))
            .key(Keyspace::queue_meta(tenant_id, queue))
            .key(Keyspace::dlq(tenant_id, queue))
            .key(Keyspace::backlog(tenant_id))
            .key(Keyspace::job_errors(tenant_id, job_id.as_str()))
            .key(rule_key
                .clone()
                .unwrap_or_else(|| format!("t:{tenant_id}:rule:__none__:active")))
            .arg(token.as_str())
            .arg(job_id.as_str())
            .arg(now.timestamp_millis())
            .arg(mode)
            .arg(visible_ms)
            .arg(if count_attempt { "1" } else { "0" })
            .arg(kind_str(error.kind))
            .arg(reason.as_str())
            .arg(fingerprint.as_str())
            .arg(if rule_key.is_some() { "1" } else { "" });
        let reply: Vec<String> = inv.invoke_async(&mut conn).await.map_err(store_err)?;

        match reply.first().map(String::as_str) {
            Some("requeued") => {
                let visible_at = ms_to_datetime(visible_ms);
                self.publish(
                    tenant_id,
                    &JobEvent::Retrying {
                        job_id: job_id.clone(),
                        visible_at,
                        error: error.message.clone(),
                        at: now,
                    },
                )
                .await;
                Ok(NackOutcome::Requeued { visible_at })
            }
            Some("deadlettered") => {
                self.publish(
                    tenant_id,
                    &JobEvent::Dead {
                        job_id: job_id.clone(),
                        error: reason,
                        at: now,
                    },
                )
                .await;
                Ok(NackOutcome::DeadLettered)
            }
            Some(tag) => Err(Self::map_tag(tag, job_id)),
            None => Err(QueueError::Internal("empty nack reply".into())),
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
        let tenant_id = &ctx.tenant_id;
        let record = self.require_record(ctx, job_id).await?;
        let queue = &record.message.queue;
        let rule_key = record
            .message
            .rule_id
            .as_ref()
            .map(|r| Keyspace::rule_active(tenant_id, r.as_str()));

        let mut conn = self.conn();
        let mut inv = self.scripts.extend_lease.prepare_invoke();
        inv.key(Keyspace::job(tenant_id, job_id.as_str()))
            .key(Keyspace::inflight(tenant_id, queue))
            .key(Keyspace::queue_meta(tenant_id, queue))
            .key(Keyspace::backlog(tenant_id))
            .key(rule_key
                .clone()
                .unwrap_or_else(|| format!("t:{tenant_id}:rule:__none__:active")))
            .arg(token.as_str())
            .arg(job_id.as_str())
            .arg(now.timestamp_millis())
            .arg(extra.as_millis() as i64)
            .arg(if rule_key.is_some() { "1" } else { "" });
        let reply: Vec<String> = inv.invoke_async(&mut conn).await.map_err(store_err)?;

        match reply.first().map(String::as_str) {
            Some("ok") => Ok(ms_to_datetime(
                reply.get(1).and_then(|v| v.parse().ok()).unwrap_or(0),
            )),
            Some("cancelled") => {
                self.publish(
                    tenant_id,
                    &JobEvent::Cancelled {
                        job_id: job_id.clone(),
                        at: now,
                    },
                )
                .await;
                Err(QueueError::JobCancelled)
            }
            Some(tag) => Err(Self::map_tag(tag, job_id)),
            None => Err(QueueError::Internal("empty extend reply".into())),
        }
    }

    async fn release_lease(
        &self,
        ctx: &QueueCtx,
        job_id: &JobId,
        token: &LeaseToken,
    ) -> QueueResult<()> {
        let now = Utc::now();
        let tenant_id = &ctx.tenant_id;
        let record = self.require_record(ctx, job_id).await?;
        let queue = record.message.queue.clone();

        let mut conn = self.conn();
        let mut inv = self.scripts.release_lease.prepare_invoke();
        inv.key(Keyspace::job(tenant_id, job_id.as_str()))
            .key(Keyspace::inflight(tenant_id, &queue))
            .key(Keyspace::ready(tenant_id, &queue))
            .key(Keyspace::queue_meta(tenant_id, &queue))
            .arg(token.as_str())
            .arg(job_id.as_str())
            .arg(now.timestamp_millis());
        let reply: Vec<String> = inv.invoke_async(&mut conn).await.map_err(store_err)?;

        match reply.first().map(String::as_str) {
            Some("ok") => {
                self.publish(
                    tenant_id,
                    &JobEvent::Reclaimed {
                        job_id: job_id.clone(),
                        queue,
                        at: now,
                    },
                )
                .await;
                Ok(())
            }
            Some(tag) => Err(Self::map_tag(tag, job_id)),
            None => Err(QueueError::Internal("empty release reply".into())),
        }
    }

    async fn cancel(&self, ctx: &QueueCtx, job_id: &JobId) -> QueueResult<CancelOutcome> {
        let now = Utc::now();
        let tenant_id = &ctx.tenant_id;
        let record = self.require_record(ctx, job_id).await?;
        let queue = &record.message.queue;
        let rule_key = record
            .message
            .rule_id
            .as_ref()
            .map(|r| Keyspace::rule_active(tenant_id, r.as_str()));

        let mut conn = self.conn();
        let mut inv = self.scripts.cancel.prepare_invoke();
        inv.key(Keyspace::job(tenant_id, job_id.as_str()))
            .key(Keyspace::ready(tenant_id, queue))
            .key(Keyspace::delayed(tenant_id, queue))
            .key(Keyspace::queue_meta(tenant_id, queue))
            .key(Keyspace::backlog(tenant_id))
            .key(Keyspace::storage_bytes(tenant_id))
            .key(rule_key
                .clone()
                .unwrap_or_else(|| format!("t:{tenant_id}:rule:__none__:active")))
            .arg(job_id.as_str())
            .arg(now.timestamp_millis())
            .arg(if rule_key.is_some() { "1" } else { "" });
        let reply: Vec<String> = inv.invoke_async(&mut conn).await.map_err(store_err)?;

        match reply.first().map(String::as_str) {
            Some("cancelled") => {
                self.publish(
                    tenant_id,
                    &JobEvent::Cancelled {
                        job_id: job_id.clone(),
                        at: now,
                    },
                )
                .await;
                Ok(CancelOutcome::Cancelled)
            }
            Some("requested") => Ok(CancelOutcome::Requested),
            Some("not_cancellable") => Ok(CancelOutcome::NotCancellable),
            Some(tag) => Err(Self::map_tag(tag, job_id)),
            None => Err(QueueError::Internal("empty cancel reply".into())),
        }
    }

    async fn reclaim_expired(
        &self,
        ctx: &QueueCtx,
        queue: &str,
        limit: usize,
    ) -> QueueResult<Vec<JobId>> {
        let now = Utc::now();
        let tenant_id = &ctx.tenant_id;
        let mut conn = self.conn();
        let mut inv = self.scripts.reclaim_expired.prepare_invoke();
        inv.key(Keyspace::inflight(tenant_id, queue))
            .key(Keyspace::ready(tenant_id, queue))
            .key(Keyspace::dlq(tenant_id, queue))
            .key(Keyspace::backlog(tenant_id))
            .key(Keyspace::queue_meta(tenant_id, queue))
            .arg(now.timestamp_millis())
            .arg(limit as i64)
            .arg(Self::job_prefix(tenant_id))
            .arg(self.lease_expired_fingerprint.as_str());
        let reply: Vec<String> = inv.invoke_async(&mut conn).await.map_err(store_err)?;

        let mut reclaimed = Vec::with_capacity(reply.len());
        for entry in reply {
            let (outcome, id) = entry.split_once(':').unwrap_or(("ready", entry.as_str()));
            let job_id = JobId::from(id);
            let event = if outcome == "dead" {
                JobEvent::Dead {
                    job_id: job_id.clone(),
                    error: "lease_expired".to_string(),
                    at: now,
                }
            } else {
                JobEvent::Reclaimed {
                    job_id: job_id.clone(),
                    queue: queue.to_string(),
                    at: now,
                }
            };
            self.publish(tenant_id, &event).await;
            reclaimed.push(job_id);
        }
        Ok(reclaimed)
    }

    async fn promote_due(&self, ctx: &QueueCtx, queue: &str, limit: usize) -> QueueResult<u64> {
        let now = Utc::now();
        let tenant_id = &ctx.tenant_id;
        let mut conn = self.conn();
        let mut inv = self.scripts.promote_due.prepare_invoke();
        inv.key(Keyspace::delayed(tenant_id, queue))
            .key(Keyspace::ready(tenant_id, queue))
            .key(Keyspace::queue_meta(tenant_id, queue))
            .arg(now.timestamp_millis())
            .arg(limit as i64)
            .arg(Self::job_prefix(tenant_id));
        let reply: Vec<String> = inv.invoke_async(&mut conn).await.map_err(store_err)?;

        for id in &reply {
            self.publish(
                tenant_id,
                &JobEvent::Promoted {
                    job_id: JobId::from(id.as_str()),
                    queue: queue.to_string(),
                    at: now,
                },
            )
            .await;
        }
        Ok(reply.len() as u64)
    }

    async fn reschedule(
        &self,
        ctx: &QueueCtx,
        job_id: &JobId,
        new_time: DateTime<Utc>,
    ) -> QueueResult<()> {
        let now = Utc::now();
        let tenant_id = &ctx.tenant_id;
        let record = self.require_record(ctx, job_id).await?;
        let queue = &record.message.queue;

        let mut conn = self.conn();
        let mut inv = self.scripts.reschedule.prepare_invoke();
        inv.key(Keyspace::job(tenant_id, job_id.as_str()))
            .key(Keyspace::ready(tenant_id, queue))
            .key(Keyspace::delayed(tenant_id, queue))
            .key(Keyspace::queue_meta(tenant_id, queue))
            .arg(job_id.as_str())
            .arg(new_time.timestamp_millis())
            .arg(now.timestamp_millis());
        let reply: Vec<String> = inv.invoke_async(&mut conn).await.map_err(store_err)?;

        match reply.first().map(String::as_str) {
            Some("ok") => Ok(()),
            Some(tag) => Err(Self::map_tag(tag, job_id)),
            None => Err(QueueError::Internal("empty reschedule reply".into())),
        }
    }

    async fn get_record(&self, ctx: &QueueCtx, job_id: &JobId) -> QueueResult<JobRecord> {
        self.require_record(ctx, job_id).await
    }

    async fn list_jobs(
        &self,
        ctx: &QueueCtx,
        queue: &str,
        state: Option<JobState>,
        after_seq: Option<u64>,
        limit: usize,
    ) -> QueueResult<Vec<JobRecord>> {
        let mut conn = self.conn();
        let index = Keyspace::jobs_index(&ctx.tenant_id, queue);
        let mut out = Vec::new();
        let mut cursor = after_seq.unwrap_or(0);

        // Walk the sequence index in pages; the state filter applies
        // after reconstruction.
        for _ in 0..64 {
            if out.len() >= limit {
                break;
            }
            let min = if cursor == 0 && after_seq.is_none() {
                "-inf".to_string()
            } else {
                format!("({cursor}")
            };
            let ids: Vec<String> = conn
                .zrangebyscore_limit(&index, min, "+inf", 0, LIST_PAGE as isize)
                .await
                .map_err(store_err)?;
            if ids.is_empty() {
                break;
            }
            for id in &ids {
                let job_id = JobId::from(id.as_str());
                if let Some(record) = self.fetch_record(ctx, &job_id).await? {
                    cursor = record.seq;
                    let matches = state.map(|s| s.matches(&record.status)).unwrap_or(true);
                    if matches && out.len() < limit {
                        out.push(record);
                    }
                } else {
                    cursor += 1;
                }
            }
        }
        Ok(out)
    }

    async fn queue_stats(&self, ctx: &QueueCtx, queue: &str) -> QueueResult<QueueStats> {
        let tenant_id = &ctx.tenant_id;
        let mut conn = self.conn();
        let known: bool = conn
            .sismember(Keyspace::queue_index(tenant_id), queue)
            .await
            .map_err(store_err)?;
        let has_config = self.fetch_queue_config(ctx, queue).await?.is_some();
        if !known && !has_config {
            return Err(QueueError::QueueNotFound(queue.to_string()));
        }

        let ready: u64 = conn
            .zcard(Keyspace::ready(tenant_id, queue))
            .await
            .map_err(store_err)?;
        let delayed: u64 = conn
            .zcard(Keyspace::delayed(tenant_id, queue))
            .await
            .map_err(store_err)?;
        let in_flight: u64 = conn
            .zcard(Keyspace::inflight(tenant_id, queue))
            .await
            .map_err(store_err)?;
        let dead: u64 = conn
            .llen(Keyspace::dlq(tenant_id, queue))
            .await
            .map_err(store_err)?;
        let (succeeded, cancelled, enqueued_total): (Option<u64>, Option<u64>, Option<u64>) = conn
            .hget(
                Keyspace::queue_meta(tenant_id, queue),
                &["succeeded_total", "cancelled_total", "enqueued_total"],
            )
            .await
            .map_err(store_err)?;

        Ok(QueueStats {
            ready,
            delayed,
            in_flight,
            dead,
            succeeded: succeeded.unwrap_or(0),
            cancelled: cancelled.unwrap_or(0),
            enqueued_total: enqueued_total.unwrap_or(0),
        })
    }

    async fn list_queues(&self, ctx: &QueueCtx) -> QueueResult<Vec<String>> {
        let mut conn = self.conn();
        let mut names: Vec<String> = conn
            .smembers(Keyspace::queue_index(&ctx.tenant_id))
            .await
            .map_err(store_err)?;
        names.sort();
        Ok(names)
    }

    async fn get_queue_config(&self, ctx: &QueueCtx, queue: &str) -> QueueResult<QueueConfig> {
        self.fetch_queue_config(ctx, queue)
            .await?
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))
    }

    async fn put_queue_config(&self, ctx: &QueueCtx, config: QueueConfig) -> QueueResult<()> {
        let tenant_id = &ctx.tenant_id;
        let meta = Keyspace::queue_meta(tenant_id, &config.name);
        let json = serde_json::to_vec(&config)?;
        let mut conn = self.conn();
        // Scalar mirrors of the fields the scripts consult.
        let _: () = conn
            .hset_multiple(
                &meta,
                &[
                    ("config", json),
                    ("paused", vec![if config.paused { b'1' } else { b'0' }]),
                    (
                        "retry_placement",
                        match config.retry_placement {
                            RetryPlacement::Head => b"head".to_vec(),
                            RetryPlacement::Tail => b"tail".to_vec(),
                        },
                    ),
                    (
                        "archive_completed",
                        vec![if config.archive_completed { b'1' } else { b'0' }],
                    ),
                    (
                        "archive_limit",
                        config.archive_limit.to_string().into_bytes(),
                    ),
                ],
            )
            .await
            .map_err(store_err)?;
        let _: () = conn
            .sadd(Keyspace::queue_index(tenant_id), &config.name)
            .await
            .map_err(store_err)?;
        let _: () = conn
            .sadd(Keyspace::active_tenants(), tenant_id)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn set_paused(&self, ctx: &QueueCtx, queue: &str, paused: bool) -> QueueResult<()> {
        let mut config = self
            .fetch_queue_config(ctx, queue)
            .await?
            .unwrap_or_else(|| QueueConfig::new(queue));
        config.paused = paused;
        self.put_queue_config(ctx, config).await
    }

    async fn purge(&self, ctx: &QueueCtx, queue: &str, states: &[JobState]) -> QueueResult<u64> {
        let victims = self
            .list_jobs(ctx, queue, None, None, usize::MAX / 2)
            .await?
            .into_iter()
            .filter(|r| states.iter().any(|s| s.matches(&r.status)))
            .map(|r| r.job_id)
            .collect::<Vec<_>>();

        let tenant_id = &ctx.tenant_id;
        let mut removed = 0u64;
        let mut conn = self.conn();
        for job_id in victims {
            let mut inv = self.scripts.remove_job.prepare_invoke();
            inv.key(Keyspace::job(tenant_id, job_id.as_str()))
                .key(Keyspace::ready(tenant_id, queue))
                .key(Keyspace::delayed(tenant_id, queue))
                .key(Keyspace::inflight(tenant_id, queue))
                .key(Keyspace::dlq(tenant_id, queue))
                .key(Keyspace::jobs_index(tenant_id, queue))
                .key(Keyspace::job_errors(tenant_id, job_id.as_str()))
                .key(Keyspace::storage_bytes(tenant_id))
                .key(Keyspace::backlog(tenant_id))
                .key(Keyspace::archive(tenant_id, queue))
                .arg(job_id.as_str());
            let n: i64 = inv.invoke_async(&mut conn).await.map_err(store_err)?;
            removed += n as u64;
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
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .lrange(
                Keyspace::dlq(&ctx.tenant_id, queue),
                offset as isize,
                (offset + limit) as isize - 1,
            )
            .await
            .map_err(store_err)?;

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let job_id = JobId::from(id.as_str());
            if let Some(record) = self.fetch_record(ctx, &job_id).await? {
                let mut hash_conn = self.conn();
                let fingerprint: Option<String> = hash_conn
                    .hget(Keyspace::job(&ctx.tenant_id, job_id.as_str()), "fingerprint")
                    .await
                    .map_err(store_err)?;
                let died_at_ms: Option<i64> = hash_conn
                    .hget(Keyspace::job(&ctx.tenant_id, job_id.as_str()), "died_at_ms")
                    .await
                    .map_err(store_err)?;
                entries.push(DlqEntry {
                    fingerprint: fingerprint.unwrap_or_else(|| {
                        error_fingerprint(record.last_error.as_deref().unwrap_or("unknown error"))
                    }),
                    died_at: died_at_ms.map(ms_to_datetime).unwrap_or(record.updated_at),
                    original_queue: queue.to_string(),
                    record,
                });
            }
        }
        Ok(entries)
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
        let tenant_id = &ctx.tenant_id;
        let target = target_queue.unwrap_or(queue);
        let record = self.require_record(ctx, job_id).await?;

        let mut conn = self.conn();
        let mut inv = self.scripts.dlq_requeue.prepare_invoke();
        inv.key(Keyspace::dlq(tenant_id, queue))
            .key(Keyspace::job(tenant_id, job_id.as_str()))
            .key(Keyspace::ready(tenant_id, target))
            .key(Keyspace::queue_meta(tenant_id, target))
            .key(Keyspace::backlog(tenant_id))
            .key(Keyspace::jobs_index(tenant_id, target))
            .key(Keyspace::jobs_index(tenant_id, queue))
            .key(Keyspace::storage_bytes(tenant_id))
            .arg(job_id.as_str())
            .arg(if reset_attempts { "1" } else { "0" })
            .arg(new_payload.unwrap_or_default())
            .arg(target)
            .arg(now.timestamp_millis());
        let reply: Vec<String> = inv.invoke_async(&mut conn).await.map_err(store_err)?;

        match reply.first().map(String::as_str) {
            Some("ok") => {
                let _: () = conn
                    .sadd(Keyspace::queue_index(tenant_id), target)
                    .await
                    .map_err(store_err)?;
                self.publish(
                    tenant_id,
                    &JobEvent::Enqueued {
                        job_id: job_id.clone(),
                        tenant_id: tenant_id.clone(),
                        queue: target.to_string(),
                        job_type: record.message.job_type.clone(),
                        at: now,
                    },
                )
                .await;
                Ok(())
            }
            Some(tag) => Err(Self::map_tag(tag, job_id)),
            None => Err(QueueError::Internal("empty requeue reply".into())),
        }
    }

    async fn dlq_purge(&self, ctx: &QueueCtx, queue: &str) -> QueueResult<u64> {
        let tenant_id = &ctx.tenant_id;
        let mut conn = self.conn();
        let mut removed = 0u64;
        loop {
            let id: Option<String> = conn
                .lpop(Keyspace::dlq(tenant_id, queue), None)
                .await
                .map_err(store_err)?;
            let Some(id) = id else { break };
            let job_id = JobId::from(id.as_str());
            let mut inv = self.scripts.remove_job.prepare_invoke();
            inv.key(Keyspace::job(tenant_id, job_id.as_str()))
                .key(Keyspace::ready(tenant_id, queue))
                .key(Keyspace::delayed(tenant_id, queue))
                .key(Keyspace::inflight(tenant_id, queue))
                .key(Keyspace::dlq(tenant_id, queue))
                .key(Keyspace::jobs_index(tenant_id, queue))
                .key(Keyspace::job_errors(tenant_id, job_id.as_str()))
                .key(Keyspace::storage_bytes(tenant_id))
                .key(Keyspace::backlog(tenant_id))
                .key(Keyspace::archive(tenant_id, queue))
                .arg(job_id.as_str());
            let n: i64 = inv.invoke_async(&mut conn).await.map_err(store_err)?;
            removed += n as u64;
        }
        Ok(removed)
    }

    async fn replace_payload(
        &self,
        ctx: &QueueCtx,
        job_id: &JobId,
        payload: Vec<u8>,
    ) -> QueueResult<()> {
        let mut conn = self.conn();
        let mut inv = self.scripts.replace_payload.prepare_invoke();
        inv.key(Keyspace::job(&ctx.tenant_id, job_id.as_str()))
            .key(Keyspace::storage_bytes(&ctx.tenant_id))
            .arg(payload)
            .arg(Utc::now().timestamp_millis());
        let reply: Vec<String> = inv.invoke_async(&mut conn).await.map_err(store_err)?;
        match reply.first().map(String::as_str) {
            Some("ok") => Ok(()),
            _ => Err(QueueError::JobNotFound(job_id.to_string())),
        }
    }

    async fn put_rule(&self, ctx: &QueueCtx, rule: RecurringRule) -> QueueResult<()> {
        let tenant_id = &ctx.tenant_id;
        let json = serde_json::to_vec(&rule)?;
        let mut conn = self.conn();
        let _: () = conn
            .set(Keyspace::rule(tenant_id, rule.id.as_str()), json)
            .await
            .map_err(store_err)?;
        let _: () = conn
            .sadd(Keyspace::rule_index(tenant_id), rule.id.as_str())
            .await
            .map_err(store_err)?;
        let _: () = conn
            .sadd(Keyspace::active_tenants(), tenant_id)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get_rule(&self, ctx: &QueueCtx, rule_id: &RuleId) -> QueueResult<RecurringRule> {
        let mut conn = self.conn();
        let raw: Option<Vec<u8>> = conn
            .get(Keyspace::rule(&ctx.tenant_id, rule_id.as_str()))
            .await
            .map_err(store_err)?;
        match raw {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| QueueError::Internal(format!("stored rule: {e}"))),
            None => Err(QueueError::RuleNotFound(rule_id.to_string())),
        }
    }

    async fn delete_rule(&self, ctx: &QueueCtx, rule_id: &RuleId) -> QueueResult<()> {
        let tenant_id = &ctx.tenant_id;
        let mut conn = self.conn();
        let removed: i64 = conn
            .del(Keyspace::rule(tenant_id, rule_id.as_str()))
            .await
            .map_err(store_err)?;
        if removed == 0 {
            return Err(QueueError::RuleNotFound(rule_id.to_string()));
        }
        let _: () = conn
            .srem(Keyspace::rule_index(tenant_id), rule_id.as_str())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn list_rules(&self, ctx: &QueueCtx) -> QueueResult<Vec<RecurringRule>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .smembers(Keyspace::rule_index(&ctx.tenant_id))
            .await
            .map_err(store_err)?;
        let mut rules = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_rule(ctx, &RuleId::from(id.as_str())).await {
                Ok(rule) => rules.push(rule),
                Err(QueueError::RuleNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
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
        let key = Keyspace::rule_fired(
            &ctx.tenant_id,
            rule_id.as_str(),
            fire_time.timestamp_millis(),
        );
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as i64)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(reply.is_some())
    }

    async fn rule_inflight(&self, ctx: &QueueCtx, rule_id: &RuleId) -> QueueResult<u64> {
        let mut conn = self.conn();
        conn.scard(Keyspace::rule_active(&ctx.tenant_id, rule_id.as_str()))
            .await
            .map_err(store_err)
    }

    async fn put_tenant(&self, record: TenantRecord) -> QueueResult<()> {
        let json = serde_json::to_vec(&record)?;
        let mut conn = self.conn();
        let _: () = conn
            .hset(Keyspace::tenants(), &record.id, json)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get_tenant(&self, tenant_id: &str) -> QueueResult<Option<TenantRecord>> {
        let mut conn = self.conn();
        let raw: Option<Vec<u8>> = conn
            .hget(Keyspace::tenants(), tenant_id)
            .await
            .map_err(store_err)?;
        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                QueueError::Internal(format!("stored tenant: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    async fn delete_tenant(&self, tenant_id: &str) -> QueueResult<()> {
        let mut conn = self.conn();
        let removed: i64 = conn
            .hdel(Keyspace::tenants(), tenant_id)
            .await
            .map_err(store_err)?;
        if removed == 0 {
            return Err(QueueError::TenantNotFound(tenant_id.to_string()));
        }
        let _: () = conn
            .srem(Keyspace::active_tenants(), tenant_id)
            .await
            .map_err(store_err)?;

        // Sweep the tenant's namespace.
        let pattern = format!("t:{tenant_id}:*");
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            if !keys.is_empty() {
                let _: () = conn.del(keys).await.map_err(store_err)?;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(())
    }

    async fn list_tenants(&self) -> QueueResult<Vec<TenantRecord>> {
        let mut conn = self.conn();
        let all: HashMap<String, Vec<u8>> =
            conn.hgetall(Keyspace::tenants()).await.map_err(store_err)?;
        let mut tenants = Vec::with_capacity(all.len());
        for bytes in all.values() {
            tenants.push(
                serde_json::from_slice(bytes)
                    .map_err(|e| QueueError::Internal(format!("stored tenant: {e}")))?,
            );
        }
        tenants.sort_by(|a: &TenantRecord, b: &TenantRecord| a.id.cmp(&b.id));
        Ok(tenants)
    }

    async fn list_tenant_ids(&self) -> QueueResult<Vec<String>> {
        let mut conn = self.conn();
        let mut ids: Vec<String> = conn
            .smembers(Keyspace::active_tenants())
            .await
            .map_err(store_err)?;
        let registered: Vec<String> = conn.hkeys(Keyspace::tenants()).await.map_err(store_err)?;
        ids.extend(registered);
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn register_worker(&self, ctx: &QueueCtx, info: WorkerInfo) -> QueueResult<()> {
        let json = serde_json::to_vec(&info)?;
        let mut conn = self.conn();
        let _: () = conn
            .hset(Keyspace::workers(&ctx.tenant_id), info.id.as_str(), json)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn worker_heartbeat(&self, ctx: &QueueCtx, worker: &WorkerId) -> QueueResult<()> {
        let mut info = self.worker_info(ctx, worker).await?;
        info.last_heartbeat = Utc::now();
        self.register_worker(ctx, info).await
    }

    async fn set_worker_drain(
        &self,
        ctx: &QueueCtx,
        worker: &WorkerId,
        drain: bool,
    ) -> QueueResult<()> {
        let mut info = self.worker_info(ctx, worker).await?;
        info.draining = drain;
        self.register_worker(ctx, info).await
    }

    async fn list_workers(&self, ctx: &QueueCtx) -> QueueResult<Vec<WorkerInfo>> {
        let mut conn = self.conn();
        let all: HashMap<String, Vec<u8>> = conn
            .hgetall(Keyspace::workers(&ctx.tenant_id))
            .await
            .map_err(store_err)?;
        let mut workers = Vec::with_capacity(all.len());
        for bytes in all.values() {
            if let Ok(info) = serde_json::from_slice::<WorkerInfo>(bytes) {
                workers.push(info);
            }
        }
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }

    async fn expire_workers(&self, ctx: &QueueCtx, ttl: Duration) -> QueueResult<Vec<WorkerId>> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let workers = self.list_workers(ctx).await?;
        let mut conn = self.conn();
        let mut expired = Vec::new();
        for info in workers {
            if info.heartbeat_expired(now, ttl) {
                let _: () = conn
                    .hdel(Keyspace::workers(&ctx.tenant_id), info.id.as_str())
                    .await
                    .map_err(store_err)?;
                expired.push(info.id);
            }
        }
        Ok(expired)
    }

    fn events(&self) -> BoxStream<JobEvent> {
        use tokio_stream::wrappers::BroadcastStream;
        let receiver = self.events.subscribe();
        Box::pin(BroadcastStream::new(receiver).filter_map(|result| result.ok()))
    }

    fn capabilities(&self) -> QueueCapabilities {
        QueueCapabilities::full()
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn();
        let reply: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(QueueError::StoreUnavailable(format!(
                "unexpected ping reply: {reply}"
            )))
        }
    }
}

impl RedisBackend {
    async fn worker_info(&self, ctx: &QueueCtx, worker: &WorkerId) -> QueueResult<WorkerInfo> {
        let mut conn = self.conn();
        let raw: Option<Vec<u8>> = conn
            .hget(Keyspace::workers(&ctx.tenant_id), worker.as_str())
            .await
            .map_err(store_err)?;
        match raw {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| QueueError::Internal(format!("stored worker: {e}"))),
            None => Err(QueueError::WorkerNotFound(worker.to_string())),
        }
    }
}
