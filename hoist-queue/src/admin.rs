//! Admin control plane.
//!
//! Every write or inspection operation performed by humans or systems
//! other than workers: enqueue, listing with cursor pagination, DLQ
//! remediation (pattern grouping, bulk retry, payload transforms),
//! recurring-rule CRUD, schedule windows, queue and tenant management.
//!
//! Mutating operations return before/after detail so the HTTP layer can
//! record complete audit events alongside the actor identity it holds.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{info, instrument};

use hoist_core::envelope::Envelope;
use hoist_core::tenant::{
    validate_queue_name, validate_tenant_id, TenantQuotas, TenantRateLimits, TenantRecord,
    TenantStatus, RESERVED_TENANT_IDS,
};
use hoist_core::Kms;

use crate::backend::CancelOutcome;
use crate::cron::CronSchedule;
use crate::dlq::{group_patterns, DlqPattern};
use crate::engine::{EnqueueReceipt, EnqueueRequest, LifecycleEngine};
use crate::error::{QueueError, QueueResult};
use crate::pagination::{clamp_limit, decode_cursor, encode_cursor, Page, CURSOR_TTL};
use crate::types::{
    DlqEntry, JobId, JobRecord, JobState, Priority, QueueCtx, QueueStats, RecurringRule, RuleId,
    RuleOptions, RuleStatus, WorkerId, WorkerInfo,
};

/// Fields a payload transform may never touch.
const SYSTEM_FIELDS: &[&str] = &[
    "/id",
    "/tenant",
    "/status",
    "/attempts",
    "/trace_id",
    "/created_at",
];

/// Bulk operations are bounded; admins may raise the per-call cap up to
/// the hard ceiling.
pub const DEFAULT_BULK_ITEMS: usize = 1_000;
pub const MAX_BULK_ITEMS: usize = 10_000;

/// How many DLQ entries are scanned for pattern grouping in one call.
const DLQ_SCAN_LIMIT: usize = 10_000;

const MAX_WINDOW_DAYS: i64 = 365;

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub queue: String,
    pub job_type: String,
    pub status: String,
    pub priority: u8,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub not_before: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub seq: u64,
}

impl From<&JobRecord> for JobSummary {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            queue: record.message.queue.clone(),
            job_type: record.message.job_type.clone(),
            status: record.status.name().to_string(),
            priority: record.message.priority.get(),
            attempt_count: record.attempt_count,
            created_at: record.created_at,
            updated_at: record.updated_at,
            not_before: record.message.not_before,
            last_error: record.last_error.clone(),
            seq: record.seq,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub summary: JobSummary,
    pub deadline: Option<DateTime<Utc>>,
    pub trace_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub rule_id: Option<RuleId>,
    pub payload_size: usize,
    pub lease_until: Option<DateTime<Utc>>,
    pub last_worker: Option<WorkerId>,
    pub cancel_requested: bool,
    pub error_chain: Vec<crate::types::AttemptError>,
}

impl From<&JobRecord> for JobDetail {
    fn from(record: &JobRecord) -> Self {
        Self {
            summary: JobSummary::from(record),
            deadline: record.message.deadline,
            trace_id: record.message.trace_id.clone(),
            idempotency_key: record.message.idempotency_key.clone(),
            rule_id: record.message.rule_id.clone(),
            payload_size: record.message.payload_size(),
            lease_until: record.lease_until,
            last_worker: record.last_worker.clone(),
            cancel_requested: record.cancel_requested,
            error_chain: record.error_chain.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListRequest {
    pub queue: String,
    pub state: Option<JobState>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

/// A restricted JSON-patch operation on a job payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: PatchOpKind,
    /// JSON pointer into the payload document.
    pub path: String,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOpKind {
    Add,
    Replace,
    Remove,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DlqFilter {
    pub pattern_id: Option<String>,
    pub job_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DlqList {
    pub patterns: Vec<DlqPattern>,
    pub entries: Page<JobDetail>,
    pub total_dead: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DlqRetrySelector {
    pub job_ids: Option<Vec<JobId>>,
    pub pattern_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DlqRetryOptions {
    #[serde(default)]
    pub reset_retry_count: bool,
    pub target_queue: Option<String>,
    pub modify_payload: Option<Vec<PatchOp>>,
    #[serde(default)]
    pub dry_run: bool,
    pub max_items: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DlqRetryItem {
    pub job_id: JobId,
    pub before: Value,
    pub after: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct DlqRetryReport {
    pub matched: usize,
    pub requeued: Vec<DlqRetryItem>,
    pub skipped: Vec<JobId>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformResult {
    pub job_id: JobId,
    pub before: Value,
    pub after: Value,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub queue: String,
    pub job_type: String,
    #[serde(default)]
    pub payload_template: Value,
    pub priority: Option<u8>,
    #[serde(default)]
    pub options: RuleOptions,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    Day,
    Week,
}

impl Granularity {
    fn seconds(self) -> i64 {
        match self {
            Self::Hour => 3_600,
            Self::Day => 86_400,
            Self::Week => 7 * 86_400,
        }
    }
}

impl std::str::FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            other => Err(format!("unknown granularity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowBucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Delayed jobs becoming visible within the bucket.
    pub jobs: u64,
    /// Projected recurring-rule fires within the bucket.
    pub rule_fires: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantSpec {
    pub id: String,
    pub quotas: Option<TenantQuotas>,
    pub rate_limits: Option<TenantRateLimits>,
    /// Provision a KEK and encrypt payloads for this tenant.
    #[serde(default)]
    pub encrypted: bool,
}

pub struct AdminPlane {
    engine: Arc<LifecycleEngine>,
    kms: Option<Arc<dyn Kms>>,
}

impl AdminPlane {
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        Self { engine, kms: None }
    }

    pub fn with_kms(mut self, kms: Arc<dyn Kms>) -> Self {
        self.kms = Some(kms);
        self
    }

    pub fn engine(&self) -> &Arc<LifecycleEngine> {
        &self.engine
    }

    // ---- jobs ----

    pub async fn enqueue(&self, ctx: &QueueCtx, request: EnqueueRequest) -> QueueResult<EnqueueReceipt> {
        self.engine.enqueue(ctx, request).await
    }

    pub async fn list(&self, ctx: &QueueCtx, request: ListRequest) -> QueueResult<Page<JobSummary>> {
        let now = Utc::now();
        let limit = clamp_limit(request.limit);
        let after_seq = match &request.cursor {
            Some(cursor) => Some(decode_cursor(cursor, now, CURSOR_TTL)?),
            None => None,
        };
        let records = self
            .engine
            .backend()
            .list_jobs(ctx, &request.queue, request.state, after_seq, limit + 1)
            .await?;

        let has_more = records.len() > limit;
        let items: Vec<JobSummary> = records.iter().take(limit).map(JobSummary::from).collect();
        let next_cursor = if has_more {
            items.last().map(|s| encode_cursor(s.seq, now))
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    pub async fn inspect(&self, ctx: &QueueCtx, job_id: &JobId) -> QueueResult<JobDetail> {
        let record = self.engine.backend().get_record(ctx, job_id).await?;
        Ok(JobDetail::from(&record))
    }

    pub async fn cancel(&self, ctx: &QueueCtx, job_id: &JobId) -> QueueResult<CancelOutcome> {
        self.engine.backend().cancel(ctx, job_id).await
    }

    pub async fn reschedule(
        &self,
        ctx: &QueueCtx,
        job_id: &JobId,
        new_time: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.engine.backend().reschedule(ctx, job_id, new_time).await
    }

    // ---- queues ----

    pub async fn pause_queue(&self, ctx: &QueueCtx, queue: &str) -> QueueResult<()> {
        self.engine.backend().set_paused(ctx, queue, true).await
    }

    pub async fn resume_queue(&self, ctx: &QueueCtx, queue: &str) -> QueueResult<()> {
        self.engine.backend().set_paused(ctx, queue, false).await
    }

    /// Destructive; requires the explicit confirmation flag on top of
    /// the elevated scope the caller already passed.
    #[instrument(skip(self), fields(tenant = %ctx.tenant_id, queue))]
    pub async fn purge_queue(
        &self,
        ctx: &QueueCtx,
        queue: &str,
        states: Option<Vec<JobState>>,
        confirmed: bool,
    ) -> QueueResult<u64> {
        if !confirmed {
            return Err(QueueError::Validation(
                "purge requires explicit confirmation".into(),
            ));
        }
        let states = states.unwrap_or_else(|| {
            vec![JobState::Pending, JobState::Ready, JobState::Retrying]
        });
        let removed = self.engine.backend().purge(ctx, queue, &states).await?;
        info!(tenant = %ctx.tenant_id, queue, removed, "queue purged");
        Ok(removed)
    }

    pub async fn queue_stats(&self, ctx: &QueueCtx, queue: &str) -> QueueResult<QueueStats> {
        self.engine.backend().queue_stats(ctx, queue).await
    }

    pub async fn list_queues(&self, ctx: &QueueCtx) -> QueueResult<Vec<String>> {
        self.engine.backend().list_queues(ctx).await
    }

    // ---- DLQ remediation ----

    pub async fn dlq_list(
        &self,
        ctx: &QueueCtx,
        queue: &str,
        filter: &DlqFilter,
        cursor: Option<String>,
        limit: Option<usize>,
    ) -> QueueResult<DlqList> {
        let now = Utc::now();
        let limit = clamp_limit(limit);
        let entries = self
            .engine
            .backend()
            .dlq_entries(ctx, queue, 0, DLQ_SCAN_LIMIT)
            .await?;
        let patterns = group_patterns(&entries);
        let total_dead = entries.len() as u64;

        let matched: Vec<&DlqEntry> = entries
            .iter()
            .filter(|e| {
                filter
                    .pattern_id
                    .as_ref()
                    .map(|p| &e.fingerprint == p)
                    .unwrap_or(true)
                    && filter
                        .job_type
                        .as_ref()
                        .map(|t| &e.record.message.job_type == t)
                        .unwrap_or(true)
            })
            .collect();

        let offset = match cursor {
            Some(cursor) => decode_cursor(&cursor, now, CURSOR_TTL)? as usize,
            None => 0,
        };
        let page: Vec<JobDetail> = matched
            .iter()
            .skip(offset)
            .take(limit)
            .map(|e| JobDetail::from(&e.record))
            .collect();
        let next_cursor = if offset + page.len() < matched.len() {
            Some(encode_cursor((offset + page.len()) as u64, now))
        } else {
            None
        };

        Ok(DlqList {
            patterns,
            entries: Page {
                items: page,
                next_cursor,
            },
            total_dead,
        })
    }

    /// Bulk requeue of dead jobs. Atomic per job; the returned report
    /// carries before/after state for the audit trail.
    #[instrument(skip(self, selector, options), fields(tenant = %ctx.tenant_id, queue))]
    pub async fn dlq_retry(
        &self,
        ctx: &QueueCtx,
        queue: &str,
        selector: &DlqRetrySelector,
        options: &DlqRetryOptions,
    ) -> QueueResult<DlqRetryReport> {
        if selector.job_ids.is_none() && selector.pattern_id.is_none() {
            return Err(QueueError::Validation(
                "dlq retry needs job_ids or a pattern filter".into(),
            ));
        }
        if let Some(ops) = &options.modify_payload {
            validate_patch_ops(ops)?;
        }
        let max_items = options
            .max_items
            .unwrap_or(DEFAULT_BULK_ITEMS)
            .min(MAX_BULK_ITEMS);

        let entries = self
            .engine
            .backend()
            .dlq_entries(ctx, queue, 0, DLQ_SCAN_LIMIT)
            .await?;
        let matched: Vec<&DlqEntry> = entries
            .iter()
            .filter(|e| match (&selector.job_ids, &selector.pattern_id) {
                (Some(ids), _) => ids.contains(&e.record.job_id),
                (None, Some(pattern)) => &e.fingerprint == pattern,
                (None, None) => false,
            })
            .take(max_items)
            .collect();

        let mut requeued = Vec::new();
        let mut skipped = Vec::new();
        for entry in &matched {
            let job_id = entry.record.job_id.clone();
            match self.retry_one(ctx, queue, entry, options).await {
                Ok(item) => requeued.push(item),
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "dlq retry skipped job");
                    skipped.push(job_id);
                }
            }
        }
        info!(tenant = %ctx.tenant_id, queue, matched = matched.len(),
            requeued = requeued.len(), dry_run = options.dry_run, "dlq bulk retry");
        Ok(DlqRetryReport {
            matched: matched.len(),
            requeued,
            skipped,
            dry_run: options.dry_run,
        })
    }

    async fn retry_one(
        &self,
        ctx: &QueueCtx,
        queue: &str,
        entry: &DlqEntry,
        options: &DlqRetryOptions,
    ) -> QueueResult<DlqRetryItem> {
        let record = &entry.record;
        let before = json!({
            "status": record.status.name(),
            "attempt_count": record.attempt_count,
            "queue": record.message.queue,
        });

        let mut new_payload = None;
        if let Some(ops) = &options.modify_payload {
            let envelope = self.engine.open_envelope(record).await?;
            let mut doc: Value = serde_json::from_slice(&envelope.payload).map_err(|_| {
                QueueError::Validation("payload is not JSON, cannot transform".into())
            })?;
            apply_patch(&mut doc, ops)?;
            let sealed = self
                .engine
                .seal_envelope(
                    ctx,
                    &Envelope {
                        payload: serde_json::to_vec(&doc)?,
                        ..envelope
                    },
                )
                .await?;
            new_payload = Some(sealed);
        }

        let target = options.target_queue.as_deref();
        if !options.dry_run {
            self.engine
                .backend()
                .dlq_requeue(
                    ctx,
                    queue,
                    &record.job_id,
                    target,
                    options.reset_retry_count,
                    new_payload,
                )
                .await?;
        }

        let after = json!({
            "status": "ready",
            "attempt_count": if options.reset_retry_count { 0 } else { record.attempt_count },
            "queue": target.unwrap_or(&record.message.queue),
        });
        Ok(DlqRetryItem {
            job_id: record.job_id.clone(),
            before,
            after,
        })
    }

    /// Apply a restricted JSON patch to one job's payload.
    pub async fn transform_payload(
        &self,
        ctx: &QueueCtx,
        job_id: &JobId,
        ops: &[PatchOp],
        dry_run: bool,
    ) -> QueueResult<TransformResult> {
        validate_patch_ops(ops)?;
        let record = self.engine.backend().get_record(ctx, job_id).await?;
        let envelope = self.engine.open_envelope(&record).await?;
        let before: Value = serde_json::from_slice(&envelope.payload)
            .map_err(|_| QueueError::Validation("payload is not JSON, cannot transform".into()))?;

        let mut after = before.clone();
        apply_patch(&mut after, ops)?;

        if !dry_run {
            let sealed = self
                .engine
                .seal_envelope(
                    ctx,
                    &Envelope {
                        payload: serde_json::to_vec(&after)?,
                        ..envelope
                    },
                )
                .await?;
            self.engine
                .backend()
                .replace_payload(ctx, job_id, sealed)
                .await?;
        }
        Ok(TransformResult {
            job_id: job_id.clone(),
            before,
            after,
            dry_run,
        })
    }

    // ---- recurring rules ----

    pub async fn create_rule(&self, ctx: &QueueCtx, spec: RuleSpec) -> QueueResult<RecurringRule> {
        let rule = self.build_rule(ctx, spec, None)?;
        if self.engine.backend().get_rule(ctx, &rule.id).await.is_ok() {
            return Err(QueueError::Conflict(format!(
                "rule named {:?} already exists",
                rule.name
            )));
        }
        self.engine.backend().put_rule(ctx, rule.clone()).await?;
        info!(tenant = %ctx.tenant_id, rule = %rule.id, "rule created");
        Ok(rule)
    }

    /// Updates bump the version; the previous version travels in the
    /// audit event the caller records.
    pub async fn update_rule(
        &self,
        ctx: &QueueCtx,
        rule_id: &RuleId,
        spec: RuleSpec,
    ) -> QueueResult<(RecurringRule, RecurringRule)> {
        let existing = self.engine.backend().get_rule(ctx, rule_id).await?;
        let mut updated = self.build_rule(ctx, spec, Some(&existing))?;
        if updated.id != existing.id {
            return Err(QueueError::Validation(
                "rule name determines its id and cannot change".into(),
            ));
        }
        updated.version = existing.version + 1;
        updated.last_run = existing.last_run;
        self.engine.backend().put_rule(ctx, updated.clone()).await?;
        Ok((existing, updated))
    }

    pub async fn get_rule(&self, ctx: &QueueCtx, rule_id: &RuleId) -> QueueResult<RecurringRule> {
        self.engine.backend().get_rule(ctx, rule_id).await
    }

    pub async fn delete_rule(&self, ctx: &QueueCtx, rule_id: &RuleId) -> QueueResult<()> {
        self.engine.backend().delete_rule(ctx, rule_id).await
    }

    pub async fn list_rules(&self, ctx: &QueueCtx) -> QueueResult<Vec<RecurringRule>> {
        self.engine.backend().list_rules(ctx).await
    }

    pub async fn pause_rule(&self, ctx: &QueueCtx, rule_id: &RuleId) -> QueueResult<RecurringRule> {
        self.set_rule_status(ctx, rule_id, RuleStatus::Paused).await
    }

    pub async fn resume_rule(&self, ctx: &QueueCtx, rule_id: &RuleId) -> QueueResult<RecurringRule> {
        self.set_rule_status(ctx, rule_id, RuleStatus::Active).await
    }

    async fn set_rule_status(
        &self,
        ctx: &QueueCtx,
        rule_id: &RuleId,
        status: RuleStatus,
    ) -> QueueResult<RecurringRule> {
        let mut rule = self.engine.backend().get_rule(ctx, rule_id).await?;
        rule.status = status;
        rule.updated_at = Utc::now();
        if status == RuleStatus::Active {
            // Resuming recomputes the horizon instead of replaying the
            // paused stretch.
            let schedule = CronSchedule::parse(&rule.cron, &rule.timezone)?;
            let now = Utc::now();
            rule.last_run = Some(rule.last_run.map_or(now, |t| t.max(now)));
            rule.next_run = schedule.next_after(now);
        }
        self.engine.backend().put_rule(ctx, rule.clone()).await?;
        Ok(rule)
    }

    fn build_rule(
        &self,
        ctx: &QueueCtx,
        spec: RuleSpec,
        existing: Option<&RecurringRule>,
    ) -> QueueResult<RecurringRule> {
        if spec.name.is_empty() || spec.name.len() > 128 {
            return Err(QueueError::Validation("rule name length must be 1..=128".into()));
        }
        validate_queue_name(&spec.queue).map_err(QueueError::from_core)?;
        if spec.job_type.is_empty() {
            return Err(QueueError::Validation("job_type must not be empty".into()));
        }
        spec.options.validate().map_err(QueueError::Validation)?;
        let priority = match spec.priority {
            Some(p) => Priority::new(p)?,
            None => Priority::default(),
        };
        let schedule = CronSchedule::parse(&spec.cron, &spec.timezone)?;

        let now = Utc::now();
        let id = rule_id_for(&ctx.tenant_id, &spec.name);
        Ok(RecurringRule {
            id,
            tenant_id: ctx.tenant_id.clone(),
            name: spec.name,
            cron: spec.cron,
            timezone: spec.timezone,
            queue: spec.queue,
            job_type: spec.job_type,
            payload_template: spec.payload_template,
            priority,
            options: spec.options,
            status: RuleStatus::Active,
            version: 1,
            next_run: schedule.next_after(now),
            last_run: None,
            created_at: existing.map(|e| e.created_at).unwrap_or(now),
            updated_at: now,
        })
    }

    // ---- schedule windows ----

    pub async fn schedule_window(
        &self,
        ctx: &QueueCtx,
        from: DateTime<Utc>,
        till: DateTime<Utc>,
        granularity: Granularity,
    ) -> QueueResult<Vec<WindowBucket>> {
        if till <= from {
            return Err(QueueError::Validation("window end must be after start".into()));
        }
        if till - from > chrono::Duration::days(MAX_WINDOW_DAYS) {
            return Err(QueueError::Validation(format!(
                "window exceeds {MAX_WINDOW_DAYS} days"
            )));
        }

        let step = granularity.seconds();
        let span = (till - from).num_seconds();
        let bucket_count = (span + step - 1) / step;
        let mut buckets: Vec<WindowBucket> = (0..bucket_count)
            .map(|i| {
                let start = from + chrono::Duration::seconds(i * step);
                WindowBucket {
                    start,
                    end: (start + chrono::Duration::seconds(step)).min(till),
                    jobs: 0,
                    rule_fires: 0,
                }
            })
            .collect();

        let bucket_of = |t: DateTime<Utc>| -> Option<usize> {
            if t < from || t >= till {
                return None;
            }
            Some(((t - from).num_seconds() / step) as usize)
        };

        let backend = self.engine.backend();
        for queue in backend.list_queues(ctx).await? {
            let delayed = backend
                .list_jobs(ctx, &queue, Some(JobState::Pending), None, DLQ_SCAN_LIMIT)
                .await?;
            for record in delayed {
                if let Some(idx) = record.message.not_before.and_then(bucket_of) {
                    buckets[idx].jobs += 1;
                }
            }
        }

        for rule in backend.list_rules(ctx).await? {
            if !rule.is_active() {
                continue;
            }
            let Ok(schedule) = CronSchedule::parse(&rule.cron, &rule.timezone) else {
                continue;
            };
            let mut cursor = from - chrono::Duration::seconds(1);
            for _ in 0..DLQ_SCAN_LIMIT {
                match schedule.next_after(cursor) {
                    Some(fire) if fire < till => {
                        if let Some(idx) = bucket_of(fire) {
                            buckets[idx].rule_fires += 1;
                        }
                        cursor = fire;
                    }
                    _ => break,
                }
            }
        }

        Ok(buckets)
    }

    // ---- workers ----

    pub async fn list_workers(&self, ctx: &QueueCtx) -> QueueResult<Vec<WorkerInfo>> {
        self.engine.backend().list_workers(ctx).await
    }

    pub async fn drain_worker(&self, ctx: &QueueCtx, worker: &WorkerId) -> QueueResult<()> {
        self.engine.backend().set_worker_drain(ctx, worker, true).await
    }

    // ---- tenants ----

    pub async fn create_tenant(&self, spec: TenantSpec) -> QueueResult<TenantRecord> {
        validate_tenant_id(&spec.id).map_err(QueueError::from_core)?;
        if RESERVED_TENANT_IDS.contains(&spec.id.as_str()) {
            return Err(QueueError::Validation(format!(
                "tenant id {:?} is reserved",
                spec.id
            )));
        }
        if self.engine.backend().get_tenant(&spec.id).await?.is_some() {
            return Err(QueueError::Conflict(format!(
                "tenant {:?} already exists",
                spec.id
            )));
        }

        let mut record = TenantRecord::new(&spec.id);
        if let Some(quotas) = spec.quotas {
            record.quotas = quotas;
        }
        if let Some(limits) = spec.rate_limits {
            record.rate_limits = limits;
        }
        if spec.encrypted {
            let kms = self.kms.as_ref().ok_or_else(|| {
                QueueError::KmsUnavailable("no KMS configured for encrypted tenant".into())
            })?;
            let kek = kms
                .rotate(&spec.id)
                .await
                .map_err(QueueError::from_core)?;
            record = record.with_encryption(kek.key_id);
        }
        self.engine.backend().put_tenant(record.clone()).await?;
        info!(tenant = %record.id, encrypted = record.encryption.is_some(), "tenant created");
        Ok(record)
    }

    pub async fn update_tenant(
        &self,
        tenant_id: &str,
        quotas: Option<TenantQuotas>,
        rate_limits: Option<TenantRateLimits>,
        status: Option<TenantStatus>,
    ) -> QueueResult<TenantRecord> {
        let mut record = self
            .engine
            .backend()
            .get_tenant(tenant_id)
            .await?
            .ok_or_else(|| QueueError::TenantNotFound(tenant_id.to_string()))?;
        if let Some(quotas) = quotas {
            record.quotas = quotas;
        }
        if let Some(limits) = rate_limits {
            record.rate_limits = limits;
        }
        if let Some(status) = status {
            record.status = status;
        }
        record.updated_at = Utc::now();
        self.engine.backend().put_tenant(record.clone()).await?;
        Ok(record)
    }

    pub async fn delete_tenant(&self, tenant_id: &str) -> QueueResult<()> {
        self.engine.backend().delete_tenant(tenant_id).await
    }

    pub async fn list_tenants(&self) -> QueueResult<Vec<TenantRecord>> {
        self.engine.backend().list_tenants().await
    }

    /// Register a fresh KEK for the tenant. Old envelopes stay
    /// decryptable through the KMS overlap window until
    /// [`AdminPlane::rekey_sweep`] re-encrypts them.
    pub async fn rekey_tenant(&self, tenant_id: &str) -> QueueResult<TenantRecord> {
        let mut record = self
            .engine
            .backend()
            .get_tenant(tenant_id)
            .await?
            .ok_or_else(|| QueueError::TenantNotFound(tenant_id.to_string()))?;
        if record.encryption.is_none() {
            return Err(QueueError::Validation(format!(
                "tenant {tenant_id:?} has no encryption configured"
            )));
        }
        let kms = self.kms.as_ref().ok_or_else(|| {
            QueueError::KmsUnavailable("no KMS configured for rekey".into())
        })?;
        let kek = kms.rotate(tenant_id).await.map_err(QueueError::from_core)?;
        record = record.with_encryption(kek.key_id);
        record.updated_at = Utc::now();
        self.engine.backend().put_tenant(record.clone()).await?;
        info!(tenant = %tenant_id, "tenant rekeyed");
        Ok(record)
    }

    /// One batch of background re-encryption after a rekey. Returns how
    /// many envelopes were rewrapped; callers loop until it reports 0.
    pub async fn rekey_sweep(&self, ctx: &QueueCtx, limit: usize) -> QueueResult<u64> {
        let backend = self.engine.backend();
        let mut rewrapped = 0u64;
        for queue in backend.list_queues(ctx).await? {
            if rewrapped as usize >= limit {
                break;
            }
            let records = backend.list_jobs(ctx, &queue, None, None, limit).await?;
            for record in records {
                if rewrapped as usize >= limit {
                    break;
                }
                let live = matches!(
                    record.status,
                    crate::types::JobStatus::Pending
                        | crate::types::JobStatus::Ready
                        | crate::types::JobStatus::Retrying { .. }
                        | crate::types::JobStatus::Dead { .. }
                );
                if !live {
                    continue;
                }
                let envelope = self.engine.open_envelope(&record).await?;
                let sealed = self.engine.seal_envelope(ctx, &envelope).await?;
                backend.replace_payload(ctx, &record.job_id, sealed).await?;
                rewrapped += 1;
            }
        }
        Ok(rewrapped)
    }
}

/// Deterministic rule id from (tenant, name).
pub fn rule_id_for(tenant_id: &str, name: &str) -> RuleId {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update([0]);
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    RuleId(format!("rule-{hex}"))
}

fn validate_patch_ops(ops: &[PatchOp]) -> QueueResult<()> {
    for op in ops {
        if !op.path.starts_with('/') {
            return Err(QueueError::Validation(format!(
                "patch path must be a JSON pointer, got {:?}",
                op.path
            )));
        }
        for field in SYSTEM_FIELDS {
            if op.path == *field || op.path.starts_with(&format!("{field}/")) {
                return Err(QueueError::Validation(format!(
                    "patch may not touch system field {field}"
                )));
            }
        }
        if op.op != PatchOpKind::Remove && op.value.is_none() {
            return Err(QueueError::Validation(format!(
                "{:?} op requires a value",
                op.op
            )));
        }
    }
    Ok(())
}

fn apply_patch(doc: &mut Value, ops: &[PatchOp]) -> QueueResult<()> {
    for op in ops {
        apply_patch_op(doc, op)?;
    }
    Ok(())
}

fn apply_patch_op(doc: &mut Value, op: &PatchOp) -> QueueResult<()> {
    let (parent_ptr, key) = op
        .path
        .rsplit_once('/')
        .ok_or_else(|| QueueError::Validation(format!("bad patch path {:?}", op.path)))?;
    let parent = doc
        .pointer_mut(parent_ptr)
        .ok_or_else(|| QueueError::Validation(format!("patch path {:?} not found", op.path)))?;

    match parent {
        Value::Object(map) => match op.op {
            PatchOpKind::Add => {
                map.insert(key.to_string(), op.value.clone().unwrap_or(Value::Null));
            }
            PatchOpKind::Replace => {
                if !map.contains_key(key) {
                    return Err(QueueError::Validation(format!(
                        "patch path {:?} not found",
                        op.path
                    )));
                }
                map.insert(key.to_string(), op.value.clone().unwrap_or(Value::Null));
            }
            PatchOpKind::Remove => {
                map.remove(key).ok_or_else(|| {
                    QueueError::Validation(format!("patch path {:?} not found", op.path))
                })?;
            }
        },
        Value::Array(items) => {
            if op.op == PatchOpKind::Add && key == "-" {
                items.push(op.value.clone().unwrap_or(Value::Null));
                return Ok(());
            }
            let idx: usize = key
                .parse()
                .map_err(|_| QueueError::Validation(format!("bad array index {key:?}")))?;
            if idx >= items.len() {
                return Err(QueueError::Validation(format!(
                    "array index {idx} out of bounds"
                )));
            }
            match op.op {
                PatchOpKind::Add => items.insert(idx, op.value.clone().unwrap_or(Value::Null)),
                PatchOpKind::Replace => items[idx] = op.value.clone().unwrap_or(Value::Null),
                PatchOpKind::Remove => {
                    items.remove(idx);
                }
            }
        }
        _ => {
            return Err(QueueError::Validation(format!(
                "patch parent at {:?} is not a container",
                parent_ptr
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::{NackDisposition, QueueBackend};
    use crate::types::JobError;
    use hoist_core::LocalKms;
    use std::time::Duration;

    fn ctx() -> QueueCtx {
        QueueCtx::new("tenant-a")
    }

    fn plane() -> (Arc<MemoryBackend>, AdminPlane) {
        let backend = Arc::new(MemoryBackend::new());
        let engine = Arc::new(LifecycleEngine::new(backend.clone()));
        (backend.clone(), AdminPlane::new(engine))
    }

    fn request(queue: &str, payload: &[u8]) -> EnqueueRequest {
        EnqueueRequest {
            queue: queue.to_string(),
            job_type: "work".to_string(),
            payload: payload.to_vec(),
            ..Default::default()
        }
    }

    async fn kill_job(
        plane: &AdminPlane,
        queue: &str,
        error: &str,
    ) -> JobId {
        let receipt = plane
            .enqueue(&ctx(), request(queue, br#"{"n":1}"#))
            .await
            .unwrap();
        let claimed = plane
            .engine()
            .claim(&ctx(), &[queue], &WorkerId::from("w"), Duration::from_secs(30), 1)
            .await
            .unwrap()
            .pop()
            .unwrap();
        plane
            .engine()
            .backend()
            .nack(
                &ctx(),
                claimed.leased.job_id(),
                &claimed.leased.lease_token,
                &JobError::non_retryable(error),
                NackDisposition::Dead {
                    reason: error.to_string(),
                },
            )
            .await
            .unwrap();
        receipt.job_id
    }

    #[tokio::test]
    async fn list_paginates_with_cursor() {
        let (_backend, plane) = plane();
        for i in 0..7 {
            plane
                .enqueue(&ctx(), request("q", format!("{{\"i\":{i}}}").as_bytes()))
                .await
                .unwrap();
        }

        let first = plane
            .list(
                &ctx(),
                ListRequest {
                    queue: "q".into(),
                    limit: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(first.items.len(), 3);
        let cursor = first.next_cursor.expect("more pages");

        let second = plane
            .list(
                &ctx(),
                ListRequest {
                    queue: "q".into(),
                    cursor: Some(cursor),
                    limit: Some(10),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(second.items.len(), 4);
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn stale_cursor_is_rejected() {
        let (_backend, plane) = plane();
        plane.enqueue(&ctx(), request("q", b"{}")).await.unwrap();
        let old = encode_cursor(0, Utc::now() - chrono::Duration::minutes(15));
        let res = plane
            .list(
                &ctx(),
                ListRequest {
                    queue: "q".into(),
                    cursor: Some(old),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(res, Err(QueueError::StaleCursor)));
    }

    #[tokio::test]
    async fn dlq_list_groups_patterns() {
        let (_backend, plane) = plane();
        for i in 0..5 {
            kill_job(&plane, "q", &format!("connection timeout after {i}s")).await;
        }
        for _ in 0..2 {
            kill_job(&plane, "q", "invalid JSON").await;
        }

        let list = plane
            .dlq_list(&ctx(), "q", &DlqFilter::default(), None, None)
            .await
            .unwrap();
        assert_eq!(list.total_dead, 7);
        assert_eq!(list.patterns.len(), 2);
        assert_eq!(list.patterns[0].count, 5);
        assert!(list.patterns[0].exemplar.contains("connection timeout"));
        assert_eq!(list.patterns[1].count, 2);

        // Filtering by the dominant pattern narrows the entries.
        let filtered = plane
            .dlq_list(
                &ctx(),
                "q",
                &DlqFilter {
                    pattern_id: Some(list.patterns[0].id.clone()),
                    job_type: None,
                },
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(filtered.entries.items.len(), 5);
    }

    #[tokio::test]
    async fn dlq_bulk_retry_by_pattern() {
        let (backend, plane) = plane();
        for i in 0..4 {
            kill_job(&plane, "q", &format!("connection timeout after {i}s")).await;
        }
        let list = plane
            .dlq_list(&ctx(), "q", &DlqFilter::default(), None, None)
            .await
            .unwrap();
        let pattern = list.patterns[0].id.clone();

        // Dry run first: nothing moves.
        let preview = plane
            .dlq_retry(
                &ctx(),
                "q",
                &DlqRetrySelector {
                    job_ids: None,
                    pattern_id: Some(pattern.clone()),
                },
                &DlqRetryOptions {
                    reset_retry_count: true,
                    dry_run: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(preview.matched, 4);
        assert_eq!(backend.dlq_entries(&ctx(), "q", 0, 10).await.unwrap().len(), 4);

        let report = plane
            .dlq_retry(
                &ctx(),
                "q",
                &DlqRetrySelector {
                    job_ids: None,
                    pattern_id: Some(pattern),
                },
                &DlqRetryOptions {
                    reset_retry_count: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(report.requeued.len(), 4);
        assert!(report.skipped.is_empty());
        assert!(backend.dlq_entries(&ctx(), "q", 0, 10).await.unwrap().is_empty());

        let stats = backend.queue_stats(&ctx(), "q").await.unwrap();
        assert_eq!(stats.ready, 4);
        for item in &report.requeued {
            assert_eq!(item.after["attempt_count"], 0);
            let record = backend.get_record(&ctx(), &item.job_id).await.unwrap();
            assert_eq!(record.attempt_count, 0);
        }
    }

    #[tokio::test]
    async fn dlq_retry_requires_selector() {
        let (_backend, plane) = plane();
        let res = plane
            .dlq_retry(
                &ctx(),
                "q",
                &DlqRetrySelector::default(),
                &DlqRetryOptions::default(),
            )
            .await;
        assert!(matches!(res, Err(QueueError::Validation(_))));
    }

    #[tokio::test]
    async fn transform_payload_respects_system_fields() {
        let (_backend, plane) = plane();
        let job_id = kill_job(&plane, "q", "boom").await;

        let forbidden = plane
            .transform_payload(
                &ctx(),
                &job_id,
                &[PatchOp {
                    op: PatchOpKind::Replace,
                    path: "/status".into(),
                    value: Some(json!("ready")),
                }],
                true,
            )
            .await;
        assert!(matches!(forbidden, Err(QueueError::Validation(_))));

        let result = plane
            .transform_payload(
                &ctx(),
                &job_id,
                &[
                    PatchOp {
                        op: PatchOpKind::Replace,
                        path: "/n".into(),
                        value: Some(json!(2)),
                    },
                    PatchOp {
                        op: PatchOpKind::Add,
                        path: "/note".into(),
                        value: Some(json!("fixed")),
                    },
                ],
                false,
            )
            .await
            .unwrap();
        assert_eq!(result.before["n"], 1);
        assert_eq!(result.after["n"], 2);
        assert_eq!(result.after["note"], "fixed");

        // The stored envelope was rewritten.
        let record = plane.engine().backend().get_record(&ctx(), &job_id).await.unwrap();
        let envelope = plane.engine().open_envelope(&record).await.unwrap();
        let doc: Value = serde_json::from_slice(&envelope.payload).unwrap();
        assert_eq!(doc["n"], 2);
    }

    #[tokio::test]
    async fn rule_ids_are_deterministic_and_unique_per_name() {
        let (_backend, plane) = plane();
        let spec = RuleSpec {
            name: "nightly-report".into(),
            cron: "0 0 2 * * *".into(),
            timezone: "UTC".into(),
            queue: "reports".into(),
            job_type: "report".into(),
            payload_template: json!({"kind": "nightly"}),
            priority: None,
            options: RuleOptions::default(),
        };
        let rule = plane.create_rule(&ctx(), spec.clone()).await.unwrap();
        assert_eq!(rule.id, rule_id_for("tenant-a", "nightly-report"));
        assert!(rule.next_run.is_some());

        let dup = plane.create_rule(&ctx(), spec).await;
        assert!(matches!(dup, Err(QueueError::Conflict(_))));
    }

    #[tokio::test]
    async fn rule_update_bumps_version() {
        let (_backend, plane) = plane();
        let spec = RuleSpec {
            name: "sync".into(),
            cron: "0 */5 * * * *".into(),
            timezone: "UTC".into(),
            queue: "sync".into(),
            job_type: "sync".into(),
            payload_template: json!({}),
            priority: None,
            options: RuleOptions::default(),
        };
        let rule = plane.create_rule(&ctx(), spec.clone()).await.unwrap();

        let mut updated_spec = spec;
        updated_spec.cron = "0 */10 * * * *".into();
        let (before, after) = plane.update_rule(&ctx(), &rule.id, updated_spec).await.unwrap();
        assert_eq!(before.version, 1);
        assert_eq!(after.version, 2);
        assert_eq!(after.cron, "0 */10 * * * *");
    }

    #[tokio::test]
    async fn purge_needs_confirmation() {
        let (_backend, plane) = plane();
        plane.enqueue(&ctx(), request("q", b"{}")).await.unwrap();

        let denied = plane.purge_queue(&ctx(), "q", None, false).await;
        assert!(matches!(denied, Err(QueueError::Validation(_))));

        let removed = plane.purge_queue(&ctx(), "q", None, true).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn schedule_window_buckets_delayed_jobs_and_rules() {
        let (_backend, plane) = plane();
        let from = Utc::now() + chrono::Duration::hours(1);
        let till = from + chrono::Duration::hours(6);

        // Two delayed jobs in the second hour of the window.
        for _ in 0..2 {
            let mut req = request("q", b"{}");
            req.not_before = Some(from + chrono::Duration::minutes(90));
            plane.enqueue(&ctx(), req).await.unwrap();
        }
        plane
            .create_rule(
                &ctx(),
                RuleSpec {
                    name: "hourly".into(),
                    cron: "0 0 * * * *".into(),
                    timezone: "UTC".into(),
                    queue: "q".into(),
                    job_type: "tick".into(),
                    payload_template: json!({}),
                    priority: None,
                    options: RuleOptions::default(),
                },
            )
            .await
            .unwrap();

        let buckets = plane
            .schedule_window(&ctx(), from, till, Granularity::Hour)
            .await
            .unwrap();
        assert_eq!(buckets.len(), 6);
        assert_eq!(buckets[1].jobs, 2);
        let total_fires: u64 = buckets.iter().map(|b| b.rule_fires).sum();
        assert_eq!(total_fires, 6);

        let too_wide = plane
            .schedule_window(
                &ctx(),
                from,
                from + chrono::Duration::days(400),
                Granularity::Day,
            )
            .await;
        assert!(matches!(too_wide, Err(QueueError::Validation(_))));
    }

    #[tokio::test]
    async fn tenant_lifecycle_and_rekey() {
        let backend = Arc::new(MemoryBackend::new());
        let kms = Arc::new(LocalKms::new());
        let engine = Arc::new(
            LifecycleEngine::new(backend.clone())
                .with_codec(hoist_core::EnvelopeCodec::new().with_kms(kms.clone())),
        );
        let plane = AdminPlane::new(engine.clone()).with_kms(kms);

        let reserved = plane
            .create_tenant(TenantSpec {
                id: "system".into(),
                quotas: None,
                rate_limits: None,
                encrypted: false,
            })
            .await;
        assert!(matches!(reserved, Err(QueueError::Validation(_))));

        let record = plane
            .create_tenant(TenantSpec {
                id: "acme".into(),
                quotas: None,
                rate_limits: None,
                encrypted: true,
            })
            .await
            .unwrap();
        let first_kek = record.encryption.clone().unwrap().kek_id;

        // Enqueue an encrypted job, then rotate and sweep.
        let tenant_ctx = QueueCtx::new("acme");
        let receipt = plane
            .enqueue(&tenant_ctx, request("q", br#"{"v":1}"#))
            .await
            .unwrap();

        let rekeyed = plane.rekey_tenant("acme").await.unwrap();
        assert_ne!(rekeyed.encryption.unwrap().kek_id, first_kek);

        let swept = plane.rekey_sweep(&tenant_ctx, 100).await.unwrap();
        assert_eq!(swept, 1);

        // The envelope still opens after the sweep.
        let record = backend.get_record(&tenant_ctx, &receipt.job_id).await.unwrap();
        let envelope = engine.open_envelope(&record).await.unwrap();
        assert_eq!(envelope.payload, br#"{"v":1}"#);

        plane.delete_tenant("acme").await.unwrap();
        assert!(backend.get_tenant("acme").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn patch_engine_handles_arrays() {
        let mut doc = json!({"items": [1, 2, 3]});
        apply_patch(
            &mut doc,
            &[
                PatchOp {
                    op: PatchOpKind::Add,
                    path: "/items/-".into(),
                    value: Some(json!(4)),
                },
                PatchOp {
                    op: PatchOpKind::Remove,
                    path: "/items/0".into(),
                    value: None,
                },
            ],
        )
        .unwrap();
        assert_eq!(doc, json!({"items": [2, 3, 4]}));
    }
}
