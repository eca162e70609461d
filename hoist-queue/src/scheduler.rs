//! Background scheduler: delayed-job promotion, lease reclaim, worker
//! expiry and recurring-rule materialization.
//!
//! One cooperative task sweeps every tenant each tick. A job whose
//! visibility time has passed reaches the ready sequence within two
//! ticks unless its queue is paused; rule evaluation is idempotent per
//! (rule, fire time) via the backend's materialization guard, so a crash
//! and restart never double-fires.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::cron::CronSchedule;
use crate::engine::{EnqueueRequest, LifecycleEngine};
use crate::error::{QueueError, QueueResult};
use crate::types::{QueueCtx, RecurringRule, RuleStatus};

/// Cap on fires processed per rule per tick; long catchup backlogs
/// continue on the next tick from the persisted cursor.
const MAX_FIRES_PER_TICK: usize = 1_000;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    pub promote_batch: usize,
    pub reclaim_batch: usize,
    /// Heartbeat age past which a worker registration is dropped.
    pub worker_ttl: Duration,
    /// How far behind a fire may be and still materialize when
    /// `catchup` is off.
    pub catchup_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(250),
            promote_batch: 512,
            reclaim_batch: 256,
            worker_ttl: Duration::from_secs(60),
            catchup_grace: Duration::from_secs(60),
        }
    }
}

/// Handle for stopping the scheduler task.
pub struct SchedulerHandle {
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

pub struct Scheduler {
    engine: Arc<LifecycleEngine>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        Self {
            engine,
            config: SchedulerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the tick loop as a background task.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(async move {
            let mut ticker = interval(self.config.tick);
            info!(tick_ms = self.config.tick.as_millis() as u64, "scheduler started");
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("scheduler shutdown requested");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            warn!(error = %e, "scheduler tick failed");
                        }
                    }
                }
            }
        });
        SchedulerHandle { shutdown_tx, join }
    }

    /// One full sweep; public so tests can drive the scheduler with a
    /// pinned cadence instead of sleeping.
    pub async fn tick(&self) -> QueueResult<()> {
        let backend = self.engine.backend();
        for tenant_id in backend.list_tenant_ids().await? {
            let ctx = QueueCtx::new(tenant_id);
            for queue in backend.list_queues(&ctx).await? {
                backend
                    .promote_due(&ctx, &queue, self.config.promote_batch)
                    .await?;
                let reclaimed = backend
                    .reclaim_expired(&ctx, &queue, self.config.reclaim_batch)
                    .await?;
                if !reclaimed.is_empty() {
                    info!(tenant = %ctx.tenant_id, queue = %queue, count = reclaimed.len(),
                        "reclaimed expired leases");
                }
            }
            let expired = backend.expire_workers(&ctx, self.config.worker_ttl).await?;
            if !expired.is_empty() {
                info!(tenant = %ctx.tenant_id, count = expired.len(), "expired stale workers");
            }
            self.evaluate_rules(&ctx).await?;
        }
        Ok(())
    }

    async fn evaluate_rules(&self, ctx: &QueueCtx) -> QueueResult<()> {
        let backend = self.engine.backend();
        for rule in backend.list_rules(ctx).await? {
            if !rule.is_active() {
                continue;
            }
            let mut rule = rule;
            match self.evaluate_rule(ctx, &mut rule).await {
                Ok(true) => backend.put_rule(ctx, rule).await?,
                Ok(false) => {}
                Err(e) => {
                    warn!(rule = %rule.id, error = %e, "rule evaluation failed");
                }
            }
        }
        Ok(())
    }

    /// Advance one rule. Returns whether the rule record changed.
    async fn evaluate_rule(&self, ctx: &QueueCtx, rule: &mut RecurringRule) -> QueueResult<bool> {
        let schedule = CronSchedule::parse(&rule.cron, &rule.timezone)?;
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.config.catchup_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut cursor = rule.last_run.unwrap_or(rule.created_at);
        let mut changed = false;

        for _ in 0..MAX_FIRES_PER_TICK {
            let Some(fire) = schedule.next_after(cursor) else {
                rule.status = RuleStatus::Expired;
                rule.next_run = None;
                rule.updated_at = now;
                return Ok(true);
            };

            if fire > now {
                if rule.next_run != Some(fire) {
                    rule.next_run = Some(fire);
                    rule.updated_at = now;
                    changed = true;
                }
                return Ok(changed);
            }

            // Missed fires beyond the grace window advance the cursor
            // without materializing unless the rule opted into catchup.
            if !rule.options.catchup && fire < now - grace {
                cursor = fire;
                rule.last_run = Some(fire);
                rule.updated_at = now;
                changed = true;
                continue;
            }

            if let Some(max) = rule.options.max_concurrent {
                let inflight = self.engine.backend().rule_inflight(ctx, &rule.id).await?;
                if inflight >= max as u64 {
                    debug!(rule = %rule.id, inflight, max, "deferring fire, rule at max_concurrent");
                    if rule.next_run != Some(fire) {
                        rule.next_run = Some(fire);
                        rule.updated_at = now;
                        changed = true;
                    }
                    return Ok(changed);
                }
            }

            let guard_ttl = Duration::from_secs(u64::from(rule.options.max_history_days) * 86_400);
            let first_fire = self
                .engine
                .backend()
                .try_mark_fired(ctx, &rule.id, fire, guard_ttl)
                .await?;
            if first_fire {
                self.materialize(ctx, rule, fire).await?;
            } else {
                debug!(rule = %rule.id, fire = %fire, "fire already materialized, skipping");
            }
            rule.last_run = Some(fire);
            rule.updated_at = now;
            cursor = fire;
            changed = true;
        }
        Ok(changed)
    }

    async fn materialize(
        &self,
        ctx: &QueueCtx,
        rule: &RecurringRule,
        fire: DateTime<Utc>,
    ) -> QueueResult<()> {
        let jitter_secs = if rule.options.jitter_seconds > 0 {
            rand::thread_rng().gen_range(0..=rule.options.jitter_seconds)
        } else {
            0
        };
        let not_before = fire + chrono::Duration::seconds(i64::from(jitter_secs));
        let payload = serde_json::to_vec(&rule.payload_template)
            .map_err(|e| QueueError::Internal(format!("rule payload template: {e}")))?;

        let request = EnqueueRequest {
            queue: rule.queue.clone(),
            job_type: rule.job_type.clone(),
            payload,
            priority: Some(rule.priority.get()),
            not_before: Some(not_before),
            deadline: None,
            retry: rule.options.retry.clone(),
            idempotency_key: None,
            trace_id: None,
            rule_id: Some(rule.id.clone()),
        };
        let receipt = self.engine.enqueue(ctx, request).await?;
        info!(rule = %rule.id, job_id = %receipt.job_id, fire = %fire, "materialized recurring job");
        Ok(())
    }
}
