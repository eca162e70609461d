//! Worker runtime: the claim/process/ack loop.
//!
//! One claim loop runs per concurrency slot. Claimed jobs dispatch to a
//! type-erased handler registry; a heartbeat task extends the lease
//! every third of its duration, and a cancellation signal fires when the
//! lease is lost, the job is cancelled, or the process is force-stopped.
//! Handler panics are contained by the slot harness and converted into a
//! retryable failure, so another worker picks the job up.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::backend::{NackDisposition, QueueBackend};
use crate::engine::{ClaimedJob, LifecycleEngine};
use crate::error::{QueueError, QueueResult};
use crate::types::{JobError, JobId, QueueCtx, WorkerId, WorkerInfo};

/// A claimed job as seen by a handler: decoded payload plus a
/// cancellation signal tied to the lease.
#[derive(Debug)]
pub struct ActiveJob {
    pub job_id: JobId,
    pub queue: String,
    pub job_type: String,
    /// Decoded plaintext payload.
    pub payload: Vec<u8>,
    /// Current attempt number (1-based).
    pub attempt: u32,
    pub trace_id: Option<String>,
    cancelled: watch::Receiver<bool>,
}

impl ActiveJob {
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves when cancellation fires; handlers should checkpoint and
    /// return promptly afterwards.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.cancelled.borrow() {
                return;
            }
            if self.cancelled.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Job handler dispatched by job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &str;

    async fn handle(&self, job: ActiveJob) -> Result<(), JobError>;
}

/// Adapter for closure handlers.
pub struct FnHandler<F> {
    job_type: String,
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(ActiveJob) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), JobError>> + Send,
{
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn handle(&self, job: ActiveJob) -> Result<(), JobError> {
        (self.f)(job).await
    }
}

/// Registry mapping job types to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> QueueResult<()> {
        let job_type = handler.job_type().to_string();
        if self.handlers.contains_key(&job_type) {
            return Err(QueueError::Conflict(format!(
                "handler for job type {job_type:?} already registered"
            )));
        }
        self.handlers.insert(job_type, handler);
        Ok(())
    }

    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F) -> QueueResult<()>
    where
        F: Fn(ActiveJob) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.register(Arc::new(FnHandler {
            job_type: job_type.into(),
            f,
        }))
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queues: Vec<String>,
    pub concurrency: usize,
    pub lease: Duration,
    pub poll_timeout: Duration,
    /// How long a graceful drain waits for in-flight jobs before
    /// releasing their leases.
    pub drain_deadline: Duration,
    /// Cancellation fires this far before a lost lease expires, leaving
    /// the handler room to checkpoint.
    pub safety_margin: Duration,
    pub version: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec!["default".to_string()],
            concurrency: 4,
            lease: Duration::from_secs(30),
            poll_timeout: Duration::from_secs(5),
            drain_deadline: Duration::from_secs(30),
            safety_margin: Duration::from_secs(5),
            version: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainState {
    Running,
    /// No new claims; in-flight jobs run to completion.
    Draining,
    /// Past the drain deadline: release leases and stop.
    ForceStop,
}

struct SlotShared {
    engine: Arc<LifecycleEngine>,
    registry: Arc<HandlerRegistry>,
    ctx: QueueCtx,
    config: WorkerConfig,
    worker_id: WorkerId,
}

pub struct WorkerRuntime {
    shared: Arc<SlotShared>,
}

impl WorkerRuntime {
    pub fn new(
        engine: Arc<LifecycleEngine>,
        registry: Arc<HandlerRegistry>,
        ctx: QueueCtx,
        config: WorkerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(SlotShared {
                engine,
                registry,
                ctx,
                config,
                worker_id: WorkerId::new(),
            }),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.shared.worker_id
    }

    /// Register with the backend and start the slot loops.
    pub async fn start(self) -> QueueResult<WorkerHandle> {
        let shared = self.shared;
        let info = WorkerInfo::new(
            shared.worker_id.clone(),
            shared.ctx.tenant_id.clone(),
            shared.config.queues.clone(),
            shared.config.concurrency,
        );
        let info = match &shared.config.version {
            Some(v) => info.with_version(v.clone()),
            None => info,
        };
        shared
            .engine
            .backend()
            .register_worker(&shared.ctx, info)
            .await?;

        let (drain_tx, drain_rx) = watch::channel(DrainState::Running);
        let mut joins = Vec::with_capacity(shared.config.concurrency);
        for slot in 0..shared.config.concurrency.max(1) {
            let shared = shared.clone();
            let drain_rx = drain_rx.clone();
            joins.push(tokio::spawn(async move {
                slot_loop(shared, drain_rx, slot).await;
            }));
        }

        let heartbeat = tokio::spawn(registry_heartbeat(shared.clone(), drain_tx.clone()));
        info!(worker = %shared.worker_id, slots = shared.config.concurrency,
            queues = ?shared.config.queues, "worker started");

        Ok(WorkerHandle {
            drain_tx,
            joins,
            heartbeat,
            drain_deadline: shared.config.drain_deadline,
        })
    }
}

/// Handle for draining and stopping a running worker.
pub struct WorkerHandle {
    drain_tx: watch::Sender<DrainState>,
    joins: Vec<JoinHandle<()>>,
    heartbeat: JoinHandle<()>,
    drain_deadline: Duration,
}

impl WorkerHandle {
    /// Graceful shutdown: stop claiming, wait for in-flight work up to
    /// the drain deadline, then release remaining leases so another
    /// worker picks them up immediately.
    pub async fn shutdown(mut self) -> QueueResult<()> {
        let _ = self.drain_tx.send(DrainState::Draining);

        let all_done = async {
            for join in &mut self.joins {
                let _ = join.await;
            }
        };
        if tokio::time::timeout(self.drain_deadline, all_done).await.is_err() {
            warn!("drain deadline passed, releasing remaining leases");
            let _ = self.drain_tx.send(DrainState::ForceStop);
            for join in &mut self.joins {
                let _ = join.await;
            }
        }
        self.heartbeat.abort();
        Ok(())
    }
}

async fn registry_heartbeat(shared: Arc<SlotShared>, drain_tx: watch::Sender<DrainState>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(15));
    loop {
        ticker.tick().await;
        if let Err(e) = shared
            .engine
            .backend()
            .worker_heartbeat(&shared.ctx, &shared.worker_id)
            .await
        {
            debug!(worker = %shared.worker_id, error = %e, "worker heartbeat failed");
        }
        // An admin-side drain request propagates through the registry.
        if let Ok(workers) = shared.engine.backend().list_workers(&shared.ctx).await {
            let draining = workers
                .iter()
                .any(|w| w.id == shared.worker_id && w.draining);
            if draining && *drain_tx.borrow() == DrainState::Running {
                info!(worker = %shared.worker_id, "drain requested via registry");
                let _ = drain_tx.send(DrainState::Draining);
            }
        }
    }
}

async fn slot_loop(shared: Arc<SlotShared>, mut drain_rx: watch::Receiver<DrainState>, slot: usize) {
    debug!(worker = %shared.worker_id, slot, "slot loop started");
    loop {
        if *drain_rx.borrow() != DrainState::Running {
            break;
        }
        let queues: Vec<&str> = shared.config.queues.iter().map(|s| s.as_str()).collect();
        let claimed = shared
            .engine
            .claim(
                &shared.ctx,
                &queues,
                &shared.worker_id,
                shared.config.lease,
                1,
            )
            .await;

        match claimed {
            Ok(mut jobs) => match jobs.pop() {
                Some(job) => process_one(&shared, job, &mut drain_rx).await,
                None => idle_wait(&shared, &mut drain_rx).await,
            },
            Err(QueueError::Throttled { retry_after_ms }) => {
                let wait = Duration::from_millis(retry_after_ms)
                    .min(shared.config.poll_timeout);
                tokio::select! {
                    _ = drain_rx.changed() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            Err(e) => {
                error!(worker = %shared.worker_id, slot, error = %e, "claim failed");
                tokio::select! {
                    _ = drain_rx.changed() => {}
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
    debug!(worker = %shared.worker_id, slot, "slot loop stopped");
}

/// Long-poll wait: wake on queue activity, drain, or poll timeout.
async fn idle_wait(shared: &Arc<SlotShared>, drain_rx: &mut watch::Receiver<DrainState>) {
    let mut events = shared.engine.backend().events();
    let relevant = async {
        while let Some(event) = events.next().await {
            if let Some(queue) = event.queue() {
                if shared.config.queues.iter().any(|q| q == queue) {
                    return;
                }
            }
        }
        // Stream closed; fall back to the timeout.
        std::future::pending::<()>().await;
    };
    tokio::select! {
        _ = drain_rx.changed() => {}
        _ = relevant => {}
        _ = tokio::time::sleep(shared.config.poll_timeout) => {}
    }
}

async fn process_one(
    shared: &Arc<SlotShared>,
    job: ClaimedJob,
    drain_rx: &mut watch::Receiver<DrainState>,
) {
    let ClaimedJob { leased, envelope } = job;
    let job_id = leased.record.job_id.clone();
    let token = leased.lease_token.clone();
    let job_type = leased.record.message.job_type.clone();

    let Some(handler) = shared.registry.get(&job_type) else {
        warn!(job_id = %job_id, job_type = %job_type, "no handler registered, dead-lettering");
        let err = JobError::non_retryable(format!("no handler registered for {job_type:?}"));
        if let Err(e) = shared
            .engine
            .report_failure(&shared.ctx, &leased.record, &token, err)
            .await
        {
            warn!(job_id = %job_id, error = %e, "failed to dead-letter unhandled job");
        }
        return;
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let active = ActiveJob {
        job_id: job_id.clone(),
        queue: leased.record.message.queue.clone(),
        job_type: job_type.clone(),
        payload: envelope.payload,
        attempt: leased.record.attempt_count,
        trace_id: leased.record.message.trace_id.clone(),
        cancelled: cancel_rx,
    };

    let mut handler_task = tokio::spawn(async move { handler.handle(active).await });

    // Lease renewal runs every third of the lease; the safety margin
    // belongs to the cancellation deadline, not the heartbeat cadence.
    let heartbeat_every = (shared.config.lease / 3).max(Duration::from_millis(10));
    let mut extending = true;
    let mut force_released = false;

    let result = loop {
        let heartbeat = tokio::time::sleep(heartbeat_every);
        tokio::select! {
            res = &mut handler_task => break res,

            _ = heartbeat, if extending => {
                match shared
                    .engine
                    .extend_lease(&shared.ctx, &job_id, &token, shared.config.lease)
                    .await
                {
                    Ok(_) => {}
                    Err(QueueError::JobCancelled) => {
                        info!(job_id = %job_id, "cancellation observed, signalling handler");
                        extending = false;
                        let _ = cancel_tx.send(true);
                    }
                    Err(e) => {
                        // Lost lease: stop extending and signal cancel so
                        // the handler checkpoints before the reclaimed
                        // copy starts elsewhere.
                        warn!(job_id = %job_id, error = %e, "lost lease, signalling handler");
                        extending = false;
                        let _ = cancel_tx.send(true);
                    }
                }
            }

            _ = drain_rx.changed() => {
                if *drain_rx.borrow() == DrainState::ForceStop {
                    let _ = cancel_tx.send(true);
                    handler_task.abort();
                    if let Err(e) = shared
                        .engine
                        .release_lease(&shared.ctx, &job_id, &token)
                        .await
                    {
                        debug!(job_id = %job_id, error = %e, "release on force-stop failed");
                    }
                    force_released = true;
                    break (&mut handler_task).await;
                }
            }
        }
    };

    if force_released {
        return;
    }

    match result {
        Ok(Ok(())) => {
            if let Err(e) = shared.engine.report_success(&shared.ctx, &job_id, &token).await {
                // Another worker may hold a reclaimed copy; logged and
                // dropped per the delivery contract.
                warn!(job_id = %job_id, error = %e, "ack failed, dropping result");
            } else {
                debug!(job_id = %job_id, "job succeeded");
            }
        }
        Ok(Err(job_error)) => {
            if let Err(e) = shared
                .engine
                .report_failure(&shared.ctx, &leased.record, &token, job_error)
                .await
            {
                warn!(job_id = %job_id, error = %e, "nack failed, dropping failure report");
            }
        }
        Err(join_err) if join_err.is_panic() => {
            // A panic is treated like an expired lease: the job becomes
            // immediately retriable with an attempt consumed, skipping
            // the backoff schedule entirely.
            error!(job_id = %job_id, "handler panicked, returning job for immediate retry");
            let err = JobError::retryable("lease_expired");
            let disposition = NackDisposition::Retry {
                visible_at: chrono::Utc::now(),
                count_attempt: true,
            };
            if let Err(e) = shared
                .engine
                .backend()
                .nack(&shared.ctx, &job_id, &token, &err, disposition)
                .await
            {
                warn!(job_id = %job_id, error = %e, "failed to requeue after panic");
            }
        }
        Err(_) => {
            // Aborted task without force-release: nothing to report.
        }
    }
}
