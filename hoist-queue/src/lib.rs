//! # hoist-queue: multi-tenant job queue engine
//!
//! The core of the Hoist work-queue platform: reliable claim/ack/nack
//! with lease-based in-flight tracking, bounded retry with full-jitter
//! backoff, durable dead-letter handling with pattern-based remediation,
//! tenant-scoped idempotent enqueue, quotas and rate limits, recurring
//! rules with timezone-aware cron evaluation, and a worker runtime with
//! heartbeats and graceful drain.
//!
//! ## Layers
//!
//! - [`backend`]: the storage seam. [`backend::memory::MemoryBackend`]
//!   is the in-process reference implementation; the Redis backend
//!   (feature `redis`) reproduces the same semantics with one Lua script
//!   per atomic primitive.
//! - [`engine`]: the job lifecycle: validation, envelope encode and
//!   decrypt, retry evaluation, DLQ routing, dedup semantics.
//! - [`scheduler`]: delayed-job promotion, lease reclaim, worker expiry
//!   and recurring-rule materialization.
//! - [`worker`]: the claim/process/ack loop with handler dispatch.
//! - [`admin`]: the control plane consumed by the HTTP facade.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hoist_queue::backend::memory::MemoryBackend;
//! use hoist_queue::engine::{EnqueueRequest, LifecycleEngine};
//! use hoist_queue::types::QueueCtx;
//!
//! # async fn run() -> hoist_queue::error::QueueResult<()> {
//! let engine = Arc::new(LifecycleEngine::new(Arc::new(MemoryBackend::new())));
//! let ctx = QueueCtx::new("acme");
//! let receipt = engine
//!     .enqueue(&ctx, EnqueueRequest {
//!         queue: "outbound".into(),
//!         job_type: "send_email".into(),
//!         payload: br#"{"to":"user@example.com"}"#.to_vec(),
//!         ..Default::default()
//!     })
//!     .await?;
//! println!("enqueued {}", receipt.job_id);
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod backend;
pub mod cron;
pub mod dlq;
pub mod engine;
pub mod error;
pub mod pagination;
pub mod quota;
pub mod scheduler;
pub mod types;
pub mod worker;

pub use admin::AdminPlane;
pub use backend::{EnqueueOutcome, NackDisposition, NackOutcome, QueueBackend};
pub use engine::{EnqueueReceipt, EnqueueRequest, LifecycleEngine};
pub use error::{QueueError, QueueResult};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
pub use types::{
    DlqEntry, JobError, JobEvent, JobId, JobMessage, JobRecord, JobState, JobStatus, LeaseToken,
    LeasedJob, Priority, QueueConfig, QueueCtx, QueueStats, RecurringRule, RetryPolicy, RuleId,
    WorkerId, WorkerInfo,
};
pub use worker::{ActiveJob, HandlerRegistry, JobHandler, WorkerConfig, WorkerHandle, WorkerRuntime};

#[cfg(feature = "redis")]
pub use backend::redis::RedisBackend;

/// Production-ready prelude for multi-tenant job processing.
pub mod prelude {
    pub use crate::admin::AdminPlane;
    pub use crate::backend::memory::MemoryBackend;
    pub use crate::backend::QueueBackend;
    pub use crate::engine::{EnqueueRequest, LifecycleEngine};
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::scheduler::Scheduler;
    pub use crate::types::{
        JobError, JobId, Priority, QueueCtx, RetryPolicy,
    };
    pub use crate::worker::{ActiveJob, HandlerRegistry, WorkerConfig, WorkerRuntime};
    pub use async_trait::async_trait;
}
