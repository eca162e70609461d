pub mod capabilities;
pub mod ctx;
pub mod events;
pub mod ids;
pub mod message;
pub mod priority;
pub mod queue;
pub mod record;
pub mod retry;
pub mod rule;
pub mod worker;

pub use capabilities::QueueCapabilities;
pub use ctx::QueueCtx;
pub use events::JobEvent;
pub use ids::{JobId, LeaseToken, RuleId, WorkerId};
pub use message::JobMessage;
pub use priority::Priority;
pub use queue::{QueueConfig, QueueStats, RetryPlacement};
pub use record::{DlqEntry, JobRecord, JobState, JobStatus, LeasedJob};
pub use retry::{AttemptError, FailureKind, JobError, RetryPolicy};
pub use rule::{RecurringRule, RuleOptions, RuleStatus};
pub use worker::WorkerInfo;
