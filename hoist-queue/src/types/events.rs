use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, WorkerId};

/// Minimal stable event protocol for observability consumers.
///
/// Backends broadcast one event per lifecycle transition; the stream is
/// lossy under backpressure (slow consumers drop, the queue does not).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Enqueued {
        job_id: JobId,
        tenant_id: String,
        queue: String,
        job_type: String,
        at: DateTime<Utc>,
    },

    /// Delayed or backoff-waiting job moved into the ready sequence.
    Promoted {
        job_id: JobId,
        queue: String,
        at: DateTime<Utc>,
    },

    Claimed {
        job_id: JobId,
        worker_id: WorkerId,
        lease_until: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    Retrying {
        job_id: JobId,
        visible_at: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    },

    /// Expired lease returned the job to the ready sequence.
    Reclaimed {
        job_id: JobId,
        queue: String,
        at: DateTime<Utc>,
    },

    Succeeded {
        job_id: JobId,
        at: DateTime<Utc>,
    },

    /// Job dead-lettered.
    Dead {
        job_id: JobId,
        error: String,
        at: DateTime<Utc>,
    },

    Cancelled {
        job_id: JobId,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Promoted { .. } => "promoted",
            Self::Claimed { .. } => "claimed",
            Self::Retrying { .. } => "retrying",
            Self::Reclaimed { .. } => "reclaimed",
            Self::Succeeded { .. } => "succeeded",
            Self::Dead { .. } => "dead",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Enqueued { job_id, .. }
            | Self::Promoted { job_id, .. }
            | Self::Claimed { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Reclaimed { job_id, .. }
            | Self::Succeeded { job_id, .. }
            | Self::Dead { job_id, .. }
            | Self::Cancelled { job_id, .. } => job_id,
        }
    }

    /// Queue the event concerns, when the event carries it.
    pub fn queue(&self) -> Option<&str> {
        match self {
            Self::Enqueued { queue, .. }
            | Self::Promoted { queue, .. }
            | Self::Reclaimed { queue, .. } => Some(queue),
            _ => None,
        }
    }
}
