use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AttemptError, JobId, JobMessage, LeaseToken, WorkerId};

/// Job status lifecycle.
///
/// A job occupies exactly one state partition at any instant: the delayed
/// index (`Pending`, `Retrying` before visibility), the ready sequence
/// (`Ready`, `Retrying` after promotion), the in-flight set (`Claimed`),
/// the DLQ (`Dead`) or the terminal archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the delayed index for its `not_before`.
    Pending,

    /// Eligible for claiming.
    Ready,

    /// Claimed by a worker holding a lease.
    Claimed { lease_until: DateTime<Utc> },

    /// Failed, waiting out its backoff before becoming claimable again.
    Retrying { visible_at: DateTime<Utc> },

    /// Terminal: acknowledged success.
    Succeeded { at: DateTime<Utc> },

    /// Terminal: dead-lettered.
    Dead { at: DateTime<Utc> },

    /// Terminal: cancelled before completion.
    Cancelled { at: DateTime<Utc> },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. } | Self::Dead { .. } | Self::Cancelled { .. }
        )
    }

    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::Claimed { .. })
    }

    /// Eligible for claiming right now.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Ready => true,
            Self::Retrying { visible_at } => *visible_at <= now,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Claimed { .. } => "claimed",
            Self::Retrying { .. } => "retrying",
            Self::Succeeded { .. } => "succeeded",
            Self::Dead { .. } => "dead",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// State filter used by listing and purge operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Ready,
    Claimed,
    Retrying,
    Succeeded,
    Dead,
    Cancelled,
}

impl JobState {
    pub fn matches(&self, status: &JobStatus) -> bool {
        matches!(
            (self, status),
            (JobState::Pending, JobStatus::Pending)
                | (JobState::Ready, JobStatus::Ready)
                | (JobState::Claimed, JobStatus::Claimed { .. })
                | (JobState::Retrying, JobStatus::Retrying { .. })
                | (JobState::Succeeded, JobStatus::Succeeded { .. })
                | (JobState::Dead, JobStatus::Dead { .. })
                | (JobState::Cancelled, JobStatus::Cancelled { .. })
        )
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "claimed" | "inflight" => Ok(Self::Claimed),
            "retrying" => Ok(Self::Retrying),
            "succeeded" => Ok(Self::Succeeded),
            "dead" => Ok(Self::Dead),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Mutable runtime state of a job, owned by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub tenant_id: String,
    pub message: JobMessage,
    pub status: JobStatus,

    /// Number of the current (or next) processing attempt. Bumped by the
    /// first claim, by retry scheduling and by lease reclaim; never
    /// exceeds `message.retry.max_attempts`.
    pub attempt_count: u32,

    /// Backend-assigned enqueue sequence, the FIFO tie-breaker within a
    /// priority bucket and the sort key for cursor pagination.
    pub seq: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub last_worker: Option<WorkerId>,
    pub lease_token: Option<LeaseToken>,
    pub lease_until: Option<DateTime<Utc>>,

    /// Set when a cancel request arrives while the job is claimed; the
    /// worker observes it at the next lease extension.
    pub cancel_requested: bool,

    /// Full per-attempt error history, preserved into DLQ snapshots.
    pub error_chain: Vec<AttemptError>,
}

impl JobRecord {
    pub fn new(tenant_id: impl Into<String>, message: JobMessage, seq: u64, now: DateTime<Utc>) -> Self {
        let status = if message.is_delayed(now) {
            JobStatus::Pending
        } else {
            JobStatus::Ready
        };
        Self {
            job_id: message.job_id.clone(),
            tenant_id: tenant_id.into(),
            message,
            status,
            attempt_count: 0,
            seq,
            created_at: now,
            updated_at: now,
            last_error: None,
            last_worker: None,
            lease_token: None,
            lease_until: None,
            cancel_requested: false,
            error_chain: Vec::new(),
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match (&self.status, self.lease_until) {
            (JobStatus::Claimed { .. }, Some(until)) => until <= now,
            _ => false,
        }
    }

    pub fn start_claim(
        &mut self,
        worker: WorkerId,
        token: LeaseToken,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        if self.attempt_count == 0 {
            self.attempt_count = 1;
        }
        self.status = JobStatus::Claimed { lease_until };
        self.last_worker = Some(worker);
        self.lease_token = Some(token);
        self.lease_until = Some(lease_until);
        self.updated_at = now;
    }

    pub fn succeed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Succeeded { at: now };
        self.clear_lease(now);
    }

    pub fn die(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        let error = error.into();
        self.status = JobStatus::Dead { at: now };
        self.last_error = Some(error);
        self.clear_lease(now);
    }

    pub fn schedule_retry(&mut self, visible_at: DateTime<Utc>, count_attempt: bool, now: DateTime<Utc>) {
        self.status = JobStatus::Retrying { visible_at };
        if count_attempt {
            self.attempt_count += 1;
        }
        self.clear_lease(now);
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled { at: now };
        self.clear_lease(now);
    }

    fn clear_lease(&mut self, now: DateTime<Utc>) {
        self.lease_token = None;
        self.lease_until = None;
        self.updated_at = now;
    }
}

/// A job handed to a worker along with its lease.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub record: JobRecord,
    pub lease_token: LeaseToken,
    pub lease_until: DateTime<Utc>,
}

impl LeasedJob {
    pub fn job_id(&self) -> &JobId {
        &self.record.job_id
    }

    pub fn lease_valid(&self, now: DateTime<Utc>) -> bool {
        self.lease_until > now
    }
}

/// Snapshot of a job at the moment it died, plus remediation metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub record: JobRecord,
    pub original_queue: String,
    /// Stable hash of the normalized last error message, used to cluster
    /// failures into patterns.
    pub fingerprint: String,
    pub died_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    fn record() -> JobRecord {
        let message = JobMessage::new("send_email", "default", b"{}".to_vec())
            .with_priority(Priority::default());
        JobRecord::new("t1", message, 1, Utc::now())
    }

    #[test]
    fn fresh_record_is_ready() {
        let r = record();
        assert_eq!(r.status, JobStatus::Ready);
        assert_eq!(r.attempt_count, 0);
    }

    #[test]
    fn delayed_record_is_pending() {
        let now = Utc::now();
        let message = JobMessage::new("send_email", "default", b"{}".to_vec())
            .with_not_before(now + chrono::Duration::minutes(5));
        let r = JobRecord::new("t1", message, 1, now);
        assert_eq!(r.status, JobStatus::Pending);
    }

    #[test]
    fn first_claim_sets_attempt_one() {
        let mut r = record();
        let now = Utc::now();
        r.start_claim(WorkerId::new(), LeaseToken::new(), now + chrono::Duration::seconds(30), now);
        assert_eq!(r.attempt_count, 1);

        // Re-claim after a retry does not double-count the attempt.
        r.schedule_retry(now, true, now);
        assert_eq!(r.attempt_count, 2);
        r.start_claim(WorkerId::new(), LeaseToken::new(), now + chrono::Duration::seconds(30), now);
        assert_eq!(r.attempt_count, 2);
    }

    #[test]
    fn eligibility_honours_visible_at() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(60);
        let status = JobStatus::Retrying { visible_at: later };
        assert!(!status.is_eligible(now));
        assert!(status.is_eligible(later));
    }

    #[test]
    fn terminal_states() {
        let now = Utc::now();
        assert!(JobStatus::Succeeded { at: now }.is_terminal());
        assert!(JobStatus::Dead { at: now }.is_terminal());
        assert!(JobStatus::Cancelled { at: now }.is_terminal());
        assert!(!JobStatus::Ready.is_terminal());
    }

    #[test]
    fn state_filter_matches() {
        let now = Utc::now();
        assert!(JobState::Claimed.matches(&JobStatus::Claimed { lease_until: now }));
        assert!(!JobState::Ready.matches(&JobStatus::Pending));
    }
}
