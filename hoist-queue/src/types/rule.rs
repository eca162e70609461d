use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Priority, RetryPolicy, RuleId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Active,
    Paused,
    Disabled,
    /// No future fire time exists for the cron expression.
    Expired,
}

/// Options controlling how a rule materializes jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOptions {
    /// Cap on simultaneously in-flight jobs materialized from this rule;
    /// exceeded fires are deferred to the next tick.
    pub max_concurrent: Option<u32>,

    /// Random spread (0–3600 s) added to each materialized job's
    /// visibility, to avoid thundering herds.
    pub jitter_seconds: u32,

    /// Retry policy for materialized jobs; the queue default applies when
    /// absent.
    pub retry: Option<RetryPolicy>,

    /// Whether missed fires (scheduler downtime) are materialized on
    /// recovery or skipped.
    pub catchup: bool,

    /// Days to retain per-fire materialization guards.
    pub max_history_days: u32,
}

impl Default for RuleOptions {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            jitter_seconds: 0,
            retry: None,
            catchup: false,
            max_history_days: 7,
        }
    }
}

impl RuleOptions {
    pub fn validate(&self) -> Result<(), String> {
        if self.jitter_seconds > 3_600 {
            return Err("jitter_seconds must be at most 3600".into());
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }
}

/// Template for materializing jobs on a cron schedule.
///
/// Updates bump `version`; prior versions are retained for audit by the
/// admin plane rather than mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringRule {
    pub id: RuleId,
    pub tenant_id: String,
    pub name: String,
    pub cron: String,
    pub timezone: String,
    pub queue: String,
    pub job_type: String,
    /// JSON payload template for materialized jobs.
    pub payload_template: serde_json::Value,
    pub priority: Priority,
    pub options: RuleOptions,
    pub status: RuleStatus,
    pub version: u32,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringRule {
    pub fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }
}
