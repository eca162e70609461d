use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::WorkerId;

/// Registry entry for an active consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub tenant_id: String,
    pub queues: Vec<String>,
    pub concurrency: usize,
    pub last_heartbeat: DateTime<Utc>,
    /// Draining workers take no new claims and finish what they hold.
    pub draining: bool,
    pub version: Option<String>,
}

impl WorkerInfo {
    pub fn new(
        id: WorkerId,
        tenant_id: impl Into<String>,
        queues: Vec<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            id,
            tenant_id: tenant_id.into(),
            queues,
            concurrency,
            last_heartbeat: Utc::now(),
            draining: false,
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn heartbeat_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        self.last_heartbeat + ttl <= now
    }
}
