//! Append-only, hash-chained audit log.
//!
//! Every state-changing authenticated request and every denied request
//! produces one event. Each event stores the SHA-256 of the previous
//! event's canonical serialization; altering any past entry breaks the
//! chain from that point on, which [`AuditSink::verify_partition`]
//! detects.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Denied,
    Error,
}

/// What a caller submits; id, timestamps and chain hashes are assigned
/// by the sink.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub result: AuditOutcome,
    pub details: serde_json::Value,
    pub request_id: Option<String>,
}

impl AuditEntry {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        result: AuditOutcome,
    ) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            resource: resource.into(),
            result,
            details: serde_json::Value::Null,
            request_id: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub at: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub result: AuditOutcome,
    pub details: serde_json::Value,
    pub request_id: Option<String>,
    /// Hash of the previous event's canonical serialization.
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEvent {
    /// Canonical serialization the chain hash covers: everything except
    /// the hash itself, as JSON with sorted keys.
    fn canonical_body(&self) -> String {
        serde_json::json!({
            "id": self.id,
            "at": self.at.to_rfc3339(),
            "actor": self.actor,
            "action": self.action,
            "resource": self.resource,
            "result": self.result,
            "details": self.details,
            "request_id": self.request_id,
            "prev_hash": self.prev_hash,
        })
        .to_string()
    }

    fn compute_hash(&self) -> String {
        let digest = Sha256::digest(self.canonical_body().as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub from: Option<DateTime<Utc>>,
    pub till: Option<DateTime<Utc>>,
    pub actor: Option<String>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub result: Option<AuditOutcome>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> AuthResult<AuditEvent>;

    async fn query(&self, query: &AuditQuery) -> AuthResult<Vec<AuditEvent>>;

    /// Walk a monthly partition and check every chain link.
    async fn verify_partition(&self, partition: &str) -> AuthResult<bool>;
}

/// In-process audit log with monthly partitions.
pub struct MemoryAuditLog {
    partitions: RwLock<BTreeMap<String, Vec<AuditEvent>>>,
    last_hash: RwLock<String>,
    retention_days: i64,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(BTreeMap::new()),
            last_hash: RwLock::new("genesis".to_string()),
            retention_days: 730,
        }
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = i64::from(days);
        self
    }

    pub fn partitions(&self) -> Vec<String> {
        self.partitions.read().keys().cloned().collect()
    }

    fn prune(&self, now: DateTime<Utc>) {
        let cutoff = (now - Duration::days(self.retention_days)).format("%Y-%m").to_string();
        self.partitions.write().retain(|p, _| *p >= cutoff);
    }
}

impl Default for MemoryAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, entry: AuditEntry) -> AuthResult<AuditEvent> {
        let now = Utc::now();
        let mut last_hash = self.last_hash.write();
        let mut event = AuditEvent {
            id: Uuid::new_v4().to_string(),
            at: now,
            actor: entry.actor,
            action: entry.action,
            resource: entry.resource,
            result: entry.result,
            details: entry.details,
            request_id: entry.request_id,
            prev_hash: last_hash.clone(),
            hash: String::new(),
        };
        event.hash = event.compute_hash();
        *last_hash = event.hash.clone();

        let partition = now.format("%Y-%m").to_string();
        self.partitions
            .write()
            .entry(partition)
            .or_default()
            .push(event.clone());
        drop(last_hash);
        self.prune(now);
        Ok(event)
    }

    async fn query(&self, query: &AuditQuery) -> AuthResult<Vec<AuditEvent>> {
        let partitions = self.partitions.read();
        let mut out: Vec<AuditEvent> = partitions
            .values()
            .flatten()
            .filter(|e| query.from.map(|t| e.at >= t).unwrap_or(true))
            .filter(|e| query.till.map(|t| e.at < t).unwrap_or(true))
            .filter(|e| query.actor.as_ref().map(|a| &e.actor == a).unwrap_or(true))
            .filter(|e| query.action.as_ref().map(|a| &e.action == a).unwrap_or(true))
            .filter(|e| {
                query
                    .resource
                    .as_ref()
                    .map(|r| &e.resource == r)
                    .unwrap_or(true)
            })
            .filter(|e| query.result.map(|r| e.result == r).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.at);
        out.truncate(query.limit.unwrap_or(1_000));
        Ok(out)
    }

    async fn verify_partition(&self, partition: &str) -> AuthResult<bool> {
        let partitions = self.partitions.read();
        let events = partitions
            .get(partition)
            .ok_or_else(|| AuthError::Internal(format!("no audit partition {partition}")))?;
        let mut prev: Option<&str> = None;
        for event in events {
            if event.hash != event.compute_hash() {
                return Ok(false);
            }
            if let Some(prev_hash) = prev {
                if event.prev_hash != prev_hash {
                    return Ok(false);
                }
            }
            prev = Some(&event.hash);
        }
        Ok(true)
    }
}
