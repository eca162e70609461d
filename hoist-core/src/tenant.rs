//! Tenant model: identity, status, quotas and rate limits.
//!
//! Tenants are the isolation unit. Every persisted key lives under exactly
//! one tenant prefix (see [`crate::keyspace`]), and every quota decision is
//! taken against the tenant record defined here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{CoreError, CoreResult};

/// Tenant ids reserved for the platform itself.
pub const RESERVED_TENANT_IDS: &[&str] = &["system", "admin", "default"];

/// Validate a tenant id against `^[a-z0-9][a-z0-9-]{0,30}[a-z0-9]$`.
///
/// Reserved ids are rejected for tenant creation but accepted by
/// [`validate_tenant_id`] itself; callers that create tenants check
/// [`RESERVED_TENANT_IDS`] separately.
pub fn validate_tenant_id(id: &str) -> CoreResult<()> {
    let bytes = id.as_bytes();
    let ok_len = (2..=32).contains(&bytes.len());
    let ok_edge = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let ok_inner = |b: u8| ok_edge(b) || b == b'-';
    let valid = ok_len
        && ok_edge(bytes[0])
        && ok_edge(bytes[bytes.len() - 1])
        && bytes.iter().all(|&b| ok_inner(b));
    if valid {
        Ok(())
    } else {
        Err(CoreError::validation(format!("invalid tenant id: {id:?}")).into_anyhow())
    }
}

/// Validate a queue name against `^[a-z0-9][a-z0-9._-]{0,63}$`.
pub fn validate_queue_name(name: &str) -> CoreResult<()> {
    let bytes = name.as_bytes();
    let ok_first = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let ok_rest = |b: u8| ok_first(b) || b == b'.' || b == b'_' || b == b'-';
    let valid = !bytes.is_empty()
        && bytes.len() <= 64
        && ok_first(bytes[0])
        && bytes[1..].iter().all(|&b| ok_rest(b));
    if valid {
        Ok(())
    } else {
        Err(CoreError::validation(format!("invalid queue name: {name:?}")).into_anyhow())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
}

/// Absolute and windowed limits for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantQuotas {
    pub max_jobs_per_hour: u64,
    pub max_jobs_per_day: u64,
    /// Cap on ready + delayed + in-flight jobs across the tenant.
    pub max_backlog: u64,
    pub max_payload_bytes: usize,
    pub max_queues: u32,
    pub max_workers_per_queue: u32,
    pub max_storage_bytes: u64,
}

impl Default for TenantQuotas {
    fn default() -> Self {
        Self {
            max_jobs_per_hour: 100_000,
            max_jobs_per_day: 1_000_000,
            max_backlog: 250_000,
            max_payload_bytes: 1024 * 1024,
            max_queues: 128,
            max_workers_per_queue: 64,
            max_storage_bytes: 4 * 1024 * 1024 * 1024,
        }
    }
}

/// Token-bucket parameters. `rps == 0` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RatePolicy {
    pub rps: u32,
    pub burst: u32,
}

impl RatePolicy {
    pub fn new(rps: u32, burst: u32) -> Self {
        Self { rps, burst }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rps == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TenantRateLimits {
    pub enqueue: RatePolicy,
    pub dequeue: RatePolicy,
}

/// Envelope-encryption settings for a tenant. Presence of this config
/// makes payload encryption mandatory for the tenant's jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Current key-encryption-key id registered with the KMS.
    pub kek_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: String,
    pub status: TenantStatus,
    pub encryption: Option<EncryptionConfig>,
    pub quotas: TenantQuotas,
    pub rate_limits: TenantRateLimits,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantRecord {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: TenantStatus::Active,
            encryption: None,
            quotas: TenantQuotas::default(),
            rate_limits: TenantRateLimits::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_quotas(mut self, quotas: TenantQuotas) -> Self {
        self.quotas = quotas;
        self
    }

    pub fn with_rate_limits(mut self, limits: TenantRateLimits) -> Self {
        self.rate_limits = limits;
        self
    }

    pub fn with_encryption(mut self, kek_id: impl Into<String>) -> Self {
        self.encryption = Some(EncryptionConfig { kek_id: kek_id.into() });
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_pattern() {
        assert!(validate_tenant_id("acme").is_ok());
        assert!(validate_tenant_id("acme-eu-1").is_ok());
        assert!(validate_tenant_id("t1").is_ok());

        assert!(validate_tenant_id("a").is_err()); // too short
        assert!(validate_tenant_id("-acme").is_err()); // bad edge
        assert!(validate_tenant_id("acme-").is_err());
        assert!(validate_tenant_id("Acme").is_err()); // uppercase
        assert!(validate_tenant_id("a".repeat(40).as_str()).is_err());
    }

    #[test]
    fn queue_name_pattern() {
        assert!(validate_queue_name("payments").is_ok());
        assert!(validate_queue_name("payments.retries_v2-eu").is_ok());
        assert!(validate_queue_name("q").is_ok());

        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name(".hidden").is_err());
        assert!(validate_queue_name("Payments").is_err());
        assert!(validate_queue_name(&"q".repeat(65)).is_err());
    }

    #[test]
    fn reserved_ids_match_the_pattern() {
        // Reservation is a separate check on top of the pattern.
        for id in RESERVED_TENANT_IDS {
            assert!(validate_tenant_id(id).is_ok());
        }
    }
}
