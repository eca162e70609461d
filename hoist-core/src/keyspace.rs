//! Storage key derivation.
//!
//! Every key the platform persists is derived here. Backends and admin
//! code never format keys themselves, which keeps tenant isolation at
//! the key level checkable in one place.
//!
//! Layout:
//!
//! ```text
//! t:{tenant}:q:{queue}:ready      ready sequence (priority-respecting)
//! t:{tenant}:q:{queue}:inflight   claimed jobs with lease expiry
//! t:{tenant}:q:{queue}:delayed    jobs keyed by visible-at (epoch ms)
//! t:{tenant}:q:{queue}:dlq        dead jobs, append-only
//! t:{tenant}:q:{queue}:meta       queue config, paused flag, counters
//! t:{tenant}:job:{job_id}         job envelope + record state
//! t:{tenant}:idem:{key}           idempotency record (TTL)
//! t:{tenant}:rule:{rule_id}       recurring rule
//! t:{tenant}:rule:{id}:fired:{ts} materialization guard (TTL)
//! t:{tenant}:quotas:{window}      rolling counters
//! t:{tenant}:bucket:{q}:{dir}     rate-limit token buckets
//! t:{tenant}:workers              worker registry
//! system:tenants                  tenant registry
//! system:audit:{yyyy-mm}          audit partitions
//! system:schema_version           persisted layout version
//! ```

/// Derives namespaced storage keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct Keyspace;

impl Keyspace {
    pub fn ready(tenant: &str, queue: &str) -> String {
        format!("t:{tenant}:q:{queue}:ready")
    }

    pub fn inflight(tenant: &str, queue: &str) -> String {
        format!("t:{tenant}:q:{queue}:inflight")
    }

    pub fn delayed(tenant: &str, queue: &str) -> String {
        format!("t:{tenant}:q:{queue}:delayed")
    }

    pub fn dlq(tenant: &str, queue: &str) -> String {
        format!("t:{tenant}:q:{queue}:dlq")
    }

    pub fn queue_meta(tenant: &str, queue: &str) -> String {
        format!("t:{tenant}:q:{queue}:meta")
    }

    /// Capped history of archived (succeeded) jobs.
    pub fn archive(tenant: &str, queue: &str) -> String {
        format!("t:{tenant}:q:{queue}:archive")
    }

    /// All of a queue's jobs ordered by enqueue sequence; the listing
    /// and pagination index.
    pub fn jobs_index(tenant: &str, queue: &str) -> String {
        format!("t:{tenant}:q:{queue}:jobs")
    }

    pub fn job(tenant: &str, job_id: &str) -> String {
        format!("t:{tenant}:job:{job_id}")
    }

    pub fn job_errors(tenant: &str, job_id: &str) -> String {
        format!("t:{tenant}:job:{job_id}:errors")
    }

    pub fn idempotency(tenant: &str, key: &str) -> String {
        format!("t:{tenant}:idem:{key}")
    }

    pub fn rule(tenant: &str, rule_id: &str) -> String {
        format!("t:{tenant}:rule:{rule_id}")
    }

    pub fn rule_index(tenant: &str) -> String {
        format!("t:{tenant}:rules")
    }

    /// Materialization guard for one (rule, fire time) pair; `fire_ms` is
    /// the fire instant in epoch milliseconds.
    pub fn rule_fired(tenant: &str, rule_id: &str, fire_ms: i64) -> String {
        format!("t:{tenant}:rule:{rule_id}:fired:{fire_ms}")
    }

    /// Live (non-terminal) jobs materialized from a rule, for
    /// `max_concurrent` enforcement.
    pub fn rule_active(tenant: &str, rule_id: &str) -> String {
        format!("t:{tenant}:rule:{rule_id}:active")
    }

    pub fn quotas(tenant: &str, window: &str) -> String {
        format!("t:{tenant}:quotas:{window}")
    }

    pub fn rate_bucket(tenant: &str, queue: &str, direction: &str) -> String {
        format!("t:{tenant}:bucket:{queue}:{direction}")
    }

    pub fn workers(tenant: &str) -> String {
        format!("t:{tenant}:workers")
    }

    pub fn queue_index(tenant: &str) -> String {
        format!("t:{tenant}:queues")
    }

    pub fn tenants() -> String {
        "system:tenants".to_string()
    }

    /// Tenants seen by the storage layer, registered or implicit.
    pub fn active_tenants() -> String {
        "system:active_tenants".to_string()
    }

    /// Tenant-wide live-backlog counter (ready + delayed + in-flight).
    pub fn backlog(tenant: &str) -> String {
        format!("t:{tenant}:quotas:backlog")
    }

    /// Tenant-wide stored-payload byte counter.
    pub fn storage_bytes(tenant: &str) -> String {
        format!("t:{tenant}:quotas:storage")
    }

    pub fn audit(partition: &str) -> String {
        format!("system:audit:{partition}")
    }

    pub fn schema_version() -> String {
        "system:schema_version".to_string()
    }

    /// Pub/sub channel carrying job lifecycle events for one tenant.
    pub fn events_channel(tenant: &str) -> String {
        format!("hoist:events:{tenant}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_tenant_prefixed() {
        assert_eq!(Keyspace::ready("t1", "payments"), "t:t1:q:payments:ready");
        assert_eq!(Keyspace::job("t1", "j-42"), "t:t1:job:j-42");
        assert_eq!(Keyspace::idempotency("t1", "k"), "t:t1:idem:k");
        assert_eq!(Keyspace::rule_fired("t1", "r", 1700000000000), "t:t1:rule:r:fired:1700000000000");
    }

    #[test]
    fn system_keys_have_no_tenant() {
        assert_eq!(Keyspace::tenants(), "system:tenants");
        assert_eq!(Keyspace::audit("2026-08"), "system:audit:2026-08");
    }

    #[test]
    fn distinct_tenants_never_share_a_prefix() {
        let a = Keyspace::ready("alpha", "q");
        let b = Keyspace::ready("beta", "q");
        assert!(!a.starts_with(&b) && !b.starts_with(&a));
    }
}
