//! Typed environment configuration.
//!
//! The platform is configured through environment variables so the same
//! binary runs unchanged across environments. Parsing goes through a
//! lookup closure so tests can inject values without touching the process
//! environment.

use crate::errors::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct HoistConfig {
    /// Backing store connection string. `memory://` selects the in-process
    /// backend; `redis://…` the Redis backend.
    pub backing_store_url: String,
    pub kms_endpoint: Option<String>,
    pub kms_region: Option<String>,
    pub listen_addr: String,
    pub log_level: String,
    /// Single-tenant mode: requests without a tenant resolve to this one.
    pub default_tenant: Option<String>,
    pub worker_concurrency: usize,
    pub lease_ms: u64,
    pub poll_timeout_ms: u64,
    pub scheduler_tick_ms: u64,
    /// Audit retention in days.
    pub audit_retention_days: u32,
}

impl Default for HoistConfig {
    fn default() -> Self {
        Self {
            backing_store_url: "memory://".to_string(),
            kms_endpoint: None,
            kms_region: None,
            listen_addr: "127.0.0.1:8080".to_string(),
            log_level: "info".to_string(),
            default_tenant: None,
            worker_concurrency: 4,
            lease_ms: 30_000,
            poll_timeout_ms: 5_000,
            scheduler_tick_ms: 250,
            audit_retention_days: 730,
        }
    }
}

impl HoistConfig {
    pub fn from_env() -> CoreResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CoreResult<Self> {
        let mut cfg = Self::default();

        if let Some(v) = lookup("BACKING_STORE_URL") {
            cfg.backing_store_url = v;
        }
        cfg.kms_endpoint = lookup("KMS_ENDPOINT");
        cfg.kms_region = lookup("KMS_REGION");
        if let Some(v) = lookup("LISTEN_ADDR") {
            cfg.listen_addr = v;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            match v.as_str() {
                "debug" | "info" | "warn" | "error" => cfg.log_level = v,
                other => {
                    return Err(CoreError::validation(format!(
                        "LOG_LEVEL must be one of debug/info/warn/error, got {other:?}"
                    ))
                    .into_anyhow())
                }
            }
        }
        cfg.default_tenant = lookup("DEFAULT_TENANT").filter(|v| !v.is_empty());
        if let Some(v) = lookup("WORKER_CONCURRENCY") {
            cfg.worker_concurrency = parse(&v, "WORKER_CONCURRENCY")?;
        }
        if let Some(v) = lookup("LEASE_MS") {
            cfg.lease_ms = parse(&v, "LEASE_MS")?;
        }
        if let Some(v) = lookup("POLL_TIMEOUT_MS") {
            cfg.poll_timeout_ms = parse(&v, "POLL_TIMEOUT_MS")?;
        }
        if let Some(v) = lookup("SCHEDULER_TICK_MS") {
            cfg.scheduler_tick_ms = parse(&v, "SCHEDULER_TICK_MS")?;
        }
        if let Some(v) = lookup("AUDIT_RETENTION") {
            cfg.audit_retention_days = parse(&v, "AUDIT_RETENTION")?;
        }

        if cfg.scheduler_tick_ms == 0 {
            return Err(CoreError::validation("SCHEDULER_TICK_MS must be positive").into_anyhow());
        }
        if cfg.lease_ms == 0 {
            return Err(CoreError::validation("LEASE_MS must be positive").into_anyhow());
        }

        Ok(cfg)
    }

    pub fn uses_memory_store(&self) -> bool {
        self.backing_store_url.starts_with("memory://")
    }

    pub fn uses_redis_store(&self) -> bool {
        self.backing_store_url.starts_with("redis://")
            || self.backing_store_url.starts_with("rediss://")
    }
}

fn parse<T: std::str::FromStr>(value: &str, key: &str) -> CoreResult<T> {
    value
        .parse::<T>()
        .map_err(|_| CoreError::validation(format!("{key} is not a valid number: {value:?}")).into_anyhow())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let cfg = HoistConfig::from_lookup(|_| None).unwrap();
        assert!(cfg.uses_memory_store());
        assert_eq!(cfg.scheduler_tick_ms, 250);
        assert_eq!(cfg.audit_retention_days, 730);
    }

    #[test]
    fn reads_overrides() {
        let cfg = HoistConfig::from_lookup(lookup_from(&[
            ("BACKING_STORE_URL", "redis://localhost:6379/0"),
            ("LEASE_MS", "60000"),
            ("DEFAULT_TENANT", "acme"),
            ("LOG_LEVEL", "debug"),
        ]))
        .unwrap();
        assert!(cfg.uses_redis_store());
        assert_eq!(cfg.lease_ms, 60_000);
        assert_eq!(cfg.default_tenant.as_deref(), Some("acme"));
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn rejects_bad_values() {
        assert!(HoistConfig::from_lookup(lookup_from(&[("LEASE_MS", "soon")])).is_err());
        assert!(HoistConfig::from_lookup(lookup_from(&[("LOG_LEVEL", "loud")])).is_err());
        assert!(HoistConfig::from_lookup(lookup_from(&[("SCHEDULER_TICK_MS", "0")])).is_err());
    }
}
