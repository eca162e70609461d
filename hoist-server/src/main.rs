//! Hoist server binary: wires configuration, backing store, lifecycle
//! engine, scheduler, KMS, auth and the HTTP facade together.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hoist_auth::{Keyring, MemoryAuditLog, Verifier};
use hoist_axum::ApiState;
use hoist_core::{EnvelopeCodec, HoistConfig, LocalKms};
use hoist_queue::admin::AdminPlane;
use hoist_queue::backend::QueueBackend;
use hoist_queue::engine::LifecycleEngine;
use hoist_queue::scheduler::{Scheduler, SchedulerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = HoistConfig::from_env().context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();
    info!(store = %config.backing_store_url, "starting hoist server");

    let backend = build_backend(&config).await?;
    let kms = Arc::new(LocalKms::new());
    let codec = EnvelopeCodec::new().with_kms(kms.clone());
    let engine = Arc::new(LifecycleEngine::new(backend).with_codec(codec));
    let admin = Arc::new(AdminPlane::new(engine.clone()).with_kms(kms));

    let scheduler = Scheduler::new(engine.clone()).with_config(SchedulerConfig {
        tick: Duration::from_millis(config.scheduler_tick_ms),
        ..SchedulerConfig::default()
    });
    let scheduler_handle = scheduler.spawn();

    let audit = Arc::new(MemoryAuditLog::new().with_retention_days(config.audit_retention_days));
    let mut state = ApiState::new(admin).with_audit(audit);
    if let Some(tenant) = &config.default_tenant {
        state = state.with_default_tenant(tenant.clone());
    }
    if let Ok(secret) = std::env::var("AUTH_HMAC_SECRET") {
        let kid = std::env::var("AUTH_HMAC_KID").unwrap_or_else(|_| "default".to_string());
        let mut keyring = Keyring::new();
        keyring.add_hmac(kid, secret.as_bytes());
        state = state.with_verifier(Arc::new(Verifier::new(keyring)));
        info!("token verification enabled");
    } else {
        info!("no AUTH_HMAC_SECRET set, running in open development mode");
    }

    let result = hoist_axum::serve(state, config.listen_addr.as_str()).await;
    scheduler_handle.shutdown().await;
    result
}

async fn build_backend(config: &HoistConfig) -> anyhow::Result<Arc<dyn QueueBackend>> {
    if config.uses_redis_store() {
        #[cfg(feature = "redis")]
        {
            let backend = hoist_queue::backend::redis::RedisBackend::connect(
                &config.backing_store_url,
            )
            .await
            .context("connecting to redis")?;
            return Ok(Arc::new(backend));
        }
        #[cfg(not(feature = "redis"))]
        anyhow::bail!(
            "BACKING_STORE_URL points at redis but this binary was built without the `redis` feature"
        );
    }
    if !config.uses_memory_store() {
        anyhow::bail!("unsupported BACKING_STORE_URL: {}", config.backing_store_url);
    }
    Ok(Arc::new(hoist_queue::backend::memory::MemoryBackend::new()))
}
