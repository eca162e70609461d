//! # hoist-core: shared foundation for the Hoist work-queue platform
//!
//! Hoist is a multi-tenant, Redis-backed job queue. This crate holds the
//! pieces every other Hoist crate builds on:
//!
//! - **Error taxonomy** ([`errors`]): one transport-facing error type with a
//!   stable machine code and HTTP status per kind, able to travel inside
//!   `anyhow::Error`.
//! - **Tenant model** ([`tenant`]): tenant ids, quotas, rate-limit policy.
//! - **Keyspace** ([`keyspace`]): the single owner of every storage key
//!   format. Raw keys never leak out of it.
//! - **Envelope** ([`envelope`]): the versioned binary representation of a
//!   job, with a deterministic CBOR header, optional zstd compression and
//!   AES-256-GCM envelope encryption.
//! - **KMS abstraction** ([`crypto`]): per-tenant key-encryption keys with
//!   rotation, plus an in-process implementation for tests and single-node
//!   deployments.
//! - **Configuration** ([`config`]): typed environment configuration.

pub mod config;
pub mod crypto;
pub mod envelope;
pub mod errors;
pub mod keyspace;
pub mod tenant;

pub use config::HoistConfig;
pub use crypto::{Kms, KekHandle, LocalKms};
pub use envelope::{Envelope, EnvelopeCodec, EnvelopeHeader, RetrySnapshot};
pub use errors::{CoreError, CoreResult, ErrorKind};
pub use keyspace::Keyspace;
pub use tenant::{
    validate_queue_name, validate_tenant_id, EncryptionConfig, TenantQuotas, TenantRateLimits,
    TenantRecord, TenantStatus,
};
