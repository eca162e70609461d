//! Envelope encryption primitives.
//!
//! Tenant payloads are sealed with a fresh data-encryption key (DEK) per
//! job; the DEK is wrapped by the tenant's key-encryption key (KEK) held
//! behind the [`Kms`] abstraction. Only the wrapped DEK is ever persisted.
//!
//! Failure classes follow the platform taxonomy: `kms_unavailable` is
//! retryable, `kek_not_found` is fatal to enqueue, and a failed AEAD open
//! surfaces as `bad_envelope`.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{CoreError, CoreResult};

pub const DEK_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Reference to a tenant's current key-encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KekHandle {
    pub tenant_id: String,
    pub key_id: String,
}

/// Key-management seam. Real deployments back this with an external KMS;
/// tests and single-node deployments use [`LocalKms`].
#[async_trait]
pub trait Kms: Send + Sync {
    /// Resolve the tenant's current KEK.
    async fn get_kek(&self, tenant_id: &str) -> CoreResult<KekHandle>;

    /// Wrap key material under the given KEK.
    async fn wrap(&self, kek: &KekHandle, plaintext: &[u8]) -> CoreResult<Vec<u8>>;

    /// Unwrap previously wrapped key material. Must keep succeeding for
    /// wraps made under rotated-out KEKs during the overlap window.
    async fn unwrap_key(&self, kek: &KekHandle, wrapped: &[u8]) -> CoreResult<Vec<u8>>;

    /// Register a fresh KEK for the tenant; older KEKs stay resolvable for
    /// unwrap until re-encryption completes.
    async fn rotate(&self, tenant_id: &str) -> CoreResult<KekHandle>;
}

/// In-process KMS holding per-tenant KEK chains.
#[derive(Default)]
pub struct LocalKms {
    // tenant -> KEK epochs, oldest first; the last entry is current.
    keys: RwLock<HashMap<String, Vec<(String, [u8; DEK_LEN])>>>,
}

impl LocalKms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision the first KEK for a tenant. Idempotent: if one exists,
    /// the current handle is returned.
    pub fn register(&self, tenant_id: &str) -> KekHandle {
        let mut keys = self.keys.write();
        let chain = keys.entry(tenant_id.to_string()).or_default();
        if chain.is_empty() {
            chain.push((format!("kek-{}", Uuid::new_v4()), random_key()));
        }
        let (key_id, _) = chain.last().cloned().unwrap_or_default();
        KekHandle {
            tenant_id: tenant_id.to_string(),
            key_id,
        }
    }

    fn key_material(&self, tenant_id: &str, key_id: &str) -> Option<[u8; DEK_LEN]> {
        self.keys
            .read()
            .get(tenant_id)?
            .iter()
            .find(|(id, _)| id == key_id)
            .map(|(_, k)| *k)
    }
}

#[async_trait]
impl Kms for LocalKms {
    async fn get_kek(&self, tenant_id: &str) -> CoreResult<KekHandle> {
        let keys = self.keys.read();
        let chain = keys
            .get(tenant_id)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                CoreError::kek_not_found(format!("no KEK registered for tenant {tenant_id}"))
                    .into_anyhow()
            })?;
        let (key_id, _) = &chain[chain.len() - 1];
        Ok(KekHandle {
            tenant_id: tenant_id.to_string(),
            key_id: key_id.clone(),
        })
    }

    async fn wrap(&self, kek: &KekHandle, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        let key = self.key_material(&kek.tenant_id, &kek.key_id).ok_or_else(|| {
            CoreError::kek_not_found(format!("unknown KEK {}", kek.key_id)).into_anyhow()
        })?;
        let (nonce, ct) = seal(&key, plaintext, kek.tenant_id.as_bytes())?;

        // key_id is framed into the wrapped blob so unwrap can pick the
        // right KEK epoch after a rotation.
        let id_bytes = kek.key_id.as_bytes();
        let mut out = Vec::with_capacity(1 + id_bytes.len() + NONCE_LEN + ct.len());
        out.push(id_bytes.len() as u8);
        out.extend_from_slice(id_bytes);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    async fn unwrap_key(&self, kek: &KekHandle, wrapped: &[u8]) -> CoreResult<Vec<u8>> {
        let (key_id, rest) = wrapped
            .split_first()
            .and_then(|(len, rest)| {
                let len = *len as usize;
                (rest.len() > len).then(|| {
                    let (id, rest) = rest.split_at(len);
                    (String::from_utf8_lossy(id).into_owned(), rest)
                })
            })
            .ok_or_else(|| CoreError::bad_envelope("truncated wrapped key").into_anyhow())?;
        if rest.len() <= NONCE_LEN {
            return Err(CoreError::bad_envelope("truncated wrapped key").into_anyhow());
        }
        let key = self.key_material(&kek.tenant_id, &key_id).ok_or_else(|| {
            CoreError::kek_not_found(format!("unknown KEK {key_id}")).into_anyhow()
        })?;
        let (nonce, ct) = rest.split_at(NONCE_LEN);
        open(&key, nonce, ct, kek.tenant_id.as_bytes())
    }

    async fn rotate(&self, tenant_id: &str) -> CoreResult<KekHandle> {
        let mut keys = self.keys.write();
        let chain = keys.entry(tenant_id.to_string()).or_default();
        let key_id = format!("kek-{}", Uuid::new_v4());
        chain.push((key_id.clone(), random_key()));
        Ok(KekHandle {
            tenant_id: tenant_id.to_string(),
            key_id,
        })
    }
}

pub fn random_key() -> [u8; DEK_LEN] {
    let mut key = [0u8; DEK_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// AES-256-GCM seal with a fresh random nonce.
pub fn seal(key: &[u8; DEK_LEN], plaintext: &[u8], aad: &[u8]) -> CoreResult<([u8; NONCE_LEN], Vec<u8>)> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = random_nonce();
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CoreError::internal("AEAD seal failed").into_anyhow())?;
    Ok((nonce, ct))
}

/// AES-256-GCM open; failure is a `bad_envelope`.
pub fn open(key: &[u8; DEK_LEN], nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> CoreResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CoreError::bad_envelope("decrypt_failed").into_anyhow())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[tokio::test]
    async fn wrap_unwrap_roundtrip() {
        let kms = LocalKms::new();
        let kek = kms.register("t1");

        let dek = random_key();
        let wrapped = kms.wrap(&kek, &dek).await.unwrap();
        let back = kms.unwrap_key(&kek, &wrapped).await.unwrap();
        assert_eq!(back, dek);
    }

    #[tokio::test]
    async fn unwrap_survives_rotation() {
        let kms = LocalKms::new();
        let old = kms.register("t1");
        let dek = random_key();
        let wrapped = kms.wrap(&old, &dek).await.unwrap();

        let new = kms.rotate("t1").await.unwrap();
        assert_ne!(old.key_id, new.key_id);
        assert_eq!(kms.get_kek("t1").await.unwrap().key_id, new.key_id);

        // Old wraps stay decryptable during the overlap window.
        let back = kms.unwrap_key(&new, &wrapped).await.unwrap();
        assert_eq!(back, dek);
    }

    #[tokio::test]
    async fn missing_kek_is_fatal() {
        let kms = LocalKms::new();
        let err = kms.get_kek("ghost").await.unwrap_err();
        assert_eq!(CoreError::from_anyhow(&err).unwrap().kind, ErrorKind::KekNotFound);
    }

    #[test]
    fn open_rejects_tampering() {
        let key = random_key();
        let (nonce, mut ct) = seal(&key, b"payload", b"aad").unwrap();
        ct[0] ^= 0xff;
        let err = open(&key, &nonce, &ct, b"aad").unwrap_err();
        assert_eq!(CoreError::from_anyhow(&err).unwrap().kind, ErrorKind::BadEnvelope);
    }

    #[test]
    fn open_binds_associated_data() {
        let key = random_key();
        let (nonce, ct) = seal(&key, b"payload", b"tenant-a").unwrap();
        assert!(open(&key, &nonce, &ct, b"tenant-b").is_err());
    }
}
