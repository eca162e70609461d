//! Key registry: `kid` selects both algorithm and key material.

use std::collections::HashMap;

use jsonwebtoken::{encode, Algorithm, DecodingKey, EncodingKey, Header};
use serde::Serialize;

use crate::error::{AuthError, AuthResult};

pub struct Keyring {
    verifying: HashMap<String, (Algorithm, DecodingKey)>,
    signing: HashMap<String, (Algorithm, EncodingKey)>,
}

impl Keyring {
    pub fn new() -> Self {
        Self {
            verifying: HashMap::new(),
            signing: HashMap::new(),
        }
    }

    /// Register a shared HMAC-SHA256 secret for both signing and
    /// verification.
    pub fn add_hmac(&mut self, kid: impl Into<String>, secret: &[u8]) {
        let kid = kid.into();
        self.verifying.insert(
            kid.clone(),
            (Algorithm::HS256, DecodingKey::from_secret(secret)),
        );
        self.signing
            .insert(kid, (Algorithm::HS256, EncodingKey::from_secret(secret)));
    }

    /// Register an Ed25519 public key (PEM) for verification.
    pub fn add_ed25519_public(&mut self, kid: impl Into<String>, public_pem: &[u8]) -> AuthResult<()> {
        let key = DecodingKey::from_ed_pem(public_pem)
            .map_err(|e| AuthError::InvalidToken(format!("bad Ed25519 public key: {e}")))?;
        self.verifying.insert(kid.into(), (Algorithm::EdDSA, key));
        Ok(())
    }

    /// Register an Ed25519 private key (PEM) for signing.
    pub fn add_ed25519_private(
        &mut self,
        kid: impl Into<String>,
        private_pem: &[u8],
    ) -> AuthResult<()> {
        let key = EncodingKey::from_ed_pem(private_pem)
            .map_err(|e| AuthError::InvalidToken(format!("bad Ed25519 private key: {e}")))?;
        self.signing.insert(kid.into(), (Algorithm::EdDSA, key));
        Ok(())
    }

    pub fn verifying_key(&self, kid: &str) -> Option<&(Algorithm, DecodingKey)> {
        self.verifying.get(kid)
    }

    pub fn key_ids(&self) -> Vec<String> {
        self.verifying.keys().cloned().collect()
    }

    /// Sign a claims payload under the given key id.
    pub fn sign<T: Serialize>(&self, kid: &str, claims: &T) -> AuthResult<String> {
        let (alg, key) = self
            .signing
            .get(kid)
            .ok_or_else(|| AuthError::UnknownKeyId(kid.to_string()))?;
        let mut header = Header::new(*alg);
        header.kid = Some(kid.to_string());
        encode(&header, claims, key).map_err(|e| AuthError::Internal(format!("sign: {e}")))
    }
}

impl Default for Keyring {
    fn default() -> Self {
        Self::new()
    }
}
