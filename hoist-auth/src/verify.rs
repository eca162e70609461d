//! Token validation pipeline.
//!
//! Fail-fast order: signature by `kid`, timing window (±60 s skew),
//! revocation by `jti`. Only then do claims reach the request context.

use std::collections::HashSet;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{decode, decode_header, Validation};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::claims::Claims;
use crate::error::{AuthError, AuthResult};
use crate::keyring::Keyring;

/// Clock skew tolerance on `nbf`/`exp`, seconds.
const LEEWAY_SECS: u64 = 60;

/// Signed confirmation window for elevated operations, seconds.
const CONFIRMATION_WINDOW_SECS: i64 = 300;

/// Body of a signed step-up confirmation.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfirmationClaims {
    /// Operation being confirmed, e.g. `purge:payments`.
    pub operation_id: String,
    pub iat: i64,
    pub exp: i64,
}

impl ConfirmationClaims {
    pub fn new(operation_id: impl Into<String>) -> Self {
        let now = Utc::now().timestamp();
        Self {
            operation_id: operation_id.into(),
            iat: now,
            exp: now + CONFIRMATION_WINDOW_SECS,
        }
    }
}

pub struct Verifier {
    keyring: Keyring,
    revoked: RwLock<HashSet<String>>,
}

impl Verifier {
    pub fn new(keyring: Keyring) -> Self {
        Self {
            keyring,
            revoked: RwLock::new(HashSet::new()),
        }
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    pub fn revoke(&self, jti: impl Into<String>) {
        self.revoked.write().insert(jti.into());
    }

    pub fn is_revoked(&self, jti: &str) -> bool {
        self.revoked.read().contains(jti)
    }

    pub fn verify(&self, token: &str) -> AuthResult<Claims> {
        let header = decode_header(token)
            .map_err(|e| AuthError::InvalidToken(format!("malformed token: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidToken("token has no key id".into()))?;
        let (alg, key) = self
            .keyring
            .verifying_key(&kid)
            .ok_or_else(|| AuthError::UnknownKeyId(kid.clone()))?;

        let mut validation = Validation::new(*alg);
        validation.leeway = LEEWAY_SECS;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "nbf"]);

        let data = decode::<Claims>(token, key, &validation).map_err(|e| match e.kind() {
            JwtErrorKind::ExpiredSignature => AuthError::Expired,
            JwtErrorKind::ImmatureSignature => AuthError::NotYetValid,
            other => AuthError::InvalidToken(format!("{other:?}")),
        })?;

        if self.is_revoked(&data.claims.jti) {
            return Err(AuthError::Revoked);
        }
        Ok(data.claims)
    }

    /// Verify a signed step-up confirmation for the given operation.
    pub fn verify_confirmation(&self, token: &str, operation_id: &str) -> AuthResult<()> {
        let header = decode_header(token)
            .map_err(|e| AuthError::InvalidToken(format!("malformed confirmation: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidToken("confirmation has no key id".into()))?;
        let (alg, key) = self
            .keyring
            .verifying_key(&kid)
            .ok_or_else(|| AuthError::UnknownKeyId(kid))?;

        let mut validation = Validation::new(*alg);
        validation.leeway = LEEWAY_SECS;
        validation.set_required_spec_claims(&["exp"]);

        let data = decode::<ConfirmationClaims>(token, key, &validation)
            .map_err(|_| AuthError::StepUpRequired("confirmation invalid or expired".into()))?;
        if data.claims.operation_id != operation_id {
            return Err(AuthError::StepUpRequired(format!(
                "confirmation is for {:?}, not {operation_id:?}",
                data.claims.operation_id
            )));
        }
        let age = Utc::now().timestamp() - data.claims.iat;
        if age > CONFIRMATION_WINDOW_SECS {
            return Err(AuthError::StepUpRequired("confirmation too old".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> Verifier {
        let mut keyring = Keyring::new();
        keyring.add_hmac("k1", b"test-secret");
        Verifier::new(keyring)
    }

    #[test]
    fn verifies_valid_token() {
        let v = verifier();
        let claims = Claims::new("svc").with_tenant("t1").with_scope("queues:enqueue");
        let token = v.keyring().sign("k1", &claims).unwrap();
        let back = v.verify(&token).unwrap();
        assert_eq!(back.sub, "svc");
        assert_eq!(back.tenant.as_deref(), Some("t1"));
    }

    #[test]
    fn rejects_wrong_signature() {
        let v = verifier();
        let mut other = Keyring::new();
        other.add_hmac("k1", b"different-secret");
        let token = other.sign("k1", &Claims::new("svc")).unwrap();
        assert!(matches!(v.verify(&token), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn rejects_unknown_kid() {
        let v = verifier();
        let mut other = Keyring::new();
        other.add_hmac("k2", b"test-secret");
        let token = other.sign("k2", &Claims::new("svc")).unwrap();
        assert!(matches!(v.verify(&token), Err(AuthError::UnknownKeyId(_))));
    }

    #[test]
    fn rejects_expired_beyond_leeway() {
        let v = verifier();
        let mut claims = Claims::new("svc");
        claims.exp = Utc::now().timestamp() - 120;
        let token = v.keyring().sign("k1", &claims).unwrap();
        assert!(matches!(v.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn tolerates_skew_within_leeway() {
        let v = verifier();
        let mut claims = Claims::new("svc");
        claims.nbf = Utc::now().timestamp() + 30; // within the 60s leeway
        let token = v.keyring().sign("k1", &claims).unwrap();
        assert!(v.verify(&token).is_ok());
    }

    #[test]
    fn rejects_not_yet_valid() {
        let v = verifier();
        let mut claims = Claims::new("svc");
        claims.nbf = Utc::now().timestamp() + 600;
        let token = v.keyring().sign("k1", &claims).unwrap();
        assert!(matches!(v.verify(&token), Err(AuthError::NotYetValid)));
    }

    #[test]
    fn revocation_wins_over_valid_signature() {
        let v = verifier();
        let claims = Claims::new("svc");
        let jti = claims.jti.clone();
        let token = v.keyring().sign("k1", &claims).unwrap();
        assert!(v.verify(&token).is_ok());

        v.revoke(jti);
        assert!(matches!(v.verify(&token), Err(AuthError::Revoked)));
    }

    #[test]
    fn confirmation_binds_operation_and_window() {
        let v = verifier();
        let token = v
            .keyring()
            .sign("k1", &ConfirmationClaims::new("purge:payments"))
            .unwrap();
        assert!(v.verify_confirmation(&token, "purge:payments").is_ok());
        assert!(matches!(
            v.verify_confirmation(&token, "purge:other"),
            Err(AuthError::StepUpRequired(_))
        ));
    }
}
