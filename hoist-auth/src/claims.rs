//! Token claims.
//!
//! Tokens are signed and self-contained: subject, optional tenant
//! binding (absent means cross-tenant access is allowed), roles, scopes
//! (explicit capabilities like `dlq:purge`), glob resource constraints,
//! standard timing claims, a key id in the header and a `jti` for
//! revocation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceConstraints {
    /// Glob patterns over queue names, e.g. `payment-*`. Empty means
    /// unconstrained.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queues: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,

    /// Tenant binding. Absent = cross-tenant allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,

    #[serde(default)]
    pub resources: ResourceConstraints,

    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,

    /// Step-up marker set at issue time; gates elevated operations.
    #[serde(default)]
    pub mfa: bool,
}

impl Claims {
    /// New claims valid from now for one hour; adjust with
    /// [`Claims::expires_in`].
    pub fn new(sub: impl Into<String>) -> Self {
        let now = Utc::now().timestamp();
        Self {
            sub: sub.into(),
            tenant: None,
            roles: Vec::new(),
            scopes: Vec::new(),
            resources: ResourceConstraints::default(),
            iat: now,
            nbf: now,
            exp: now + 3_600,
            jti: Uuid::new_v4().to_string(),
            mfa: false,
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    pub fn with_queues(mut self, patterns: Vec<String>) -> Self {
        self.resources.queues = patterns;
        self
    }

    pub fn with_mfa(mut self) -> Self {
        self.mfa = true;
        self
    }

    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.exp = self.iat + seconds;
        self
    }

    /// Full-access claims for single-tenant deployments running without
    /// a configured verifier.
    pub fn wildcard(sub: impl Into<String>) -> Self {
        Self::new(sub).with_role("admin").with_mfa()
    }

    pub fn allows_cross_tenant(&self) -> bool {
        self.tenant.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_claims_have_sane_window() {
        let claims = Claims::new("svc-1");
        assert!(claims.nbf <= claims.iat);
        assert!(claims.exp > claims.iat);
        assert!(!claims.jti.is_empty());
    }

    #[test]
    fn tenant_binding_controls_cross_tenant() {
        assert!(Claims::new("a").allows_cross_tenant());
        assert!(!Claims::new("a").with_tenant("t1").allows_cross_tenant());
    }

    #[test]
    fn serialization_skips_empty_fields() {
        let json = serde_json::to_value(Claims::new("a")).unwrap();
        assert!(json.get("tenant").is_none());
        assert!(json.get("roles").is_none());
    }
}
