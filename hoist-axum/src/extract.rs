//! Request context extraction: bearer token, tenant resolution, request
//! correlation.
//!
//! Tenant resolution order: the token's `tenant` claim is authoritative
//! when present; the `X-Tenant` header applies only for cross-tenant
//! tokens; the configured default tenant covers single-tenant mode. A
//! mismatch between claim and header is a 403.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde_json::Value;
use uuid::Uuid;

use hoist_auth::{authorize, AuditEntry, AuditOutcome, AuditSink, Claims};
use hoist_core::errors::CoreError;
use hoist_queue::types::QueueCtx;

use crate::error::ApiError;
use crate::state::ApiState;

pub struct ReqCtx {
    pub claims: Claims,
    pub tenant: QueueCtx,
    pub request_id: String,
}

impl ReqCtx {
    /// Authorization gate; denials are audited before surfacing.
    pub async fn authorize(
        &self,
        state: &ApiState,
        action: &str,
        resource: &str,
    ) -> Result<(), ApiError> {
        match authorize(&self.claims, action, resource) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = state
                    .audit
                    .record(
                        AuditEntry::new(&self.claims.sub, action, resource, AuditOutcome::Denied)
                            .with_request_id(&self.request_id),
                    )
                    .await;
                Err(e.into())
            }
        }
    }

    /// Record a state-changing action in the audit log.
    pub async fn audit(&self, state: &ApiState, action: &str, resource: &str, details: Value) {
        let _ = state
            .audit
            .record(
                AuditEntry::new(&self.claims.sub, action, resource, AuditOutcome::Allowed)
                    .with_details(details)
                    .with_request_id(&self.request_id),
            )
            .await;
    }

    /// Step-up gate for elevated operations: an `mfa` claim or a signed
    /// confirmation for this operation id.
    pub fn step_up(
        &self,
        state: &ApiState,
        operation_id: &str,
        confirmation: Option<&str>,
    ) -> Result<(), ApiError> {
        let confirmed = match (confirmation, &state.verifier) {
            (Some(token), Some(verifier)) => {
                verifier.verify_confirmation(token, operation_id).is_ok()
            }
            // Without a verifier (dev mode) a supplied confirmation is
            // taken at face value.
            (Some(_), None) => true,
            (None, _) => false,
        };
        hoist_auth::require_step_up(&self.claims, confirmed).map_err(ApiError::from)
    }
}

impl FromRequestParts<ApiState> for ReqCtx {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> Result<Self, Self::Rejection> {
        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let claims = match &state.verifier {
            Some(verifier) => {
                let token = bearer_token(parts).ok_or_else(|| {
                    ApiError::from(CoreError::unauthorized("missing bearer token"))
                })?;
                verifier.verify(&token)?
            }
            None => Claims::wildcard("anonymous"),
        };

        let header_tenant = parts
            .headers
            .get("x-tenant")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let tenant_id = match (&claims.tenant, header_tenant) {
            (Some(claim), Some(header)) if *claim != header => {
                return Err(CoreError::tenant_mismatch(format!(
                    "token is bound to tenant {claim:?}, request names {header:?}"
                ))
                .into());
            }
            (Some(claim), _) => claim.clone(),
            (None, Some(header)) => header,
            (None, None) => state.default_tenant.clone().ok_or_else(|| {
                ApiError::from(CoreError::validation(
                    "no tenant: provide X-Tenant or a tenant-bound token",
                ))
            })?,
        };

        let trace_id = parts
            .headers
            .get("x-trace-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let mut tenant = QueueCtx::new(tenant_id).with_request_id(request_id.clone());
        if let Some(trace_id) = trace_id {
            tenant = tenant.with_trace_id(trace_id);
        }

        Ok(ReqCtx {
            claims,
            tenant,
            request_id,
        })
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let header = parts.headers.get("authorization")?.to_str().ok()?.trim();
    let (scheme, token) = header.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}
