use std::sync::Arc;

use hoist_auth::{AuditSink, MemoryAuditLog, Verifier};
use hoist_queue::admin::AdminPlane;

#[derive(Clone)]
pub struct ApiState {
    pub admin: Arc<AdminPlane>,
    /// Absent in development mode: requests run with wildcard claims.
    pub verifier: Option<Arc<Verifier>>,
    pub audit: Arc<dyn AuditSink>,
    /// Single-tenant mode fallback when neither token nor header names
    /// a tenant.
    pub default_tenant: Option<String>,
}

impl ApiState {
    pub fn new(admin: Arc<AdminPlane>) -> Self {
        Self {
            admin,
            verifier: None,
            audit: Arc::new(MemoryAuditLog::new()),
            default_tenant: None,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_default_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.default_tenant = Some(tenant.into());
        self
    }
}
