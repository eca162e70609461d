use serde::{Deserialize, Serialize};

/// Multi-tenant context for queue operations.
///
/// Every storage and engine call is made under a `QueueCtx`; tenant
/// isolation is part of the API contract, not manual key prefixing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueCtx {
    pub tenant_id: String,

    /// Distributed trace correlation.
    pub trace_id: Option<String>,

    /// Request correlation for admin operations.
    pub request_id: Option<String>,
}

impl QueueCtx {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            trace_id: None,
            request_id: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}
