//! # Errors
//!
//! Hoist uses one transport-facing error taxonomy across the whole
//! platform. Core goals:
//! - a stable machine code (`code`) and HTTP status per kind
//! - can be carried through `anyhow::Error` (storage and engine layers
//!   attach context freely)
//! - transport-agnostic: the HTTP crate decides how to serialize
//!
//! Lower layers may use their own `thiserror` enums; they normalize into
//! [`CoreError`] at the control-plane boundary.

use std::fmt;

use anyhow::Error as AnyError;

/// A convenience result type for fallible core APIs.
pub type CoreResult<T> = std::result::Result<T, AnyError>;

/// Error kinds with their wire codes and HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,       // 400
    Unauthorized,     // 401
    Forbidden,        // 403
    TenantMismatch,   // 403
    NotFound,         // 404
    Conflict,         // 409
    StaleCursor,      // 410
    PayloadTooLarge,  // 413
    BadEnvelope,      // 422
    QuotaExceeded,    // 429
    QueueFull,        // 429
    StorageExceeded,  // 429
    Throttled,        // 429
    Internal,         // 500
    KekNotFound,      // 500
    KmsUnavailable,   // 503
    StoreUnavailable, // 503
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden | ErrorKind::TenantMismatch => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::StaleCursor => 410,
            ErrorKind::PayloadTooLarge => 413,
            ErrorKind::BadEnvelope => 422,
            ErrorKind::QuotaExceeded
            | ErrorKind::QueueFull
            | ErrorKind::StorageExceeded
            | ErrorKind::Throttled => 429,
            ErrorKind::Internal | ErrorKind::KekNotFound => 500,
            ErrorKind::KmsUnavailable | ErrorKind::StoreUnavailable => 503,
        }
    }

    /// Machine code carried in the wire error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::TenantMismatch => "tenant_mismatch",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::StaleCursor => "stale_cursor",
            ErrorKind::PayloadTooLarge => "payload_too_large",
            ErrorKind::BadEnvelope => "bad_envelope",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::StorageExceeded => "storage_exceeded",
            ErrorKind::Throttled => "throttled",
            ErrorKind::Internal => "internal",
            ErrorKind::KekNotFound => "kek_not_found",
            ErrorKind::KmsUnavailable => "kms_unavailable",
            ErrorKind::StoreUnavailable => "backing_store_unavailable",
        }
    }

    /// Whether callers may retry the failed operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Throttled | ErrorKind::KmsUnavailable | ErrorKind::StoreUnavailable
        )
    }
}

/// A structured Hoist error that can live inside `anyhow::Error`.
#[derive(Debug)]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    /// Structured detail payload (field errors, limits, references).
    pub details: Option<serde_json::Value>,
    pub source: Option<AnyError>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_source(mut self, source: AnyError) -> Self {
        self.source = Some(source);
        self
    }

    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Convert into `anyhow::Error` so it can cross layer boundaries.
    pub fn into_anyhow(self) -> AnyError {
        AnyError::new(self)
    }

    /// Downcast an `anyhow::Error` chain to a `CoreError` if one is inside.
    pub fn from_anyhow(err: &AnyError) -> Option<&CoreError> {
        err.chain().find_map(|e| e.downcast_ref::<CoreError>())
    }

    /// Turn any error into a `CoreError`: lossless when it already is one,
    /// otherwise wrapped as `internal`.
    pub fn normalize(err: AnyError) -> CoreError {
        match err.downcast::<CoreError>() {
            Ok(core) => core,
            Err(other) => {
                CoreError::new(ErrorKind::Internal, other.to_string()).with_source(other)
            }
        }
    }

    /// A client-safe copy: keeps kind/message/details, drops the source
    /// chain (stacks, connection strings).
    pub fn sanitize_for_client(&self) -> CoreError {
        let message = if self.kind == ErrorKind::Internal {
            "internal error".to_string()
        } else {
            self.message.clone()
        };
        CoreError {
            kind: self.kind,
            message,
            details: self.details.clone(),
            source: None,
        }
    }

    /// Wire error envelope body, without the request id (the HTTP layer
    /// owns that field).
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;

        let mut base = json!({
            "error": self.message,
            "code": self.code(),
        });
        if let Some(d) = &self.details {
            base["details"] = d.clone();
        }
        base
    }

    // ---- Constructors ----

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, msg)
    }
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, msg)
    }
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, msg)
    }
    pub fn tenant_mismatch(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::TenantMismatch, msg)
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, msg)
    }
    pub fn stale_cursor(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::StaleCursor, msg)
    }
    pub fn payload_too_large(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::PayloadTooLarge, msg)
    }
    pub fn bad_envelope(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadEnvelope, msg)
    }
    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::QuotaExceeded, msg)
    }
    pub fn queue_full(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueueFull, msg)
    }
    pub fn storage_exceeded(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::StorageExceeded, msg)
    }
    pub fn throttled(msg: impl Into<String>, retry_after_ms: u64) -> Self {
        Self::new(ErrorKind::Throttled, msg)
            .with_details(serde_json::json!({ "retry_after_ms": retry_after_ms }))
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }
    pub fn kek_not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::KekNotFound, msg)
    }
    pub fn kms_unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::KmsUnavailable, msg)
    }
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::StoreUnavailable, msg)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code(), self.status_code(), self.message)
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Convenience helper for "bail with CoreError".
#[macro_export]
macro_rules! bail_core {
    ($ctor:ident, $msg:expr) => {
        return Err($crate::errors::CoreError::$ctor($msg).into_anyhow());
    };
    ($ctor:ident, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::errors::CoreError::$ctor(format!($fmt, $($arg)*)).into_anyhow());
    };
}
