use thiserror::Error;

use hoist_core::errors::{CoreError, ErrorKind};

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure and lifecycle errors for queue operations.
///
/// Each variant maps to one transport-facing [`ErrorKind`], so the HTTP
/// layer never has to pattern-match storage internals.
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("rule not found: {0}")]
    RuleNotFound(String),

    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("invalid lease token")]
    InvalidLeaseToken,

    #[error("lease has expired")]
    LeaseExpired,

    #[error("job has been cancelled")]
    JobCancelled,

    #[error("job is already in a terminal state")]
    JobAlreadyTerminal,

    #[error("job cannot be rescheduled in its current state")]
    NotReschedulable,

    #[error("tenant is suspended: {0}")]
    TenantSuspended(String),

    #[error("queue is full: {0}")]
    QueueFull(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("storage quota exceeded: {0}")]
    StorageExceeded(String),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("throttled, retry after {retry_after_ms} ms")]
    Throttled { retry_after_ms: u64 },

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("cursor expired, restart the listing")]
    StaleCursor,

    #[error("bad envelope: {0}")]
    BadEnvelope(String),

    #[error("kms unavailable: {0}")]
    KmsUnavailable(String),

    #[error("kek not found: {0}")]
    KekNotFound(String),

    #[error("backing store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::JobNotFound(_)
            | Self::QueueNotFound(_)
            | Self::RuleNotFound(_)
            | Self::TenantNotFound(_)
            | Self::WorkerNotFound(_) => ErrorKind::NotFound,
            Self::InvalidLeaseToken
            | Self::LeaseExpired
            | Self::JobCancelled
            | Self::JobAlreadyTerminal
            | Self::NotReschedulable
            | Self::Conflict(_) => ErrorKind::Conflict,
            Self::TenantSuspended(_) => ErrorKind::Forbidden,
            Self::QueueFull(_) => ErrorKind::QueueFull,
            Self::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Self::StorageExceeded(_) => ErrorKind::StorageExceeded,
            Self::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            Self::Throttled { .. } => ErrorKind::Throttled,
            Self::Validation(_) => ErrorKind::Validation,
            Self::StaleCursor => ErrorKind::StaleCursor,
            Self::BadEnvelope(_) => ErrorKind::BadEnvelope,
            Self::KmsUnavailable(_) => ErrorKind::KmsUnavailable,
            Self::KekNotFound(_) => ErrorKind::KekNotFound,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Lossless normalization of a `hoist-core` error chain.
    pub fn from_core(err: anyhow::Error) -> Self {
        let core = CoreError::normalize(err);
        let message = core.message.clone();
        match core.kind {
            ErrorKind::Validation => Self::Validation(message),
            ErrorKind::BadEnvelope => Self::BadEnvelope(message),
            ErrorKind::NotFound => Self::JobNotFound(message),
            ErrorKind::Conflict => Self::Conflict(message),
            ErrorKind::StaleCursor => Self::StaleCursor,
            ErrorKind::QuotaExceeded => Self::QuotaExceeded(message),
            ErrorKind::QueueFull => Self::QueueFull(message),
            ErrorKind::StorageExceeded => Self::StorageExceeded(message),
            ErrorKind::PayloadTooLarge => Self::PayloadTooLarge { size: 0, max: 0 },
            ErrorKind::Throttled => Self::Throttled {
                retry_after_ms: core
                    .details
                    .as_ref()
                    .and_then(|d| d["retry_after_ms"].as_u64())
                    .unwrap_or(1_000),
            },
            ErrorKind::KmsUnavailable => Self::KmsUnavailable(message),
            ErrorKind::KekNotFound => Self::KekNotFound(message),
            ErrorKind::StoreUnavailable => Self::StoreUnavailable(message),
            _ => Self::Internal(message),
        }
    }

    /// Promote into the transport-facing error type.
    pub fn into_core(self) -> CoreError {
        let kind = self.kind();
        match self {
            Self::Throttled { retry_after_ms } => {
                CoreError::throttled("rate limited", retry_after_ms)
            }
            other => CoreError::new(kind, other.to_string()),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("invalid json: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_the_taxonomy() {
        assert_eq!(QueueError::StaleCursor.kind(), ErrorKind::StaleCursor);
        assert_eq!(
            QueueError::Throttled { retry_after_ms: 10 }.kind(),
            ErrorKind::Throttled
        );
        assert_eq!(QueueError::InvalidLeaseToken.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn from_core_preserves_kind() {
        let core = CoreError::bad_envelope("truncated").into_anyhow();
        assert!(matches!(QueueError::from_core(core), QueueError::BadEnvelope(_)));

        let core = CoreError::throttled("slow down", 250).into_anyhow();
        assert!(matches!(
            QueueError::from_core(core),
            QueueError::Throttled { retry_after_ms: 250 }
        ));
    }
}
