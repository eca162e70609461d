use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use hoist_auth::AuthError;
use hoist_core::errors::CoreError;
use hoist_queue::error::QueueError;

/// Transport error carrying the wire envelope. The request id is
/// stamped by middleware after the handler returns, so `?` conversions
/// stay ergonomic.
#[derive(Debug)]
pub struct ApiError(pub anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e.into_anyhow())
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        Self(e.into_core().into_anyhow())
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        Self(CoreError::new(e.kind(), e.to_string()).into_anyhow())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Preserve the structured error if one is in the chain,
        // otherwise wrap as internal.
        let core = match CoreError::from_anyhow(&self.0) {
            Some(core) => core.sanitize_for_client(),
            None => CoreError::normalize(self.0).sanitize_for_client(),
        };
        let status =
            StatusCode::from_u16(core.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = core.to_json();
        body["request_id"] = json!(null);
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_errors_keep_their_code() {
        let err: ApiError = QueueError::StaleCursor.into();
        let core = CoreError::from_anyhow(&err.0).unwrap();
        assert_eq!(core.code(), "stale_cursor");
        assert_eq!(core.status_code(), 410);
    }

    #[test]
    fn auth_errors_map_to_unauthorized() {
        let err: ApiError = AuthError::Expired.into();
        let core = CoreError::from_anyhow(&err.0).unwrap();
        assert_eq!(core.status_code(), 401);
    }

    #[test]
    fn opaque_errors_become_internal() {
        let err: ApiError = anyhow::anyhow!("lock poisoned").into();
        let core = CoreError::normalize(err.0);
        assert_eq!(core.kind, hoist_core::errors::ErrorKind::Internal);
        assert_eq!(core.sanitize_for_client().message, "internal error");
    }
}
