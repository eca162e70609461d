use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use hoist_auth::{AuditOutcome, AuditQuery, AuditSink};
use hoist_core::errors::CoreError;

use crate::error::ApiError;
use crate::extract::ReqCtx;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new().route("/audit", get(query))
}

#[derive(Deserialize)]
struct AuditParams {
    from: Option<DateTime<Utc>>,
    till: Option<DateTime<Utc>>,
    actor: Option<String>,
    action: Option<String>,
    resource: Option<String>,
    result: Option<String>,
    limit: Option<usize>,
}

async fn query(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Query(params): Query<AuditParams>,
) -> Result<Json<Value>, ApiError> {
    // Audit read access is gated by the dedicated scope; the operator
    // role does not imply it.
    ctx.authorize(&state, "admin:audit", "").await?;

    let result = params
        .result
        .as_deref()
        .map(|r| match r {
            "allowed" => Ok(AuditOutcome::Allowed),
            "denied" => Ok(AuditOutcome::Denied),
            "error" => Ok(AuditOutcome::Error),
            other => Err(CoreError::validation(format!("unknown result filter: {other}"))),
        })
        .transpose()?;

    let events = state
        .audit
        .query(&AuditQuery {
            from: params.from,
            till: params.till,
            actor: params.actor,
            action: params.action,
            resource: params.resource,
            result,
            limit: params.limit,
        })
        .await?;
    Ok(Json(json!({ "events": events })))
}
