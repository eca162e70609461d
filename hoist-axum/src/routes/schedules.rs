use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use hoist_core::errors::CoreError;
use hoist_queue::admin::Granularity;
use hoist_queue::types::JobId;

use crate::error::ApiError;
use crate::extract::ReqCtx;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/schedules/window", get(window))
        .route("/schedules/{job_id}/reschedule", post(reschedule))
}

#[derive(Deserialize)]
struct WindowParams {
    from: DateTime<Utc>,
    till: DateTime<Utc>,
    granularity: Option<String>,
}

async fn window(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Query(params): Query<WindowParams>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "schedules:read", "").await?;
    let granularity = params
        .granularity
        .as_deref()
        .unwrap_or("hour")
        .parse::<Granularity>()
        .map_err(CoreError::validation)?;
    let buckets = state
        .admin
        .schedule_window(&ctx.tenant, params.from, params.till, granularity)
        .await?;
    Ok(Json(json!({ "buckets": buckets })))
}

#[derive(Deserialize)]
struct RescheduleBody {
    new_time: DateTime<Utc>,
}

async fn reschedule(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Path(job_id): Path<String>,
    Json(body): Json<RescheduleBody>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "schedules:reschedule", "").await?;
    let job_id = JobId::from(job_id);
    state
        .admin
        .reschedule(&ctx.tenant, &job_id, body.new_time)
        .await?;
    ctx.audit(
        &state,
        "schedules:reschedule",
        job_id.as_str(),
        json!({"new_time": body.new_time}),
    )
    .await;
    Ok(Json(json!({"job_id": job_id, "new_time": body.new_time})))
}
