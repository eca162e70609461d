use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use hoist_queue::types::JobState;

use crate::error::ApiError;
use crate::extract::ReqCtx;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/queues", get(list))
        .route("/queues/{queue}/stats", get(stats))
        .route("/queues/{queue}/pause", post(pause))
        .route("/queues/{queue}/resume", post(resume))
        .route("/queues/{queue}/purge", post(purge))
}

async fn list(State(state): State<ApiState>, ctx: ReqCtx) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "queues:list", "").await?;
    let queues = state.admin.list_queues(&ctx.tenant).await?;
    Ok(Json(json!({ "queues": queues })))
}

async fn stats(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Path(queue): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "stats:read", &queue).await?;
    let stats = state.admin.queue_stats(&ctx.tenant, &queue).await?;
    Ok(Json(json!({
        "queue": queue,
        "ready": stats.ready,
        "delayed": stats.delayed,
        "in_flight": stats.in_flight,
        "dead": stats.dead,
        "succeeded": stats.succeeded,
        "cancelled": stats.cancelled,
        "enqueued_total": stats.enqueued_total,
        "backlog": stats.backlog(),
    })))
}

async fn pause(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Path(queue): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "queues:pause", &queue).await?;
    state.admin.pause_queue(&ctx.tenant, &queue).await?;
    ctx.audit(&state, "queues:pause", &queue, Value::Null).await;
    Ok(Json(json!({"queue": queue, "paused": true})))
}

async fn resume(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Path(queue): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "queues:resume", &queue).await?;
    state.admin.resume_queue(&ctx.tenant, &queue).await?;
    ctx.audit(&state, "queues:resume", &queue, Value::Null).await;
    Ok(Json(json!({"queue": queue, "paused": false})))
}

#[derive(Deserialize)]
struct PurgeBody {
    /// Explicit confirmation flag; destructive calls without it fail.
    #[serde(default)]
    confirm: bool,
    states: Option<Vec<String>>,
    /// Signed step-up confirmation for `purge:{queue}`.
    confirmation_token: Option<String>,
}

async fn purge(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Path(queue): Path<String>,
    Json(body): Json<PurgeBody>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "queues:purge", &queue).await?;
    ctx.step_up(
        &state,
        &format!("purge:{queue}"),
        body.confirmation_token.as_deref(),
    )?;

    let states = body
        .states
        .map(|raw| {
            raw.iter()
                .map(|s| {
                    s.parse::<JobState>().map_err(|e| {
                        ApiError::from(hoist_core::errors::CoreError::validation(e))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;

    let removed = state
        .admin
        .purge_queue(&ctx.tenant, &queue, states, body.confirm)
        .await?;
    ctx.audit(&state, "queues:purge", &queue, json!({"removed": removed}))
        .await;
    Ok(Json(json!({"queue": queue, "removed": removed})))
}
