use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use hoist_queue::error::QueueError;
use hoist_queue::types::WorkerId;

use crate::error::ApiError;
use crate::extract::ReqCtx;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/workers", get(list))
        .route("/workers/{worker_id}/drain", post(drain))
}

async fn list(State(state): State<ApiState>, ctx: ReqCtx) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "workers:list", "").await?;
    let workers = state.admin.list_workers(&ctx.tenant).await?;
    Ok(Json(json!({
        "workers": serde_json::to_value(workers).map_err(QueueError::from)?,
    })))
}

async fn drain(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Path(worker_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "workers:drain", "").await?;
    let worker_id = WorkerId::from(worker_id);
    state.admin.drain_worker(&ctx.tenant, &worker_id).await?;
    ctx.audit(&state, "workers:drain", worker_id.as_str(), Value::Null)
        .await;
    Ok(Json(json!({"worker_id": worker_id, "draining": true})))
}
