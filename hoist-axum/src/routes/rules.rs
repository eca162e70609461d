use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use hoist_queue::admin::RuleSpec;
use hoist_queue::error::QueueError;
use hoist_queue::types::RuleId;

use crate::error::ApiError;
use crate::extract::ReqCtx;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/schedules/rules", get(list).post(create))
        .route(
            "/schedules/rules/{rule_id}",
            get(fetch).put(update).delete(remove),
        )
        .route("/schedules/rules/{rule_id}/pause", post(pause))
        .route("/schedules/rules/{rule_id}/resume", post(resume))
}

async fn create(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Json(spec): Json<RuleSpec>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "schedules:create", &spec.queue).await?;
    let rule = state.admin.create_rule(&ctx.tenant, spec).await?;
    ctx.audit(
        &state,
        "schedules:create",
        rule.id.as_str(),
        json!({"name": rule.name, "cron": rule.cron}),
    )
    .await;
    Ok(Json(serde_json::to_value(rule).map_err(QueueError::from)?))
}

async fn list(State(state): State<ApiState>, ctx: ReqCtx) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "schedules:list", "").await?;
    let rules = state.admin.list_rules(&ctx.tenant).await?;
    Ok(Json(json!({ "rules": rules })))
}

async fn fetch(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Path(rule_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "schedules:read", "").await?;
    let rule = state
        .admin
        .get_rule(&ctx.tenant, &RuleId::from(rule_id))
        .await?;
    Ok(Json(serde_json::to_value(rule).map_err(QueueError::from)?))
}

async fn update(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Path(rule_id): Path<String>,
    Json(spec): Json<RuleSpec>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "schedules:update", &spec.queue).await?;
    let (before, after) = state
        .admin
        .update_rule(&ctx.tenant, &RuleId::from(rule_id), spec)
        .await?;
    // Prior versions are retained through the audit trail.
    ctx.audit(
        &state,
        "schedules:update",
        after.id.as_str(),
        json!({
            "before": serde_json::to_value(&before).map_err(QueueError::from)?,
            "after_version": after.version,
        }),
    )
    .await;
    Ok(Json(serde_json::to_value(after).map_err(QueueError::from)?))
}

async fn remove(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Path(rule_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "schedules:delete", "").await?;
    let rule_id = RuleId::from(rule_id);
    state.admin.delete_rule(&ctx.tenant, &rule_id).await?;
    ctx.audit(&state, "schedules:delete", rule_id.as_str(), Value::Null)
        .await;
    Ok(Json(json!({"rule_id": rule_id, "deleted": true})))
}

async fn pause(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Path(rule_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "schedules:update", "").await?;
    let rule = state
        .admin
        .pause_rule(&ctx.tenant, &RuleId::from(rule_id))
        .await?;
    ctx.audit(&state, "schedules:pause", rule.id.as_str(), Value::Null)
        .await;
    Ok(Json(serde_json::to_value(rule).map_err(QueueError::from)?))
}

async fn resume(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Path(rule_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "schedules:update", "").await?;
    let rule = state
        .admin
        .resume_rule(&ctx.tenant, &RuleId::from(rule_id))
        .await?;
    ctx.audit(&state, "schedules:resume", rule.id.as_str(), Value::Null)
        .await;
    Ok(Json(serde_json::to_value(rule).map_err(QueueError::from)?))
}
