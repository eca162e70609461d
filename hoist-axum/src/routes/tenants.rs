use axum::extract::{Path, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use hoist_core::errors::CoreError;
use hoist_core::tenant::{TenantQuotas, TenantRateLimits, TenantStatus};
use hoist_queue::admin::TenantSpec;
use hoist_queue::error::QueueError;

use crate::error::ApiError;
use crate::extract::ReqCtx;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/tenants", get(list).post(create))
        .route("/tenants/{tenant_id}", put(update).delete(remove))
        .route("/tenants/{tenant_id}/rekey", post(rekey))
}

/// Tenant management is cross-tenant by nature; tokens bound to one
/// tenant cannot reach it.
fn require_cross_tenant(ctx: &ReqCtx) -> Result<(), ApiError> {
    if ctx.claims.allows_cross_tenant() {
        Ok(())
    } else {
        Err(CoreError::forbidden("tenant-bound tokens cannot manage tenants").into())
    }
}

async fn create(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Json(spec): Json<TenantSpec>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "tenants:create", "").await?;
    require_cross_tenant(&ctx)?;
    let record = state.admin.create_tenant(spec).await?;
    ctx.audit(
        &state,
        "tenants:create",
        &record.id,
        json!({"encrypted": record.encryption.is_some()}),
    )
    .await;
    Ok(Json(serde_json::to_value(record).map_err(QueueError::from)?))
}

async fn list(State(state): State<ApiState>, ctx: ReqCtx) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "tenants:list", "").await?;
    require_cross_tenant(&ctx)?;
    let tenants = state.admin.list_tenants().await?;
    Ok(Json(json!({ "tenants": tenants })))
}

#[derive(Deserialize)]
struct UpdateBody {
    quotas: Option<TenantQuotas>,
    rate_limits: Option<TenantRateLimits>,
    status: Option<TenantStatus>,
}

async fn update(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Path(tenant_id): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "tenants:update", &tenant_id).await?;
    require_cross_tenant(&ctx)?;
    let record = state
        .admin
        .update_tenant(&tenant_id, body.quotas, body.rate_limits, body.status)
        .await?;
    ctx.audit(
        &state,
        "tenants:update",
        &tenant_id,
        json!({"status": record.status}),
    )
    .await;
    Ok(Json(serde_json::to_value(record).map_err(QueueError::from)?))
}

#[derive(Deserialize, Default)]
struct DeleteBody {
    confirmation_token: Option<String>,
}

async fn remove(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Path(tenant_id): Path<String>,
    body: Option<Json<DeleteBody>>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "tenants:delete", &tenant_id).await?;
    require_cross_tenant(&ctx)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    ctx.step_up(
        &state,
        &format!("tenant-delete:{tenant_id}"),
        body.confirmation_token.as_deref(),
    )?;
    state.admin.delete_tenant(&tenant_id).await?;
    ctx.audit(&state, "tenants:delete", &tenant_id, Value::Null).await;
    Ok(Json(json!({"tenant_id": tenant_id, "deleted": true})))
}

#[derive(Deserialize, Default)]
struct RekeyBody {
    confirmation_token: Option<String>,
}

async fn rekey(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Path(tenant_id): Path<String>,
    body: Option<Json<RekeyBody>>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "tenants:rekey", &tenant_id).await?;
    require_cross_tenant(&ctx)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    ctx.step_up(
        &state,
        &format!("tenant-rekey:{tenant_id}"),
        body.confirmation_token.as_deref(),
    )?;
    let record = state.admin.rekey_tenant(&tenant_id).await?;
    ctx.audit(
        &state,
        "tenants:rekey",
        &tenant_id,
        json!({"kek_id": record.encryption.as_ref().map(|e| &e.kek_id)}),
    )
    .await;
    Ok(Json(serde_json::to_value(record).map_err(QueueError::from)?))
}
