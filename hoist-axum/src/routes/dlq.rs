use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use hoist_queue::admin::{DlqFilter, DlqRetryOptions, DlqRetrySelector, PatchOp};
use hoist_queue::error::QueueError;
use hoist_queue::types::JobId;

use crate::error::ApiError;
use crate::extract::ReqCtx;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/dlq/list", get(list))
        .route("/dlq/bulk-retry", post(bulk_retry))
        .route("/dlq/transform-payload", post(transform_payload))
}

#[derive(Deserialize)]
struct ListParams {
    queue: String,
    pattern_id: Option<String>,
    job_type: Option<String>,
    cursor: Option<String>,
    limit: Option<usize>,
}

async fn list(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "dlq:list", &params.queue).await?;
    let list = state
        .admin
        .dlq_list(
            &ctx.tenant,
            &params.queue,
            &DlqFilter {
                pattern_id: params.pattern_id,
                job_type: params.job_type,
            },
            params.cursor,
            params.limit,
        )
        .await?;
    Ok(Json(json!({
        "patterns": list.patterns,
        "items": list.entries.items,
        "next_cursor": list.entries.next_cursor,
        "total_dead": list.total_dead,
    })))
}

#[derive(Deserialize)]
struct BulkRetryBody {
    queue: String,
    job_ids: Option<Vec<String>>,
    pattern_id: Option<String>,
    #[serde(default)]
    reset_retry_count: bool,
    target_queue: Option<String>,
    modify_payload: Option<Vec<PatchOp>>,
    #[serde(default)]
    dry_run: bool,
    max_items: Option<usize>,
    /// Explicit confirmation flag for bulk mutation.
    #[serde(default)]
    confirm: bool,
    confirmation_token: Option<String>,
}

async fn bulk_retry(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Json(body): Json<BulkRetryBody>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "dlq:retry", &body.queue).await?;
    if !body.dry_run {
        if !body.confirm {
            return Err(hoist_core::errors::CoreError::validation(
                "bulk retry requires the confirm flag",
            )
            .into());
        }
        ctx.step_up(
            &state,
            &format!("dlq-retry:{}", body.queue),
            body.confirmation_token.as_deref(),
        )?;
    }

    let report = state
        .admin
        .dlq_retry(
            &ctx.tenant,
            &body.queue,
            &DlqRetrySelector {
                job_ids: body
                    .job_ids
                    .map(|ids| ids.into_iter().map(JobId::from).collect()),
                pattern_id: body.pattern_id,
            },
            &DlqRetryOptions {
                reset_retry_count: body.reset_retry_count,
                target_queue: body.target_queue,
                modify_payload: body.modify_payload,
                dry_run: body.dry_run,
                max_items: body.max_items,
            },
        )
        .await?;

    if !report.dry_run {
        ctx.audit(
            &state,
            "dlq:retry",
            &body.queue,
            serde_json::to_value(&report).map_err(QueueError::from)?,
        )
        .await;
    }
    Ok(Json(serde_json::to_value(report).map_err(QueueError::from)?))
}

#[derive(Deserialize)]
struct TransformBody {
    job_id: String,
    ops: Vec<PatchOp>,
    #[serde(default)]
    dry_run: bool,
}

async fn transform_payload(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Json(body): Json<TransformBody>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "dlq:transform", "").await?;
    let result = state
        .admin
        .transform_payload(
            &ctx.tenant,
            &JobId::from(body.job_id),
            &body.ops,
            body.dry_run,
        )
        .await?;
    if !result.dry_run {
        ctx.audit(
            &state,
            "dlq:transform",
            result.job_id.as_str(),
            json!({"before": result.before, "after": result.after}),
        )
        .await;
    }
    Ok(Json(serde_json::to_value(result).map_err(QueueError::from)?))
}
