use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use hoist_core::errors::CoreError;
use hoist_queue::admin::ListRequest;
use hoist_queue::backend::CancelOutcome;
use hoist_queue::engine::EnqueueRequest;
use hoist_queue::error::QueueError;
use hoist_queue::types::{JobId, JobState, RetryPolicy};

use crate::error::ApiError;
use crate::extract::ReqCtx;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/queues/{queue}/jobs", get(list).post(enqueue))
        .route("/jobs/{job_id}", get(inspect).delete(cancel))
}

#[derive(Deserialize)]
struct EnqueueBody {
    job_type: String,
    #[serde(default)]
    payload: Value,
    priority: Option<u8>,
    not_before: Option<DateTime<Utc>>,
    /// Convenience alternative to `not_before`.
    delay_ms: Option<u64>,
    deadline: Option<DateTime<Utc>>,
    idempotency_key: Option<String>,
    retry: Option<RetryPolicy>,
}

async fn enqueue(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Path(queue): Path<String>,
    Json(body): Json<EnqueueBody>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "queues:enqueue", &queue).await?;

    let not_before = body.not_before.or_else(|| {
        body.delay_ms
            .map(|ms| Utc::now() + chrono::Duration::milliseconds(ms as i64))
    });
    let payload = serde_json::to_vec(&body.payload).map_err(QueueError::from)?;
    let receipt = state
        .admin
        .enqueue(
            &ctx.tenant,
            EnqueueRequest {
                queue: queue.clone(),
                job_type: body.job_type,
                payload,
                priority: body.priority,
                not_before,
                deadline: body.deadline,
                retry: body.retry,
                idempotency_key: body.idempotency_key,
                trace_id: ctx.tenant.trace_id.clone(),
                rule_id: None,
            },
        )
        .await?;

    ctx.audit(
        &state,
        "queues:enqueue",
        &queue,
        json!({"job_id": receipt.job_id, "duplicate": receipt.duplicate}),
    )
    .await;

    Ok(Json(json!({
        "job_id": receipt.job_id,
        "status": if receipt.duplicate { "duplicate" } else { "enqueued" },
        "terminal_status": receipt.terminal_status,
    })))
}

#[derive(Deserialize)]
struct ListParams {
    state: Option<String>,
    cursor: Option<String>,
    limit: Option<usize>,
}

async fn list(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Path(queue): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "queues:list", &queue).await?;
    let state_filter = parse_state(params.state.as_deref())?;
    let page = state
        .admin
        .list(
            &ctx.tenant,
            ListRequest {
                queue,
                state: state_filter,
                cursor: params.cursor,
                limit: params.limit,
            },
        )
        .await?;
    Ok(Json(json!({
        "items": page.items,
        "next_cursor": page.next_cursor,
    })))
}

async fn inspect(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "queues:inspect", "").await?;
    let detail = state
        .admin
        .inspect(&ctx.tenant, &JobId::from(job_id))
        .await?;
    Ok(Json(serde_json::to_value(detail).map_err(QueueError::from)?))
}

async fn cancel(
    State(state): State<ApiState>,
    ctx: ReqCtx,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&state, "queues:cancel", "").await?;
    let job_id = JobId::from(job_id);
    let outcome = state.admin.cancel(&ctx.tenant, &job_id).await?;
    let result = match outcome {
        CancelOutcome::Cancelled => "cancelled",
        CancelOutcome::Requested => "cancellation_requested",
        CancelOutcome::NotCancellable => {
            return Err(CoreError::conflict("job is not cancellable").into())
        }
    };
    ctx.audit(&state, "queues:cancel", job_id.as_str(), json!({"result": result}))
        .await;
    Ok(Json(json!({"job_id": job_id, "result": result})))
}

pub(crate) fn parse_state(raw: Option<&str>) -> Result<Option<JobState>, ApiError> {
    raw.map(|s| {
        s.parse::<JobState>()
            .map_err(|e| ApiError::from(CoreError::validation(e)))
    })
    .transpose()
}
