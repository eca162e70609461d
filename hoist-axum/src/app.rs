use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Request};
use axum::response::Response;
use axum::routing::get;
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tokio::net::{TcpListener, ToSocketAddrs};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use hoist_queue::backend::QueueBackend;

use crate::error::ApiError;
use crate::routes;
use crate::state::ApiState;

async fn ensure_request_id(req: Request<Body>, next: middleware::Next) -> Response {
    let request_id_header = HeaderName::from_static("x-request-id");

    let mut req = req;
    let request_id = req
        .headers()
        .get(&request_id_header)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Make the id visible to handlers and echo it on the response.
    if req.headers().get(&request_id_header).is_none() {
        if let Ok(v) = HeaderValue::from_str(&request_id) {
            req.headers_mut().insert(request_id_header.clone(), v);
        }
    }

    let mut res = next.run(req).await;

    if res.headers().get(&request_id_header).is_none() {
        if let Ok(v) = HeaderValue::from_str(&request_id) {
            res.headers_mut().insert(request_id_header, v);
        }
    }

    res
}

/// Stamp the request id into JSON error envelopes. Handlers return the
/// envelope with a null `request_id`; filling it here keeps `?`
/// conversions free of correlation plumbing.
async fn stamp_error_envelope(req: Request<Body>, next: middleware::Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let res = next.run(req).await;
    if !(res.status().is_client_error() || res.status().is_server_error()) {
        return res;
    }

    let (mut parts, body) = res.into_parts();
    let bytes = match axum::body::to_bytes(body, 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => return Response::from_parts(parts, Body::empty()),
    };
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(mut envelope) if envelope.is_object() => {
            let missing = envelope
                .get("request_id")
                .map(Value::is_null)
                .unwrap_or(true);
            if missing {
                envelope["request_id"] = json!(request_id);
            }
            let body = serde_json::to_vec(&envelope).unwrap_or_else(|_| bytes.to_vec());
            if let Ok(len) = HeaderValue::from_str(&body.len().to_string()) {
                parts.headers.insert(axum::http::header::CONTENT_LENGTH, len);
            }
            Response::from_parts(parts, Body::from(body))
        }
        _ => Response::from_parts(parts, Body::from(bytes)),
    }
}

async fn healthz(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    state.admin.engine().backend().ping().await?;
    Ok(Json(json!({"status": "ok"})))
}

/// Assemble the full application router.
pub fn router(state: ApiState) -> Router {
    let api = Router::new()
        .merge(routes::jobs::router())
        .merge(routes::queues::router())
        .merge(routes::dlq::router())
        .merge(routes::rules::router())
        .merge(routes::schedules::router())
        .merge(routes::tenants::router())
        .merge(routes::workers::router())
        .merge(routes::audit::router());

    Router::new()
        .nest("/api/v1", api)
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(middleware::from_fn(stamp_error_envelope))
        .layer(middleware::from_fn(ensure_request_id))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve until the process is stopped.
pub async fn serve<A>(state: ApiState, addr: A) -> anyhow::Result<()>
where
    A: ToSocketAddrs,
{
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "http api listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
