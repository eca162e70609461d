use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use hoist_auth::{Claims, Keyring, Verifier};
use hoist_axum::{router, ApiState};
use hoist_queue::admin::AdminPlane;
use hoist_queue::backend::memory::MemoryBackend;
use hoist_queue::engine::LifecycleEngine;

fn dev_state() -> ApiState {
    let backend = Arc::new(MemoryBackend::new());
    let engine = Arc::new(LifecycleEngine::new(backend));
    ApiState::new(Arc::new(AdminPlane::new(engine))).with_default_tenant("dev-tenant")
}

fn secured_state() -> (ApiState, Arc<Verifier>) {
    let backend = Arc::new(MemoryBackend::new());
    let engine = Arc::new(LifecycleEngine::new(backend));
    let mut keyring = Keyring::new();
    keyring.add_hmac("k1", b"test-secret");
    let verifier = Arc::new(Verifier::new(keyring));
    let state = ApiState::new(Arc::new(AdminPlane::new(engine))).with_verifier(verifier.clone());
    (state, verifier)
}

async fn json_body(res: axum::response::Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let res = router(dev_state())
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await["status"], "ok");
}

#[tokio::test]
async fn enqueue_list_inspect_flow() {
    let app = router(dev_state());

    let res = app
        .clone()
        .oneshot(post_json(
            "/api/v1/queues/outbound/jobs",
            json!({"job_type": "send_email", "payload": {"to": "a@example.com"}}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["status"], "enqueued");
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/queues/outbound/jobs?state=ready")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let listing = json_body(res).await;
    assert_eq!(listing["items"].as_array().unwrap().len(), 1);

    let res = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/jobs/{job_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let detail = json_body(res).await;
    assert_eq!(detail["status"], "ready");
    assert_eq!(detail["job_type"], "send_email");
}

#[tokio::test]
async fn unknown_job_is_a_structured_404() {
    let res = router(dev_state())
        .oneshot(
            Request::builder()
                .uri("/api/v1/jobs/job-missing")
                .header("x-request-id", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body = json_body(res).await;
    assert_eq!(body["code"], "not_found");
    assert_eq!(body["request_id"], "req-42");
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn duplicate_idempotency_key_reports_duplicate() {
    let app = router(dev_state());
    let payload = json!({
        "job_type": "charge",
        "payload": {"amount": 42},
        "idempotency_key": "op-1",
    });

    let first = json_body(
        app.clone()
            .oneshot(post_json("/api/v1/queues/billing/jobs", payload.clone()))
            .await
            .unwrap(),
    )
    .await;
    let second = json_body(
        app.oneshot(post_json("/api/v1/queues/billing/jobs", payload))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(first["status"], "enqueued");
    assert_eq!(second["status"], "duplicate");
    assert_eq!(first["job_id"], second["job_id"]);
}

#[tokio::test]
async fn missing_token_is_401_with_envelope() {
    let (state, _) = secured_state();
    let res = router(state)
        .oneshot(
            Request::builder()
                .uri("/api/v1/queues")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(res).await;
    assert_eq!(body["code"], "unauthorized");
    assert!(body["request_id"].is_string());
}

#[tokio::test]
async fn scope_gates_are_enforced() {
    let (state, verifier) = secured_state();
    let app = router(state);

    let claims = Claims::new("svc")
        .with_tenant("t-one")
        .with_scope("queues:enqueue");
    let token = verifier.keyring().sign("k1", &claims).unwrap();

    // The granted scope works.
    let mut req = post_json(
        "/api/v1/queues/outbound/jobs",
        json!({"job_type": "x", "payload": {}}),
    );
    req.headers_mut().insert(
        "authorization",
        format!("Bearer {token}").parse().unwrap(),
    );
    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // A scope outside the grant is denied.
    let mut req = post_json("/api/v1/dlq/bulk-retry", json!({"queue": "outbound"}));
    req.headers_mut().insert(
        "authorization",
        format!("Bearer {token}").parse().unwrap(),
    );
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(res).await["code"], "forbidden");
}

#[tokio::test]
async fn tenant_mismatch_is_403() {
    let (state, verifier) = secured_state();
    let claims = Claims::new("svc")
        .with_tenant("t-one")
        .with_scope("queues:list");
    let token = verifier.keyring().sign("k1", &claims).unwrap();

    let res = router(state)
        .oneshot(
            Request::builder()
                .uri("/api/v1/queues")
                .header("authorization", format!("Bearer {token}"))
                .header("x-tenant", "t-other")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(res).await["code"], "tenant_mismatch");
}

#[tokio::test]
async fn purge_requires_step_up_and_confirmation() {
    let (state, verifier) = secured_state();
    let app = router(state);

    // Operator without mfa: denied at the step-up gate.
    let plain = Claims::new("op").with_tenant("t-one").with_role("operator");
    let plain_token = verifier.keyring().sign("k1", &plain).unwrap();
    let mut req = post_json("/api/v1/queues/q/purge", json!({"confirm": true}));
    req.headers_mut().insert(
        "authorization",
        format!("Bearer {plain_token}").parse().unwrap(),
    );
    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    // Mfa token but no confirm flag: the explicit flag is still needed.
    let elevated = Claims::new("op")
        .with_tenant("t-one")
        .with_role("operator")
        .with_mfa();
    let elevated_token = verifier.keyring().sign("k1", &elevated).unwrap();
    let mut req = post_json("/api/v1/queues/q/purge", json!({"confirm": false}));
    req.headers_mut().insert(
        "authorization",
        format!("Bearer {elevated_token}").parse().unwrap(),
    );
    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // Both present: the purge goes through.
    let mut req = post_json("/api/v1/queues/q/purge", json!({"confirm": true}));
    req.headers_mut().insert(
        "authorization",
        format!("Bearer {elevated_token}").parse().unwrap(),
    );
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await["removed"], 0);
}

#[tokio::test]
async fn audit_requires_dedicated_scope() {
    let (state, verifier) = secured_state();
    let app = router(state);

    // Operator role does not imply audit access.
    let operator = Claims::new("op").with_tenant("t-one").with_role("operator");
    let token = verifier.keyring().sign("k1", &operator).unwrap();
    let res = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/audit")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    // The dedicated scope does.
    let auditor = Claims::new("sec")
        .with_tenant("t-one")
        .with_scope("admin:audit");
    let token = verifier.keyring().sign("k1", &auditor).unwrap();
    let res = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/audit")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    // The denied operator attempt above is itself on the record.
    let body = json_body(res).await;
    let events = body["events"].as_array().unwrap();
    assert!(events
        .iter()
        .any(|e| e["action"] == "admin:audit" && e["result"] == "denied"));
}
