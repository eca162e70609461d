//! Conformance suite for the storage contract, run against the memory
//! backend. Scenarios cover the full lifecycle: enqueue/claim/ack,
//! deterministic retry backoff, lease expiry reclaim, concurrent
//! idempotent enqueue, and DLQ pattern remediation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_stream::StreamExt;

use hoist_queue::admin::{AdminPlane, DlqFilter, DlqRetryOptions, DlqRetrySelector};
use hoist_queue::backend::memory::MemoryBackend;
use hoist_queue::backend::QueueBackend;
use hoist_queue::engine::{EnqueueRequest, LifecycleEngine};
use hoist_queue::types::{
    JobError, JobEvent, JobState, JobStatus, QueueCtx, RetryPolicy, WorkerId,
};

fn ctx() -> QueueCtx {
    QueueCtx::new("t1")
}

fn setup() -> (Arc<MemoryBackend>, Arc<LifecycleEngine>) {
    let backend = Arc::new(MemoryBackend::new());
    let engine = Arc::new(LifecycleEngine::new(backend.clone()));
    (backend, engine)
}

fn request(queue: &str, payload: &[u8]) -> EnqueueRequest {
    EnqueueRequest {
        queue: queue.to_string(),
        job_type: "work".to_string(),
        payload: payload.to_vec(),
        ..Default::default()
    }
}

fn no_jitter(max_attempts: u32, base_ms: u64) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_ms,
        cap_ms: 60_000,
        multiplier: 2.0,
        jitter_fraction: 0.0,
    }
}

async fn claim_one(
    engine: &LifecycleEngine,
    queue: &str,
) -> Option<hoist_queue::engine::ClaimedJob> {
    engine
        .claim(&ctx(), &[queue], &WorkerId::from("w1"), Duration::from_secs(5), 1)
        .await
        .unwrap()
        .into_iter()
        .next()
}

/// S1: simple enqueue/claim/ack.
#[tokio::test]
async fn enqueue_claim_ack_lifecycle() {
    let (backend, engine) = setup();

    let receipt = engine
        .enqueue(&ctx(), request("q", br#"{"msg":"hello"}"#))
        .await
        .unwrap();
    assert!(!receipt.duplicate);

    let claimed = claim_one(&engine, "q").await.expect("job claimable");
    assert_eq!(claimed.leased.record.job_id, receipt.job_id);
    assert_eq!(claimed.leased.record.attempt_count, 1);
    assert_eq!(claimed.envelope.payload, br#"{"msg":"hello"}"#);

    engine
        .report_success(&ctx(), claimed.leased.job_id(), &claimed.leased.lease_token)
        .await
        .unwrap();

    let ready = backend
        .list_jobs(&ctx(), "q", Some(JobState::Ready), None, 10)
        .await
        .unwrap();
    assert!(ready.is_empty());
    let claimed_list = backend
        .list_jobs(&ctx(), "q", Some(JobState::Claimed), None, 10)
        .await
        .unwrap();
    assert!(claimed_list.is_empty());
    let stats = backend.queue_stats(&ctx(), "q").await.unwrap();
    assert_eq!(stats.succeeded, 1);
}

/// S2: exponential backoff with jitter 0, then DLQ on exhaustion.
#[tokio::test]
async fn retry_backoff_sequence_then_dlq() {
    let (backend, engine) = setup();
    let mut req = request("q", b"{}");
    req.retry = Some(no_jitter(3, 100));
    engine.enqueue(&ctx(), req).await.unwrap();

    // Attempt 1 fails: visible_at ~ now+100ms, attempt_count becomes 2.
    let first = claim_one(&engine, "q").await.unwrap();
    let t0 = Utc::now();
    engine
        .report_failure(
            &ctx(),
            &first.leased.record,
            &first.leased.lease_token,
            JobError::retryable("boom"),
        )
        .await
        .unwrap();
    let record = backend.get_record(&ctx(), first.leased.job_id()).await.unwrap();
    assert_eq!(record.attempt_count, 2);
    match record.status {
        JobStatus::Retrying { visible_at } => {
            let delay = (visible_at - t0).num_milliseconds();
            assert!((80..=150).contains(&delay), "delay was {delay}ms");
        }
        ref other => panic!("expected retrying, got {other:?}"),
    }

    // Wait out the backoff; attempt 2 fails: ~200ms, attempt_count 3.
    tokio::time::sleep(Duration::from_millis(130)).await;
    let second = claim_one(&engine, "q").await.expect("visible again");
    assert_eq!(second.leased.record.attempt_count, 2);
    let t1 = Utc::now();
    engine
        .report_failure(
            &ctx(),
            &second.leased.record,
            &second.leased.lease_token,
            JobError::retryable("boom again"),
        )
        .await
        .unwrap();
    let record = backend.get_record(&ctx(), second.leased.job_id()).await.unwrap();
    assert_eq!(record.attempt_count, 3);
    match record.status {
        JobStatus::Retrying { visible_at } => {
            let delay = (visible_at - t1).num_milliseconds();
            assert!((180..=260).contains(&delay), "delay was {delay}ms");
        }
        ref other => panic!("expected retrying, got {other:?}"),
    }

    // Third failure exhausts the attempts: dead, chain of three.
    tokio::time::sleep(Duration::from_millis(230)).await;
    let third = claim_one(&engine, "q").await.expect("visible again");
    engine
        .report_failure(
            &ctx(),
            &third.leased.record,
            &third.leased.lease_token,
            JobError::retryable("boom final"),
        )
        .await
        .unwrap();

    let record = backend.get_record(&ctx(), third.leased.job_id()).await.unwrap();
    assert!(matches!(record.status, JobStatus::Dead { .. }));
    assert_eq!(record.attempt_count, 3);
    assert_eq!(record.error_chain.len(), 3);
    let entries = backend.dlq_entries(&ctx(), "q", 0, 10).await.unwrap();
    assert_eq!(entries.len(), 1);
}

/// S3: a crashed worker's lease expires and the job is reclaimed.
#[tokio::test]
async fn lease_expiry_reclaim() {
    let (backend, engine) = setup();
    engine.enqueue(&ctx(), request("q", b"{}")).await.unwrap();

    let claimed = claim_one(&engine, "q").await.unwrap();
    // The worker "crashes": no heartbeat, lease forced past expiry.
    backend.force_lease_expiry(claimed.leased.job_id());
    backend.reclaim_expired(&ctx(), "q", 64).await.unwrap();

    let record = backend.get_record(&ctx(), claimed.leased.job_id()).await.unwrap();
    assert_eq!(record.status, JobStatus::Ready);
    assert_eq!(record.attempt_count, 2);
    assert_eq!(record.last_error.as_deref(), Some("lease_expired"));

    // The stale lease can no longer acknowledge.
    assert!(engine
        .report_success(&ctx(), claimed.leased.job_id(), &claimed.leased.lease_token)
        .await
        .is_err());
}

/// S4: concurrent submits with the same idempotency key converge on one
/// job; the first writer's payload wins.
#[tokio::test]
async fn concurrent_idempotent_enqueue() {
    let (backend, engine) = setup();

    let mut req_a = request("q", br#"{"writer":"a"}"#);
    req_a.idempotency_key = Some("k1".into());
    let mut req_b = request("q", br#"{"writer":"b"}"#);
    req_b.idempotency_key = Some("k1".into());

    let (ctx_a, ctx_b) = (ctx(), ctx());
    let (ra, rb) = tokio::join!(
        engine.enqueue(&ctx_a, req_a),
        engine.enqueue(&ctx_b, req_b)
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(ra.job_id, rb.job_id);
    assert_ne!(ra.duplicate, rb.duplicate, "exactly one submit wins");

    // One envelope exists; its payload belongs to the winner.
    let all = backend.list_jobs(&ctx(), "q", None, None, 10).await.unwrap();
    assert_eq!(all.len(), 1);
    let envelope = engine.open_envelope(&all[0]).await.unwrap();
    let winner: serde_json::Value = serde_json::from_slice(&envelope.payload).unwrap();
    let expected = if ra.duplicate { "b" } else { "a" };
    assert_eq!(winner["writer"], expected);
}

/// Lease exclusivity: one claim wins even under racing workers.
#[tokio::test]
async fn lease_exclusivity_under_racing_claims() {
    let (_backend, engine) = setup();
    engine.enqueue(&ctx(), request("q", b"{}")).await.unwrap();

    let (ctx_a, ctx_b) = (ctx(), ctx());
    let queues_a: [&str; 1] = ["q"];
    let queues_b: [&str; 1] = ["q"];
    let worker_a = WorkerId::from("wa");
    let worker_b = WorkerId::from("wb");
    let (a, b) = tokio::join!(
        engine.claim(&ctx_a, &queues_a, &worker_a, Duration::from_secs(5), 1),
        engine.claim(&ctx_b, &queues_b, &worker_b, Duration::from_secs(5), 1)
    );
    let total = a.unwrap().len() + b.unwrap().len();
    assert_eq!(total, 1, "exactly one worker holds the lease");
}

/// S6: DLQ pattern grouping and bulk retry with counter reset.
#[tokio::test]
async fn dlq_pattern_grouping_and_bulk_retry() {
    let (backend, engine) = setup();
    let plane = AdminPlane::new(engine.clone());

    // 100 timeout-flavoured failures with varying request ids, and 10
    // structurally different ones.
    for i in 0..100 {
        let mut req = request("q", b"{}");
        req.retry = Some(no_jitter(1, 0));
        engine.enqueue(&ctx(), req).await.unwrap();
        let claimed = claim_one(&engine, "q").await.unwrap();
        engine
            .report_failure(
                &ctx(),
                &claimed.leased.record,
                &claimed.leased.lease_token,
                JobError::non_retryable(format!("connection timeout after 30s (request {i})")),
            )
            .await
            .unwrap();
    }
    for _ in 0..10 {
        let mut req = request("q", b"{}");
        req.retry = Some(no_jitter(1, 0));
        engine.enqueue(&ctx(), req).await.unwrap();
        let claimed = claim_one(&engine, "q").await.unwrap();
        engine
            .report_failure(
                &ctx(),
                &claimed.leased.record,
                &claimed.leased.lease_token,
                JobError::non_retryable("invalid JSON"),
            )
            .await
            .unwrap();
    }

    let list = plane
        .dlq_list(&ctx(), "q", &DlqFilter::default(), None, None)
        .await
        .unwrap();
    assert_eq!(list.total_dead, 110);
    assert_eq!(list.patterns.len(), 2);
    assert_eq!(list.patterns[0].count, 100);
    assert_eq!(list.patterns[1].count, 10);

    let report = plane
        .dlq_retry(
            &ctx(),
            "q",
            &DlqRetrySelector {
                job_ids: None,
                pattern_id: Some(list.patterns[0].id.clone()),
            },
            &DlqRetryOptions {
                reset_retry_count: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(report.requeued.len(), 100);
    assert_eq!(report.requeued.len(), report.matched);

    let stats = backend.queue_stats(&ctx(), "q").await.unwrap();
    assert_eq!(stats.ready, 100);
    assert_eq!(stats.dead, 10);
    for item in report.requeued.iter().take(5) {
        let record = backend.get_record(&ctx(), &item.job_id).await.unwrap();
        assert_eq!(record.attempt_count, 0);
    }
}

/// Lifecycle events reach subscribers in order.
#[tokio::test]
async fn emits_lifecycle_events() {
    let (backend, engine) = setup();
    let mut events = backend.events();

    let receipt = engine.enqueue(&ctx(), request("q", b"{}")).await.unwrap();
    let claimed = claim_one(&engine, "q").await.unwrap();
    engine
        .report_success(&ctx(), claimed.leased.job_id(), &claimed.leased.lease_token)
        .await
        .unwrap();

    let mut names = Vec::new();
    while names.len() < 3 {
        let event: JobEvent = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .expect("event within deadline")
            .expect("stream open");
        assert_eq!(*event.job_id(), receipt.job_id);
        names.push(event.event_name().to_string());
    }
    assert_eq!(names, ["enqueued", "claimed", "succeeded"]);
}

/// No loss: a flaky workload ends with every job in exactly one
/// terminal state and the attempt cap intact.
#[tokio::test]
async fn flaky_workload_converges_without_loss() {
    let (backend, engine) = setup();
    let mut ids = Vec::new();
    for i in 0..40 {
        let mut req = request("q", format!("{{\"i\":{i}}}").as_bytes());
        req.retry = Some(no_jitter(3, 0));
        ids.push(engine.enqueue(&ctx(), req).await.unwrap().job_id);
    }

    // Fail every first attempt, then succeed on even indices and
    // exhaust odd ones.
    let worker = WorkerId::from("w1");
    for _ in 0..1_000 {
        let Some(claimed) = engine
            .claim(&ctx(), &["q"], &worker, Duration::from_secs(5), 1)
            .await
            .unwrap()
            .into_iter()
            .next()
        else {
            break;
        };
        let doc: serde_json::Value = serde_json::from_slice(&claimed.envelope.payload).unwrap();
        let even = doc["i"].as_u64().unwrap() % 2 == 0;
        if claimed.leased.record.attempt_count >= 2 && even {
            engine
                .report_success(&ctx(), claimed.leased.job_id(), &claimed.leased.lease_token)
                .await
                .unwrap();
        } else {
            engine
                .report_failure(
                    &ctx(),
                    &claimed.leased.record,
                    &claimed.leased.lease_token,
                    JobError::retryable("flaky"),
                )
                .await
                .unwrap();
        }
    }

    let mut succeeded = 0;
    let mut dead = 0;
    for id in &ids {
        match backend.get_record(&ctx(), id).await {
            Ok(record) => {
                assert!(
                    record.status.is_terminal(),
                    "job {id} still {:?}",
                    record.status
                );
                assert!(record.attempt_count <= 3);
                if matches!(record.status, JobStatus::Dead { .. }) {
                    dead += 1;
                }
            }
            // Succeeded jobs are dropped from storage by default.
            Err(_) => succeeded += 1,
        }
    }
    assert_eq!(succeeded, 20);
    assert_eq!(dead, 20);
}
