//! Property tests: envelope round-trip fidelity and fingerprint
//! normalization stability over randomized inputs.

use proptest::prelude::*;

use hoist_core::envelope::{Envelope, EnvelopeCodec, EnvelopeHeader, RetrySnapshot};
use hoist_queue::dlq::{error_fingerprint, normalize_error};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("test runtime")
}

fn header_strategy() -> impl Strategy<Value = EnvelopeHeader> {
    (
        "[a-z0-9][a-z0-9._-]{0,20}",
        "[a-z_]{1,16}",
        0u8..=9,
        0i64..2_000_000_000_000,
        proptest::option::of(0i64..2_000_000_000_000),
        proptest::option::of("[a-zA-Z0-9-]{1,32}"),
    )
        .prop_map(|(queue, job_type, priority, enqueued, deadline, key)| EnvelopeHeader {
            queue,
            job_type,
            priority,
            enqueued_at_ms: enqueued,
            not_before_ms: None,
            deadline_ms: deadline,
            retry: RetrySnapshot {
                max_attempts: 3,
                base_ms: 1_000,
                cap_ms: 60_000,
                multiplier: 2.0,
                jitter_fraction: 0.25,
            },
            idempotency_key: key,
            trace_id: None,
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn envelope_roundtrip(
        header in header_strategy(),
        payload in proptest::collection::vec(any::<u8>(), 0..4096),
        tenant in "[a-z0-9][a-z0-9-]{1,20}[a-z0-9]",
    ) {
        let rt = runtime();
        let codec = EnvelopeCodec::new().with_compress_min(512);
        let env = Envelope {
            tenant_id: tenant,
            job_id: "job-prop".to_string(),
            header,
            payload,
        };
        let bytes = rt.block_on(codec.encode(&env, false)).unwrap();
        let back = rt.block_on(codec.decode(&bytes)).unwrap();
        prop_assert_eq!(back, env);
    }

    #[test]
    fn envelope_encoding_is_deterministic(
        header in header_strategy(),
        payload in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let rt = runtime();
        let codec = EnvelopeCodec::new();
        let env = Envelope {
            tenant_id: "t1".to_string(),
            job_id: "job-prop".to_string(),
            header,
            payload,
        };
        let a = rt.block_on(codec.encode(&env, false)).unwrap();
        let b = rt.block_on(codec.encode(&env, false)).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn truncated_envelopes_never_decode(
        payload in proptest::collection::vec(any::<u8>(), 1..256),
        cut_fraction in 0.0f64..1.0,
    ) {
        let rt = runtime();
        let codec = EnvelopeCodec::new();
        let env = Envelope {
            tenant_id: "t1".to_string(),
            job_id: "job-prop".to_string(),
            header: EnvelopeHeader {
                queue: "q".into(),
                job_type: "t".into(),
                priority: 0,
                enqueued_at_ms: 0,
                not_before_ms: None,
                deadline_ms: None,
                retry: RetrySnapshot {
                    max_attempts: 1,
                    base_ms: 0,
                    cap_ms: 0,
                    multiplier: 1.0,
                    jitter_fraction: 0.0,
                },
                idempotency_key: None,
                trace_id: None,
            },
            payload,
        };
        let bytes = rt.block_on(codec.encode(&env, false)).unwrap();
        let cut = ((bytes.len() as f64) * cut_fraction) as usize;
        prop_assume!(cut < bytes.len());
        prop_assert!(rt.block_on(codec.decode(&bytes[..cut])).is_err());
    }

    #[test]
    fn fingerprint_ignores_digits_and_quotes(
        base in "[a-z ]{5,40}",
        n1 in 0u64..1_000_000,
        n2 in 0u64..1_000_000,
        s1 in "[a-zA-Z0-9]{1,12}",
        s2 in "[a-zA-Z0-9]{1,12}",
    ) {
        let a = format!("{base} {n1} for 'req-{s1}'");
        let b = format!("{base} {n2} for 'req-{s2}'");
        prop_assert_eq!(error_fingerprint(&a), error_fingerprint(&b));
    }

    #[test]
    fn normalization_is_idempotent(message in ".{0,200}") {
        let once = normalize_error(&message);
        let twice = normalize_error(&once);
        prop_assert_eq!(once, twice);
    }
}
