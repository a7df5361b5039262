//! Property tests for backoff, signing and the half-open probe guard.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use herald_core::{CircuitState, Destination, EventType, IdempotencyKey, NoOpMetrics, TestClock};
use herald_delivery::{Admission, CircuitConfig, HealthTracker, RetryPolicy, Signer};
use proptest::prelude::*;
use serde_json::json;

proptest! {
    #[test]
    fn backoff_is_non_decreasing_and_bounded(
        base_ms in 1u64..10_000,
        ceiling_factor in 1u64..1_000,
        attempts in 0u32..64,
    ) {
        let policy = RetryPolicy {
            base_backoff: Duration::from_millis(base_ms),
            max_backoff: Duration::from_millis(base_ms * ceiling_factor),
            ..RetryPolicy::default()
        };

        let current = policy.backoff(attempts);
        let next = policy.backoff(attempts + 1);
        prop_assert!(current <= next);
        prop_assert!(next <= policy.max_backoff);
    }

    #[test]
    fn jittered_delay_stays_within_fraction_and_ceiling(
        attempts in 0u32..12,
        fraction in 0.0f64..=1.0,
    ) {
        let policy = RetryPolicy { jitter_fraction: fraction, ..RetryPolicy::default() };
        let nominal = policy.backoff(attempts).as_secs_f64();
        let delay = policy.delay_for(attempts, None).as_secs_f64();

        prop_assert!(delay <= policy.max_backoff.as_secs_f64() + 1e-9);
        prop_assert!(delay >= nominal * (1.0 - fraction) - 1e-6);
    }

    #[test]
    fn signature_changes_exactly_when_timestamp_changes(
        model_id in "[a-z0-9-]{1,24}",
        version in 0u32..1_000,
        first in 1_600_000_000i64..1_900_000_000,
        second in 1_600_000_000i64..1_900_000_000,
    ) {
        let signer = Signer::new(["primary", "previous"]).unwrap();
        let version = version.to_string();
        let key = IdempotencyKey::derive(EventType::ModelReadyForDeploy, &[model_id.as_str(), version.as_str()]);
        let again = IdempotencyKey::derive(EventType::ModelReadyForDeploy, &[model_id.as_str(), version.as_str()]);
        let payload = json!({"model_id": model_id, "version": version});

        prop_assert_eq!(&key, &again);

        let a = signer.sign(&key, &payload, first);
        let b = signer.sign(&key, &payload, second);
        prop_assert_eq!(a.value == b.value, first == second);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn exactly_one_half_open_probe_under_contention(contenders in 2usize..64) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        let probes = runtime.block_on(async move {
            let clock = TestClock::new();
            let config = CircuitConfig { failure_threshold: 1, cooldown: Duration::from_secs(30) };
            let tracker = Arc::new(HealthTracker::new(config, Arc::new(clock.clone()), Arc::new(NoOpMetrics)));
            let destination = Destination::parse("https://flaky.test/hook").unwrap();

            tracker.record_failure(&destination, false).await;
            clock.advance(Duration::from_secs(31));

            let handles: Vec<_> = (0..contenders)
                .map(|_| {
                    let tracker = tracker.clone();
                    let destination = destination.clone();
                    tokio::spawn(async move { tracker.acquire(&destination).await })
                })
                .collect();

            let mut probes = 0;
            for handle in handles {
                if handle.await.unwrap() == (Admission::Allowed { probe: true }) {
                    probes += 1;
                }
            }

            let health = tracker.snapshot(&destination).await.unwrap();
            assert_eq!(health.state, CircuitState::HalfOpen);
            probes
        });

        prop_assert_eq!(probes, 1);
    }
}
