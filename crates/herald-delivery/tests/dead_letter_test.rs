//! Exhaustion, dead-lettering and operator replay.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use common::{config, model_deployed, Harness};
use herald_core::{AttemptOutcome, Clock, DeadLetterEntry, DeliveryStatus, EventId, EventType};
use herald_delivery::{
    DeadLetterFilter, DeadLetterStore, DeliveryError, InMemoryDeadLetterStore, Result,
};
use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

/// Store whose first `failures` writes fail.
#[derive(Debug)]
struct FlakyStore {
    inner: Arc<InMemoryDeadLetterStore>,
    failures: AtomicUsize,
}

#[async_trait]
impl DeadLetterStore for FlakyStore {
    async fn record(&self, entry: DeadLetterEntry) -> Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DeliveryError::storage("connection reset"));
        }
        self.inner.record(entry).await
    }

    async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        self.inner.list(filter).await
    }

    async fn get(&self, event_id: EventId) -> Result<Vec<DeadLetterEntry>> {
        self.inner.get(event_id).await
    }

    async fn take(&self, event_id: EventId) -> Result<Vec<DeadLetterEntry>> {
        self.inner.take(event_id).await
    }
}

#[tokio::test]
async fn exhausted_delivery_is_dead_lettered_exactly_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .expect(5)
        .mount(&server)
        .await;

    let harness = Harness::new(config());
    let event_id =
        harness.dispatcher.publish(model_deployed("model-5"), [server.uri()]).await.unwrap();

    harness.run_to_completion(50).await;

    let entries = harness.dead_letters.get(event_id).await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.envelope.attempt_count, 5);
    assert_eq!(entry.attempts.len(), 5);
    assert!(entry.attempts.iter().all(|a| a.outcome == AttemptOutcome::RetryableFailure));
    assert_eq!(entry.last_error.as_deref(), Some("server error: HTTP 502"));

    assert_eq!(harness.dispatcher.pending_count().await, 0);
    assert_eq!(harness.metrics.snapshot().dead_lettered, 1);
    assert_eq!(
        harness.dispatcher.deliveries(event_id).await.unwrap()[0].status,
        DeliveryStatus::DeadLettered
    );
}

#[tokio::test]
async fn dead_letters_are_filterable() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

    let mut config = config();
    config.retry.max_attempts = 1;
    let harness = Harness::new(config);
    harness.dispatcher.publish(model_deployed("model-a"), [server.uri()]).await.unwrap();
    let archived = herald_delivery::OutboundEvent::new(
        EventType::ModelArchived,
        ["model-b"],
        serde_json::json!({"model_id": "model-b"}),
    );
    harness.dispatcher.publish(archived, [server.uri()]).await.unwrap();

    harness.run_to_completion(10).await;

    let all = harness.dispatcher.dead_letters(&DeadLetterFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);

    let archived_only = DeadLetterFilter {
        event_type: Some(EventType::ModelArchived),
        ..Default::default()
    };
    let listed = harness.dispatcher.dead_letters(&archived_only).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].envelope.event_type, EventType::ModelArchived);
}

#[tokio::test]
async fn replay_restarts_the_lifecycle_from_zero() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let mut config = config();
    config.retry.max_attempts = 2;
    let harness = Harness::new(config);
    let event_id =
        harness.dispatcher.publish(model_deployed("model-r"), [server.uri()]).await.unwrap();
    harness.run_to_completion(20).await;
    assert_eq!(harness.dead_letters.len().await, 1);

    let replayed = harness.dispatcher.replay(event_id).await.unwrap();
    assert_eq!(replayed, 1);
    assert!(harness.dead_letters.is_empty().await);

    let requeued = harness.dispatcher.queue().claim_due(harness.clock.now_utc(), 10).await;
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].attempt_count, 0);
    assert!(requeued[0].signature.is_none());
    for envelope in requeued {
        harness.dispatcher.process(envelope).await.unwrap();
    }

    assert_eq!(
        harness.dispatcher.deliveries(event_id).await.unwrap()[0].status,
        DeliveryStatus::Delivered
    );
    let attempts = harness.dispatcher.attempts(event_id).await.unwrap();
    assert_eq!(attempts.last().unwrap().attempt_number, 1);
    assert_eq!(harness.metrics.snapshot().replayed, 1);

    assert_eq!(harness.dispatcher.replay(event_id).await.unwrap(), 0);
}

#[tokio::test]
async fn failed_dead_letter_write_is_retried_without_redelivery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = config();
    config.retry.max_attempts = 1;
    let backing = Arc::new(InMemoryDeadLetterStore::new());
    let store = Arc::new(FlakyStore { inner: backing.clone(), failures: AtomicUsize::new(1) });
    let harness = Harness::with_store(config, store, backing);
    let event_id =
        harness.dispatcher.publish(model_deployed("model-p"), [server.uri()]).await.unwrap();

    harness.step().await;
    assert!(harness.dead_letters.is_empty().await);
    assert_eq!(harness.dispatcher.pending_count().await, 1);

    harness.run_to_completion(5).await;

    assert_eq!(harness.dead_letters.get(event_id).await.unwrap().len(), 1);
    assert_eq!(harness.dispatcher.pending_count().await, 0);
    assert_eq!(harness.metrics.snapshot().dead_lettered, 1);
}
