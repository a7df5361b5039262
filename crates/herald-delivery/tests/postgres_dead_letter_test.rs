//! Integration tests for the PostgreSQL dead letter store.
//!
//! These run against the database named by `DATABASE_URL` and are skipped
//! when it is unset. Every test writes under its own destination host so
//! runs can share one database without cleanup.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use herald_core::{
    AttemptOutcome, DeadLetterEntry, DeliveryAttempt, Destination, Envelope, EventId, EventType,
    IdempotencyKey,
};
use herald_delivery::{DeadLetterFilter, DeadLetterStore, PostgresDeadLetterStore};
use serde_json::json;
use uuid::Uuid;

async fn store() -> Option<PostgresDeadLetterStore> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping PostgreSQL dead letter tests");
        return None;
    };
    Some(PostgresDeadLetterStore::connect(&url).await.expect("failed to connect to DATABASE_URL"))
}

fn unique_destination(path: &str) -> Destination {
    Destination::parse(&format!("https://{}.consumer.test/{path}", Uuid::new_v4().simple()))
        .unwrap()
}

fn entry(
    event_id: EventId,
    event_type: EventType,
    destination: &Destination,
    dead_lettered_at: DateTime<Utc>,
) -> DeadLetterEntry {
    let key = IdempotencyKey::derive(event_type, &[event_id.to_string()]);
    let mut envelope = Envelope::new(
        event_id,
        key,
        event_type,
        json!({"model_id": "churn-model", "version": 3}),
        destination.clone(),
        dead_lettered_at - Duration::minutes(10),
    );
    envelope.attempt_count = 2;

    let attempts = (1..=2)
        .map(|n| DeliveryAttempt {
            event_id,
            destination: destination.clone(),
            attempt_number: n,
            attempted_at: dead_lettered_at - Duration::minutes(i64::from(3 - n)),
            http_status: Some(503),
            error: Some("server error: HTTP 503".into()),
            latency_ms: 40,
            outcome: AttemptOutcome::RetryableFailure,
        })
        .collect();

    DeadLetterEntry {
        envelope,
        attempts,
        last_error: Some("server error: HTTP 503".into()),
        dead_lettered_at,
    }
}

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
}

#[tokio::test]
async fn recorded_entry_round_trips() {
    let Some(store) = store().await else { return };
    let destination = unique_destination("hooks");
    let event_id = EventId::new();
    let original = entry(event_id, EventType::ModelDeployed, &destination, at(9));

    store.record(original.clone()).await.unwrap();

    let loaded = store.get(event_id).await.unwrap();
    assert_eq!(loaded.len(), 1);
    let loaded = &loaded[0];
    assert_eq!(loaded.envelope.event_id, event_id);
    assert_eq!(loaded.envelope.destination, destination);
    assert_eq!(loaded.envelope.event_type, EventType::ModelDeployed);
    assert_eq!(loaded.envelope.idempotency_key, original.envelope.idempotency_key);
    assert_eq!(loaded.envelope.payload, original.envelope.payload);
    assert_eq!(loaded.envelope.attempt_count, 2);
    assert_eq!(loaded.attempts, original.attempts);
    assert_eq!(loaded.last_error, original.last_error);
    assert_eq!(loaded.dead_lettered_at, at(9));
}

#[tokio::test]
async fn recording_same_delivery_twice_keeps_first_row() {
    let Some(store) = store().await else { return };
    let destination = unique_destination("hooks");
    let event_id = EventId::new();

    store.record(entry(event_id, EventType::ModelArchived, &destination, at(9))).await.unwrap();
    let mut duplicate = entry(event_id, EventType::ModelArchived, &destination, at(11));
    duplicate.last_error = Some("second write".into());
    store.record(duplicate).await.unwrap();

    let loaded = store.get(event_id).await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].dead_lettered_at, at(9));
    assert_eq!(loaded[0].last_error.as_deref(), Some("server error: HTTP 503"));
}

#[tokio::test]
async fn list_applies_every_filter() {
    let Some(store) = store().await else { return };
    let destination = unique_destination("hooks");
    let other = unique_destination("hooks");

    let early = EventId::new();
    let deployed = EventId::new();
    let late = EventId::new();
    store.record(entry(early, EventType::ModelRegistered, &destination, at(8))).await.unwrap();
    store.record(entry(deployed, EventType::ModelDeployed, &destination, at(10))).await.unwrap();
    store.record(entry(late, EventType::ModelRegistered, &destination, at(12))).await.unwrap();
    store.record(entry(EventId::new(), EventType::ModelRegistered, &other, at(10))).await.unwrap();

    let ids = |entries: Vec<DeadLetterEntry>| {
        entries.into_iter().map(|e| e.envelope.event_id).collect::<Vec<_>>()
    };

    let by_destination =
        DeadLetterFilter { destination: Some(destination.clone()), ..Default::default() };
    assert_eq!(ids(store.list(&by_destination).await.unwrap()), vec![early, deployed, late]);

    let by_type = DeadLetterFilter {
        event_type: Some(EventType::ModelRegistered),
        ..by_destination.clone()
    };
    assert_eq!(ids(store.list(&by_type).await.unwrap()), vec![early, late]);

    let inclusive_range =
        DeadLetterFilter { from: Some(at(10)), to: Some(at(12)), ..by_destination.clone() };
    assert_eq!(ids(store.list(&inclusive_range).await.unwrap()), vec![deployed, late]);

    let limited = DeadLetterFilter { limit: Some(1), ..by_destination };
    assert_eq!(ids(store.list(&limited).await.unwrap()), vec![early]);
}

#[tokio::test]
async fn take_removes_all_destinations_of_an_event() {
    let Some(store) = store().await else { return };
    let first = unique_destination("a");
    let second = unique_destination("b");
    let event_id = EventId::new();
    let untouched = EventId::new();

    store.record(entry(event_id, EventType::ModelDeployed, &first, at(9))).await.unwrap();
    store.record(entry(event_id, EventType::ModelDeployed, &second, at(9))).await.unwrap();
    store.record(entry(untouched, EventType::ModelDeployed, &first, at(9))).await.unwrap();

    let taken = store.take(event_id).await.unwrap();
    assert_eq!(taken.len(), 2);
    assert!(taken.iter().all(|e| e.envelope.event_id == event_id));

    assert!(store.get(event_id).await.unwrap().is_empty());
    assert!(store.take(event_id).await.unwrap().is_empty());
    assert_eq!(store.get(untouched).await.unwrap().len(), 1);
}
