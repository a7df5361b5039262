//! Cancellation before and during the first attempt.

#![allow(clippy::unwrap_used)]

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use herald_core::{DeliveryStatus, EventType};
use herald_delivery::{
    CancelError, DeliveryMetrics, DeliveryRequest, DeliveryResponse, Dispatcher, DispatcherConfig,
    OutboundEvent, Result, Transport,
};
use serde_json::json;
use tokio::sync::{Notify, Semaphore};

/// Transport that blocks every send until released.
#[derive(Debug)]
struct GatedTransport {
    started: Notify,
    release: Semaphore,
}

#[async_trait]
impl Transport for GatedTransport {
    async fn send(&self, _request: DeliveryRequest) -> Result<DeliveryResponse> {
        self.started.notify_one();
        let _permit = self.release.acquire().await.unwrap();
        Ok(DeliveryResponse {
            status_code: 200,
            headers: HashMap::new(),
            body: String::new(),
            duration: Duration::from_millis(1),
        })
    }
}

fn setup() -> (Dispatcher, Arc<GatedTransport>, Arc<DeliveryMetrics>) {
    let transport = Arc::new(GatedTransport { started: Notify::new(), release: Semaphore::new(0) });
    let metrics = Arc::new(DeliveryMetrics::new());
    let config = DispatcherConfig { active_secrets: vec!["secret".into()], ..Default::default() };
    let dispatcher = Dispatcher::builder(config)
        .transport(transport.clone())
        .metrics(metrics.clone())
        .build()
        .unwrap();
    (dispatcher, transport, metrics)
}

fn event() -> OutboundEvent {
    OutboundEvent::new(EventType::ModelReadyForDeploy, ["model-c", "2"], json!({"model_id": "model-c"}))
}

#[tokio::test]
async fn cancel_before_dispatch_removes_queued_deliveries() {
    let (dispatcher, _transport, metrics) = setup();
    let event_id =
        dispatcher.publish(event(), ["https://a.test/", "https://b.test/"]).await.unwrap();

    dispatcher.cancel(event_id).await.unwrap();

    assert_eq!(dispatcher.pending_count().await, 0);
    let statuses = dispatcher.deliveries(event_id).await.unwrap();
    assert!(statuses.iter().all(|s| s.status == DeliveryStatus::Cancelled));
    assert_eq!(metrics.snapshot().cancelled, 1);
}

#[tokio::test]
async fn in_flight_outcome_is_discarded_after_cancel() {
    let (dispatcher, transport, metrics) = setup();
    let event_id = dispatcher.publish(event(), ["https://a.test/"]).await.unwrap();
    let envelope = dispatcher.queue().claim_due(chrono::Utc::now(), 1).await.remove(0);

    let worker = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.process(envelope).await })
    };
    transport.started.notified().await;

    dispatcher.cancel(event_id).await.unwrap();
    transport.release.add_permits(1);
    worker.await.unwrap().unwrap();

    assert_eq!(metrics.snapshot().outcomes_discarded, 1);
    assert_eq!(metrics.snapshot().succeeded, 0);
    assert!(dispatcher.attempts(event_id).await.unwrap().is_empty());
    assert_eq!(dispatcher.deliveries(event_id).await.unwrap()[0].status, DeliveryStatus::Cancelled);
}

#[tokio::test]
async fn cancel_is_refused_once_an_attempt_completed() {
    let (dispatcher, transport, _metrics) = setup();
    transport.release.add_permits(1);
    let event_id = dispatcher.publish(event(), ["https://a.test/"]).await.unwrap();
    let envelope = dispatcher.queue().claim_due(chrono::Utc::now(), 1).await.remove(0);
    dispatcher.process(envelope).await.unwrap();

    assert_eq!(dispatcher.cancel(event_id).await, Err(CancelError::AlreadyStarted));
    assert_eq!(
        dispatcher.cancel(herald_core::EventId::new()).await,
        Err(CancelError::NotFound)
    );
}
