//! Dual publishing to the legacy broker and webhooks.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use common::{config, model_deployed};
use herald_core::{Clock, DeliveryStatus, TestClock};
use herald_delivery::{
    BrokerPublisher, DeliveryClient, DeliveryError, DeliveryMetrics, Dispatcher, Result,
};
use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

#[derive(Debug, Default)]
struct MockBroker {
    fail: bool,
    messages: Mutex<Vec<(String, Bytes)>>,
}

#[async_trait]
impl BrokerPublisher for MockBroker {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        if self.fail {
            return Err(DeliveryError::broker("no responders"));
        }
        self.messages.lock().unwrap().push((subject.to_string(), payload));
        Ok(())
    }
}

async fn dual_publish(broker: Arc<MockBroker>) -> (Dispatcher, Arc<DeliveryMetrics>, MockServer) {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let mut config = config();
    config.dual_publish_enabled = true;
    config.broker_subject_prefix = "registry.events".into();
    let metrics = Arc::new(DeliveryMetrics::new());
    let dispatcher = Dispatcher::builder(config.clone())
        .transport(Arc::new(DeliveryClient::new(config.client).unwrap()))
        .broker(broker)
        .metrics(metrics.clone())
        .clock(Arc::new(TestClock::new()))
        .build()
        .unwrap();

    (dispatcher, metrics, server)
}

async fn deliver_all(dispatcher: &Dispatcher) {
    let now = dispatcher.clock().now_utc();
    for envelope in dispatcher.queue().claim_due(now, usize::MAX).await {
        dispatcher.process(envelope).await.unwrap();
    }
}

#[tokio::test]
async fn event_reaches_both_channels() {
    let broker = Arc::new(MockBroker::default());
    let (dispatcher, metrics, server) = dual_publish(broker.clone()).await;

    let event_id = dispatcher.publish(model_deployed("model-d"), [server.uri()]).await.unwrap();
    deliver_all(&dispatcher).await;

    let messages = broker.messages.lock().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, "registry.events.model_deployed");
    let body: serde_json::Value = serde_json::from_slice(&messages[0].1).unwrap();
    assert_eq!(body["event_id"], serde_json::json!(event_id.to_string()));

    assert_eq!(dispatcher.deliveries(event_id).await.unwrap()[0].status, DeliveryStatus::Delivered);
    assert_eq!(metrics.snapshot().broker_published, 1);
}

#[tokio::test]
async fn broker_failure_does_not_affect_webhooks() {
    let broker = Arc::new(MockBroker { fail: true, ..Default::default() });
    let (dispatcher, metrics, server) = dual_publish(broker).await;

    let event_id = dispatcher.publish(model_deployed("model-e"), [server.uri()]).await.unwrap();
    deliver_all(&dispatcher).await;

    assert_eq!(dispatcher.deliveries(event_id).await.unwrap()[0].status, DeliveryStatus::Delivered);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.broker_failed, 1);
    assert_eq!(snapshot.succeeded, 1);
}
