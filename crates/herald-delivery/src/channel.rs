//! Publish channels behind the dispatcher.
//!
//! The webhook channel and the legacy broker channel are independent
//! strategies: the dispatcher hands every published event to each enabled
//! channel, and a failure in one never affects the other.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use herald_core::{
    DeliveryEvent, Destination, Envelope, EventId, EventType, IdempotencyKey, MetricsSink,
};
use serde::Serialize;
use tracing::{debug, error};

use crate::{
    error::{DeliveryError, Result},
    ledger::DeliveryLedger,
    queue::PendingQueue,
};

/// An event accepted by `publish`, before per-destination fan-out.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    /// Generated event id.
    pub event_id: EventId,
    /// Key shared by every delivery of this event.
    pub idempotency_key: IdempotencyKey,
    /// Kind of event.
    pub event_type: EventType,
    /// Event payload.
    pub payload: serde_json::Value,
    /// Publish time.
    pub created_at: DateTime<Utc>,
    /// Deduplicated webhook destinations.
    pub destinations: Vec<Destination>,
}

/// A way of getting a published event to consumers.
#[async_trait]
pub trait PublishChannel: Send + Sync + std::fmt::Debug {
    /// Channel name for logs.
    fn name(&self) -> &'static str;

    /// Hands the event to the channel.
    async fn publish(&self, event: &PublishedEvent) -> Result<()>;
}

/// Fans an event out into one pending envelope per destination.
#[derive(Debug)]
pub struct WebhookChannel {
    queue: Arc<PendingQueue>,
    ledger: Arc<DeliveryLedger>,
}

impl WebhookChannel {
    /// Creates the channel over the shared queue and ledger.
    pub fn new(queue: Arc<PendingQueue>, ledger: Arc<DeliveryLedger>) -> Self {
        Self { queue, ledger }
    }
}

#[async_trait]
impl PublishChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn publish(&self, event: &PublishedEvent) -> Result<()> {
        self.ledger.register(event.event_id, &event.destinations).await;

        for destination in &event.destinations {
            let envelope = Envelope::new(
                event.event_id,
                event.idempotency_key.clone(),
                event.event_type,
                event.payload.clone(),
                destination.clone(),
                event.created_at,
            );
            self.queue.push(envelope).await;
        }

        debug!(
            event_id = %event.event_id,
            destinations = event.destinations.len(),
            "event fanned out to webhook destinations"
        );
        Ok(())
    }
}

/// Sends raw messages to a message broker.
#[async_trait]
pub trait BrokerPublisher: Send + Sync + std::fmt::Debug {
    /// Publishes `payload` on `subject` and waits for the broker's
    /// acknowledgement.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;
}

#[derive(Serialize)]
struct BrokerMessage<'a> {
    event_id: EventId,
    idempotency_key: &'a IdempotencyKey,
    event_type: EventType,
    payload: &'a serde_json::Value,
    created_at: DateTime<Utc>,
}

/// Legacy broker channel used during migration.
///
/// Publishes the event without per-destination fields to
/// `<subject_prefix>.<event_type>`. Failures are logged and counted; they
/// are never retried here and never reach the webhook path.
#[derive(Debug)]
pub struct BrokerChannel {
    publisher: Arc<dyn BrokerPublisher>,
    subject_prefix: String,
    metrics: Arc<dyn MetricsSink>,
}

impl BrokerChannel {
    /// Creates a broker channel.
    pub fn new(
        publisher: Arc<dyn BrokerPublisher>,
        subject_prefix: impl Into<String>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self { publisher, subject_prefix: subject_prefix.into(), metrics }
    }

    /// Subject an event type is published on.
    pub fn subject_for(&self, event_type: EventType) -> String {
        format!("{}.{}", self.subject_prefix, event_type.as_str())
    }
}

#[async_trait]
impl PublishChannel for BrokerChannel {
    fn name(&self) -> &'static str {
        "broker"
    }

    async fn publish(&self, event: &PublishedEvent) -> Result<()> {
        let message = BrokerMessage {
            event_id: event.event_id,
            idempotency_key: &event.idempotency_key,
            event_type: event.event_type,
            payload: &event.payload,
            created_at: event.created_at,
        };
        let body = serde_json::to_vec(&message)
            .map_err(|e| DeliveryError::internal(format!("failed to encode broker message: {e}")))?;
        let subject = self.subject_for(event.event_type);

        match self.publisher.publish(&subject, Bytes::from(body)).await {
            Ok(()) => {
                self.metrics.record(&DeliveryEvent::BrokerPublished { event_id: event.event_id });
                debug!(event_id = %event.event_id, subject = %subject, "event published to broker");
                Ok(())
            },
            Err(e) => {
                self.metrics.record(&DeliveryEvent::BrokerFailed {
                    event_id: event.event_id,
                    error: e.to_string(),
                });
                error!(
                    event_id = %event.event_id,
                    subject = %subject,
                    error = %e,
                    "broker publish failed"
                );
                Err(e)
            },
        }
    }
}
