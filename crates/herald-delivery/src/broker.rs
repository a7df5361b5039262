//! NATS JetStream publisher for the legacy broker channel.

use async_nats::jetstream;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use crate::{
    channel::BrokerPublisher,
    error::{DeliveryError, Result},
};

/// Durable JetStream publisher.
#[derive(Debug, Clone)]
pub struct NatsPublisher {
    jetstream: jetstream::Context,
}

impl NatsPublisher {
    /// Connects to NATS and makes sure a stream captures `<subject_prefix>.>`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Broker` if the connection or stream setup
    /// fails.
    pub async fn connect(url: &str, stream_name: &str, subject_prefix: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| DeliveryError::broker(format!("failed to connect to {url}: {e}")))?;
        let jetstream = jetstream::new(client);

        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name.to_string(),
                subjects: vec![format!("{subject_prefix}.>")],
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| DeliveryError::broker(format!("failed to create stream: {e}")))?;

        info!(url, stream = stream_name, "connected to NATS JetStream");
        Ok(Self { jetstream })
    }
}

#[async_trait]
impl BrokerPublisher for NatsPublisher {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| DeliveryError::broker(e.to_string()))?;
        ack.await.map_err(|e| DeliveryError::broker(format!("publish not acknowledged: {e}")))?;

        debug!(subject, "broker publish acknowledged");
        Ok(())
    }
}
