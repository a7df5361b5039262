//! Reliable, signed webhook delivery.
//!
//! Events published through the [`Dispatcher`] fan out to one delivery per
//! destination. Each delivery is signed with HMAC-SHA256, sent over a pooled
//! HTTP client, and classified: success ends it, a permanent 4xx fails it,
//! and a retryable failure re-queues it with exponential backoff until the
//! retry budget runs out and it lands in the dead letter store.
//!
//! # Architecture
//!
//! ```text
//!  publish ──▶ WebhookChannel ──▶ PendingQueue ◀──────────────┐
//!     │                              │                        │
//!     └──▶ BrokerChannel (optional)  ▼ due                    │ retry
//!                               WorkerPool                    │
//!                                    │                        │
//!                                    ▼                        │
//!                 HealthTracker ─▶ Dispatcher::process ─▶ RetryScheduler
//!                                    │                        │
//!                                    ▼                        ▼ exhausted
//!                               Transport (HTTP)        DeadLetterStore
//! ```
//!
//! # Example
//!
//! ```no_run
//! use herald_core::EventType;
//! use herald_delivery::{Dispatcher, DispatcherConfig, OutboundEvent, WorkerPool};
//! use serde_json::json;
//!
//! # async fn example() -> herald_delivery::Result<()> {
//! let config = DispatcherConfig { active_secrets: vec!["whsec_...".into()], ..Default::default() };
//! let dispatcher = Dispatcher::builder(config).build()?;
//! let pool = WorkerPool::start(dispatcher.clone());
//!
//! let event = OutboundEvent::new(EventType::ModelDeployed, ["model-42", "7"], json!({"model_id": "model-42"}));
//! dispatcher.publish(event, ["https://consumer.example.com/hooks"]).await?;
//!
//! pool.shutdown_graceful(std::time::Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

#[cfg(feature = "nats")]
pub mod broker;
pub mod channel;
pub mod circuit;
pub mod client;
pub mod config;
pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod signing;
pub mod worker_pool;

#[cfg(feature = "nats")]
pub use broker::NatsPublisher;
pub use channel::{BrokerChannel, BrokerPublisher, PublishChannel, PublishedEvent, WebhookChannel};
pub use circuit::{Admission, CircuitConfig, EndpointHealth, HealthTracker};
pub use client::{ClientConfig, DeliveryClient, DeliveryRequest, DeliveryResponse, Transport};
pub use config::DispatcherConfig;
pub use dead_letter::{
    DeadLetterFilter, DeadLetterStore, InMemoryDeadLetterStore, PostgresDeadLetterStore,
};
pub use dispatcher::{Dispatcher, DispatcherBuilder, OutboundEvent};
pub use error::{DeliveryError, Result};
pub use ledger::{CancelError, DeliveryLedger, DestinationStatus};
pub use metrics::{DeliveryMetrics, MetricsSnapshot, TracingMetrics};
pub use queue::PendingQueue;
pub use retry::{RetryPolicy, RetryScheduler, ScheduleOutcome};
pub use signing::{Signer, VerificationError};
pub use worker_pool::WorkerPool;
