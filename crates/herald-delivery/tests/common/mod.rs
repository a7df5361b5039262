//! Shared fixtures for delivery integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use herald_core::{Clock, EventType, TestClock};
use herald_delivery::{
    ClientConfig, DeadLetterStore, DeliveryClient, DeliveryMetrics, Dispatcher, DispatcherConfig,
    InMemoryDeadLetterStore, OutboundEvent,
};
use serde_json::json;

pub const SECRET: &str = "whsec_integration";

/// Dispatcher configuration with jitter disabled so schedules are exact.
pub fn config() -> DispatcherConfig {
    let mut config = DispatcherConfig {
        active_secrets: vec![SECRET.to_string()],
        client: ClientConfig { request_timeout: Duration::from_secs(2), ..Default::default() },
        ..Default::default()
    };
    config.retry.jitter_fraction = 0.0;
    config
}

/// A dispatcher wired to the real HTTP client, a test clock, in-memory dead
/// letters and counting metrics.
pub struct Harness {
    pub dispatcher: Dispatcher,
    pub clock: TestClock,
    pub metrics: Arc<DeliveryMetrics>,
    pub dead_letters: Arc<InMemoryDeadLetterStore>,
}

impl Harness {
    pub fn new(config: DispatcherConfig) -> Self {
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
        Self::with_store(config, dead_letters.clone(), dead_letters)
    }

    pub fn with_store(
        config: DispatcherConfig,
        store: Arc<dyn DeadLetterStore>,
        dead_letters: Arc<InMemoryDeadLetterStore>,
    ) -> Self {
        let clock = TestClock::new();
        let metrics = Arc::new(DeliveryMetrics::new());
        let transport = Arc::new(DeliveryClient::new(config.client.clone()).unwrap());
        let dispatcher = Dispatcher::builder(config)
            .transport(transport)
            .dead_letters(store)
            .metrics(metrics.clone())
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();

        Self { dispatcher, clock, metrics, dead_letters }
    }

    /// Processes everything currently due. Returns how many envelopes ran.
    pub async fn step(&self) -> usize {
        let due = self.dispatcher.queue().claim_due(self.clock.now_utc(), usize::MAX).await;
        let count = due.len();
        for envelope in due {
            let _ = self.dispatcher.process(envelope).await;
        }
        count
    }

    /// Jumps the clock to the next queued due time.
    pub async fn advance_to_next_due(&self) -> bool {
        let Some(due_at) = self.dispatcher.queue().next_due_at().await else {
            return false;
        };
        if let Ok(wait) = (due_at - self.clock.now_utc()).to_std() {
            self.clock.advance(wait);
        }
        true
    }

    /// Runs the lifecycle until the queue is empty or `max_steps` passes.
    pub async fn run_to_completion(&self, max_steps: usize) {
        for _ in 0..max_steps {
            if self.step().await == 0 && !self.advance_to_next_due().await {
                return;
            }
        }
    }
}

pub fn model_deployed(model_id: &str) -> OutboundEvent {
    OutboundEvent::new(
        EventType::ModelDeployed,
        [model_id, "v1"],
        json!({"model_id": model_id, "version": 1, "stage": "production"}),
    )
}
