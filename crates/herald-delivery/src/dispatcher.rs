//! The dispatcher: the single entry point for publishing events.
//!
//! `publish` validates the destinations, derives the idempotency key and
//! hands the event to every enabled channel. The worker pool then calls
//! [`Dispatcher::process`] for each envelope that comes due, which runs
//! one pass of the delivery lifecycle:
//!
//! ```text
//!   due envelope
//!        │
//!        ▼
//!   cancelled? ──yes──▶ drop
//!        │
//!        ▼
//!   circuit admits? ──no──▶ defer (no attempt recorded)
//!        │
//!        ▼
//!   sign + POST ──▶ classify
//!                     ├─ 2xx ─────────────▶ Delivered
//!                     ├─ permanent 4xx ───▶ Failed
//!                     └─ retryable ───────▶ reschedule or dead-letter
//! ```

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use herald_core::{
    AttemptOutcome, Clock, DeadLetterEntry, DeliveryAttempt, DeliveryEvent, DeliveryStatus,
    Destination, Envelope, EventId, EventType, IdempotencyKey, MetricsSink, NoOpMetrics,
    RealClock,
};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::{
    channel::{BrokerChannel, BrokerPublisher, PublishChannel, PublishedEvent, WebhookChannel},
    circuit::{Admission, EndpointHealth, HealthTracker},
    client::{DeliveryClient, DeliveryRequest, Transport},
    config::DispatcherConfig,
    dead_letter::{DeadLetterFilter, DeadLetterStore, InMemoryDeadLetterStore},
    error::{DeliveryError, Result},
    ledger::{AttemptRecorded, CancelError, DeliveryLedger, DestinationStatus},
    queue::PendingQueue,
    retry::RetryScheduler,
    signing::Signer,
};

/// A business event to announce.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OutboundEvent {
    /// Kind of event.
    pub event_type: EventType,
    /// Identifiers of the business object, e.g. model id and version. The
    /// idempotency key is derived from these and the event type.
    pub business_ids: Vec<String>,
    /// Event-specific payload.
    pub payload: serde_json::Value,
}

impl OutboundEvent {
    /// Creates an outbound event.
    pub fn new<S: Into<String>>(
        event_type: EventType,
        business_ids: impl IntoIterator<Item = S>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            business_ids: business_ids.into_iter().map(Into::into).collect(),
            payload,
        }
    }
}

#[derive(Debug)]
struct Inner {
    config: DispatcherConfig,
    signer: Signer,
    transport: Arc<dyn Transport>,
    queue: Arc<PendingQueue>,
    ledger: Arc<DeliveryLedger>,
    tracker: Arc<HealthTracker>,
    scheduler: RetryScheduler,
    dead_letters: Arc<dyn DeadLetterStore>,
    channels: Vec<Arc<dyn PublishChannel>>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

/// Publishes events and drives each delivery through its lifecycle.
///
/// Cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

/// Builder for [`Dispatcher`].
///
/// Unset collaborators default to the `reqwest` transport, an in-memory dead
/// letter store, no metrics and the system clock.
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    transport: Option<Arc<dyn Transport>>,
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    clock: Option<Arc<dyn Clock>>,
    broker: Option<Arc<dyn BrokerPublisher>>,
}

impl DispatcherBuilder {
    /// Starts a builder from configuration.
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Self {
        Self { config, transport: None, dead_letters: None, metrics: None, clock: None, broker: None }
    }

    /// Sets the delivery transport.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the dead letter store.
    #[must_use]
    pub fn dead_letters(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = Some(store);
        self
    }

    /// Sets the metrics sink.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Sets the clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the legacy broker publisher used when dual publish is enabled.
    #[must_use]
    pub fn broker(mut self, broker: Arc<dyn BrokerPublisher>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Validates the configuration and assembles the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` for invalid settings, a
    /// missing signing secret, or dual publish without a broker.
    pub fn build(self) -> Result<Dispatcher> {
        let config = self.config;
        config.validate()?;

        let signer = Signer::new(&config.active_secrets)?;
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(DeliveryClient::new(config.client.clone())?),
        };
        let dead_letters =
            self.dead_letters.unwrap_or_else(|| Arc::new(InMemoryDeadLetterStore::new()));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoOpMetrics));
        let clock = self.clock.unwrap_or_else(|| Arc::new(RealClock::new()));

        let queue = Arc::new(PendingQueue::new());
        let ledger = Arc::new(DeliveryLedger::new(config.attempt_history_capacity));
        let tracker =
            Arc::new(HealthTracker::new(config.circuit.clone(), clock.clone(), metrics.clone()));
        let scheduler = RetryScheduler::new(
            config.retry.clone(),
            queue.clone(),
            dead_letters.clone(),
            ledger.clone(),
            metrics.clone(),
            clock.clone(),
        );

        let mut channels: Vec<Arc<dyn PublishChannel>> =
            vec![Arc::new(WebhookChannel::new(queue.clone(), ledger.clone()))];
        match (config.dual_publish_enabled, self.broker) {
            (true, Some(publisher)) => channels.push(Arc::new(BrokerChannel::new(
                publisher,
                config.broker_subject_prefix.clone(),
                metrics.clone(),
            ))),
            (true, None) => {
                return Err(DeliveryError::configuration(
                    "dual publish is enabled but no broker publisher is configured",
                ));
            },
            (false, Some(_)) => warn!("broker publisher ignored because dual publish is disabled"),
            (false, None) => {},
        }

        info!(
            max_attempts = config.retry.max_attempts,
            failure_threshold = config.circuit.failure_threshold,
            max_in_flight = config.max_in_flight_deliveries,
            dual_publish = config.dual_publish_enabled,
            secrets = signer.secret_count(),
            "dispatcher initialized"
        );

        Ok(Dispatcher {
            inner: Arc::new(Inner {
                config,
                signer,
                transport,
                queue,
                ledger,
                tracker,
                scheduler,
                dead_letters,
                channels,
                metrics,
                clock,
            }),
        })
    }
}

impl Dispatcher {
    /// Starts a builder.
    pub fn builder(config: DispatcherConfig) -> DispatcherBuilder {
        DispatcherBuilder::new(config)
    }

    /// Publishes an event to every destination and returns its id.
    ///
    /// Returns once the deliveries are queued; the caller never waits on
    /// consumers. Duplicate destinations are delivered once. Every
    /// destination receives the same idempotency key.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` for an invalid destination URL,
    /// an empty destination list, or missing business identifiers.
    pub async fn publish<I, S>(&self, event: OutboundEvent, destinations: I) -> Result<EventId>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let destinations = destinations
            .into_iter()
            .map(|raw| Destination::parse(raw.as_ref()))
            .collect::<herald_core::Result<BTreeSet<_>>>()?;

        if destinations.is_empty() {
            return Err(DeliveryError::configuration("at least one destination is required"));
        }
        if event.business_ids.is_empty() {
            return Err(DeliveryError::configuration(
                "business identifiers are required to derive the idempotency key",
            ));
        }

        let published = PublishedEvent {
            event_id: EventId::new(),
            idempotency_key: IdempotencyKey::derive(event.event_type, &event.business_ids),
            event_type: event.event_type,
            payload: event.payload,
            created_at: self.inner.clock.now_utc(),
            destinations: destinations.into_iter().collect(),
        };

        for channel in &self.inner.channels {
            if let Err(e) = channel.publish(&published).await {
                warn!(
                    event_id = %published.event_id,
                    channel = channel.name(),
                    error = %e,
                    "publish channel failed"
                );
            }
        }

        self.inner.metrics.record(&DeliveryEvent::Published {
            event_id: published.event_id,
            event_type: published.event_type,
            destinations: published.destinations.len(),
        });
        info!(
            event_id = %published.event_id,
            event_type = %published.event_type,
            destinations = published.destinations.len(),
            "event published"
        );

        Ok(published.event_id)
    }

    /// Runs one lifecycle step for a due envelope.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if an exhausted delivery could not be
    /// written to the dead letter store. The envelope stays queued in that
    /// case.
    pub async fn process(&self, mut envelope: Envelope) -> Result<()> {
        let inner = &self.inner;
        let key = envelope.key();

        if inner.ledger.is_cancelled(key.event_id).await {
            debug!(event_id = %key.event_id, destination = %key.destination, "event cancelled, delivery dropped");
            return Ok(());
        }

        if inner.scheduler.policy().is_exhausted(envelope.attempt_count) {
            let last_error = inner
                .ledger
                .attempts_for(&key)
                .await
                .into_iter()
                .rev()
                .find_map(|attempt| attempt.error)
                .unwrap_or_else(|| "retries exhausted".to_string());
            return inner.scheduler.dead_letter(envelope, last_error).await;
        }

        let probe = match inner.tracker.acquire(&envelope.destination).await {
            Admission::Allowed { probe } => probe,
            Admission::Rejected { retry_after } => {
                inner.scheduler.defer(envelope, retry_after).await;
                return Ok(());
            },
        };

        envelope.attempt_count = envelope.attempt_count.saturating_add(1);
        let attempt_number = envelope.attempt_count;
        let signature = inner.signer.sign(
            &envelope.idempotency_key,
            &envelope.payload,
            inner.clock.unix_timestamp(),
        );
        envelope.signature = Some(signature.clone());

        inner.metrics.record(&DeliveryEvent::AttemptStarted { key: key.clone(), attempt_number });
        debug!(
            event_id = %key.event_id,
            destination = %key.destination,
            attempt = attempt_number,
            probe,
            "delivery attempt starting"
        );

        let attempted_at = inner.clock.now_utc();
        let started = inner.clock.now();
        let (http_status, outcome, latency) =
            match self.send(DeliveryRequest::from_envelope(&envelope, signature)).await {
                Ok(response) => (
                    Some(response.status_code),
                    response.classify(inner.clock.now_utc()),
                    response.duration,
                ),
                Err(e) => (None, Err(e), inner.clock.now().duration_since(started)),
            };

        match &outcome {
            Ok(()) => inner.tracker.record_success(&key.destination, probe).await,
            Err(e) if e.is_retryable() => {
                inner.tracker.record_failure(&key.destination, probe).await;
            },
            Err(_) if probe => inner.tracker.release_probe(&key.destination).await,
            Err(_) => {},
        }

        let attempt = DeliveryAttempt {
            event_id: key.event_id,
            destination: key.destination.clone(),
            attempt_number,
            attempted_at,
            http_status,
            error: outcome.as_ref().err().map(ToString::to_string),
            latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            outcome: match &outcome {
                Ok(()) => AttemptOutcome::Success,
                Err(e) if e.is_retryable() => AttemptOutcome::RetryableFailure,
                Err(_) => AttemptOutcome::PermanentFailure,
            },
        };

        if inner.ledger.record_attempt(attempt).await == AttemptRecorded::Discarded {
            inner.metrics.record(&DeliveryEvent::OutcomeDiscarded { key: key.clone() });
            info!(
                event_id = %key.event_id,
                destination = %key.destination,
                attempt = attempt_number,
                "event cancelled during attempt, outcome discarded"
            );
            return Ok(());
        }

        if let Err(e) = &outcome {
            inner.metrics.record(&DeliveryEvent::AttemptFailed {
                key: key.clone(),
                attempt_number,
                category: e.category(),
            });
        }

        match outcome {
            Ok(()) => {
                inner.ledger.set_status(&key, DeliveryStatus::Delivered).await;
                let status_code = http_status.unwrap_or_default();
                inner.metrics.record(&DeliveryEvent::Succeeded {
                    key: key.clone(),
                    attempt_number,
                    status_code,
                    latency,
                });
                info!(
                    event_id = %key.event_id,
                    destination = %key.destination,
                    attempt = attempt_number,
                    status_code,
                    duration_ms = latency.as_millis(),
                    "delivery succeeded"
                );
                Ok(())
            },
            Err(e) if e.is_retryable() => {
                inner.scheduler.schedule(envelope, &e, latency).await.map(|_| ())
            },
            Err(e) => {
                inner.ledger.set_status(&key, DeliveryStatus::Failed).await;
                inner.metrics.record(&DeliveryEvent::PermanentlyFailed {
                    key: key.clone(),
                    attempt_number,
                    status_code: e.status_code(),
                    error: e.to_string(),
                });
                error!(
                    event_id = %key.event_id,
                    destination = %key.destination,
                    attempt = attempt_number,
                    status_code = e.status_code(),
                    error = %e,
                    "delivery rejected permanently"
                );
                Ok(())
            },
        }
    }

    /// Sends through the transport, bounded by the request timeout even if
    /// the transport does not enforce one itself.
    async fn send(&self, request: DeliveryRequest) -> Result<crate::client::DeliveryResponse> {
        let timeout = self.inner.config.client.request_timeout;
        match tokio::time::timeout(timeout, self.inner.transport.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::timeout(timeout)),
        }
    }

    /// Cancels an event before any of its attempts has completed.
    ///
    /// Queued deliveries are removed; attempts already in flight run to
    /// completion and their outcome is discarded.
    ///
    /// # Errors
    ///
    /// Returns `CancelError::AlreadyStarted` if an attempt has completed and
    /// `CancelError::NotFound` for unknown events.
    pub async fn cancel(&self, event_id: EventId) -> std::result::Result<(), CancelError> {
        self.inner.ledger.cancel(event_id).await?;
        let removed = self.inner.queue.remove_event(event_id).await;

        self.inner.metrics.record(&DeliveryEvent::Cancelled { event_id });
        info!(event_id = %event_id, removed = removed.len(), "event cancelled");
        Ok(())
    }

    /// Re-injects every dead-lettered delivery of an event.
    ///
    /// Each envelope restarts with `attempt_count = 0` and is due
    /// immediately. Returns the number of deliveries replayed; zero means
    /// nothing was dead-lettered for the event.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if the dead letter store fails.
    pub async fn replay(&self, event_id: EventId) -> Result<usize> {
        let entries = self.inner.dead_letters.take(event_id).await?;
        let now = self.inner.clock.now_utc();

        for DeadLetterEntry { mut envelope, .. } in entries.iter().cloned() {
            let key = envelope.key();
            envelope.reset_for_replay(now);
            self.inner.ledger.reopen(&key).await;
            self.inner.queue.push(envelope).await;

            self.inner.metrics.record(&DeliveryEvent::Replayed { key: key.clone() });
            info!(event_id = %key.event_id, destination = %key.destination, "dead letter replayed");
        }

        Ok(entries.len())
    }

    /// Attempt history of an event, oldest first.
    pub async fn attempts(&self, event_id: EventId) -> Option<Vec<DeliveryAttempt>> {
        self.inner.ledger.attempts(event_id).await
    }

    /// Per-destination status of an event.
    pub async fn deliveries(&self, event_id: EventId) -> Option<Vec<DestinationStatus>> {
        self.inner.ledger.statuses(event_id).await
    }

    /// Lists dead-lettered deliveries.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if the store fails.
    pub async fn dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        self.inner.dead_letters.list(filter).await
    }

    /// Health of every destination seen so far.
    pub async fn circuits(&self) -> Vec<(Destination, EndpointHealth)> {
        self.inner.tracker.all().await
    }

    /// Number of deliveries waiting in the queue.
    pub async fn pending_count(&self) -> usize {
        self.inner.queue.len().await
    }

    /// The pending-delivery queue.
    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.inner.queue
    }

    /// The endpoint health tracker.
    pub fn tracker(&self) -> &Arc<HealthTracker> {
        &self.inner.tracker
    }

    /// The clock driving schedules.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Active configuration.
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Maximum concurrent deliveries.
    pub fn max_in_flight(&self) -> usize {
        self.inner.config.max_in_flight_deliveries
    }

    /// How long the scheduler may sleep between queue checks.
    pub fn poll_interval(&self) -> Duration {
        self.inner.config.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use herald_core::TestClock;
    use serde_json::json;

    use super::*;
    use crate::client::DeliveryResponse;

    #[derive(Debug, Default)]
    struct ScriptedTransport {
        statuses: Mutex<Vec<u16>>,
        requests: Mutex<Vec<DeliveryRequest>>,
    }

    impl ScriptedTransport {
        fn replying(statuses: &[u16]) -> Arc<Self> {
            Arc::new(Self { statuses: Mutex::new(statuses.to_vec()), ..Default::default() })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
            self.requests.lock().unwrap().push(request);
            let mut statuses = self.statuses.lock().unwrap();
            let status_code = if statuses.is_empty() { 200 } else { statuses.remove(0) };
            Ok(DeliveryResponse {
                status_code,
                headers: std::collections::HashMap::new(),
                body: String::new(),
                duration: Duration::from_millis(5),
            })
        }
    }

    fn config() -> DispatcherConfig {
        let mut config =
            DispatcherConfig { active_secrets: vec!["secret".into()], ..Default::default() };
        config.retry.jitter_fraction = 0.0;
        config
    }

    fn dispatcher(transport: Arc<ScriptedTransport>, clock: &TestClock) -> Dispatcher {
        Dispatcher::builder(config())
            .transport(transport)
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap()
    }

    fn deployed() -> OutboundEvent {
        OutboundEvent::new(EventType::ModelDeployed, ["model-1", "v3"], json!({"model_id": "model-1"}))
    }

    #[tokio::test]
    async fn publish_rejects_invalid_input() {
        let clock = TestClock::new();
        let dispatcher = dispatcher(ScriptedTransport::replying(&[]), &clock);

        let invalid_url = dispatcher.publish(deployed(), ["not a url"]).await;
        assert!(matches!(invalid_url, Err(DeliveryError::Configuration { .. })));

        let none = dispatcher.publish(deployed(), Vec::<String>::new()).await;
        assert!(matches!(none, Err(DeliveryError::Configuration { .. })));

        let no_ids = OutboundEvent::new(EventType::ModelDeployed, Vec::<String>::new(), json!({}));
        assert!(dispatcher.publish(no_ids, ["https://a.test/"]).await.is_err());
        assert_eq!(dispatcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn publish_deduplicates_destinations_and_shares_key() {
        let clock = TestClock::new();
        let transport = ScriptedTransport::replying(&[]);
        let dispatcher = dispatcher(transport.clone(), &clock);

        let event_id = dispatcher
            .publish(deployed(), ["https://a.test/hook", "https://a.test/hook", "https://b.test/hook"])
            .await
            .unwrap();

        for envelope in dispatcher.queue().claim_due(clock.now_utc(), 10).await {
            dispatcher.process(envelope).await.unwrap();
        }

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].idempotency_key, requests[1].idempotency_key);
        let statuses = dispatcher.deliveries(event_id).await.unwrap();
        assert!(statuses.iter().all(|s| s.status == DeliveryStatus::Delivered));
    }

    #[tokio::test]
    async fn retryable_failure_requeues_without_blocking() {
        let clock = TestClock::new();
        let dispatcher = dispatcher(ScriptedTransport::replying(&[503]), &clock);
        let event_id = dispatcher.publish(deployed(), ["https://a.test/"]).await.unwrap();

        let envelope = dispatcher.queue().claim_due(clock.now_utc(), 1).await.remove(0);
        dispatcher.process(envelope).await.unwrap();

        assert!(dispatcher.queue().claim_due(clock.now_utc(), 1).await.is_empty());
        let due = dispatcher.queue().next_due_at().await.unwrap();
        assert_eq!((due - clock.now_utc()).num_seconds(), 2);
        let attempts = dispatcher.attempts(event_id).await.unwrap();
        assert_eq!(attempts[0].outcome, AttemptOutcome::RetryableFailure);
        assert_eq!(attempts[0].http_status, Some(503));
    }

    #[tokio::test]
    async fn permanent_failure_during_probe_releases_it() {
        let clock = TestClock::new();
        let dispatcher = dispatcher(ScriptedTransport::replying(&[422]), &clock);
        let destination = Destination::parse("https://a.test/").unwrap();
        dispatcher.tracker().force_state(&destination, herald_core::CircuitState::HalfOpen).await;

        dispatcher.publish(deployed(), ["https://a.test/"]).await.unwrap();
        let envelope = dispatcher.queue().claim_due(clock.now_utc(), 1).await.remove(0);
        dispatcher.process(envelope).await.unwrap();

        let health = dispatcher.tracker().snapshot(&destination).await.unwrap();
        assert_eq!(health.state, herald_core::CircuitState::HalfOpen);
        assert!(!health.half_open_probe_in_flight);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn dual_publish_requires_broker() {
        let mut config = config();
        config.dual_publish_enabled = true;
        let result = Dispatcher::builder(config).transport(ScriptedTransport::replying(&[])).build();
        assert!(matches!(result, Err(DeliveryError::Configuration { .. })));
    }
}
