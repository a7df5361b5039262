//! Metrics sink implementations.
//!
//! [`DeliveryMetrics`] keeps process-local counters that the operator API
//! exposes as a JSON snapshot. [`TracingMetrics`] turns every delivery event
//! into a debug log line. Both are usually combined through
//! [`herald_core::MulticastMetrics`].

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use herald_core::{DeliveryEvent, MetricsSink};
use serde::Serialize;
use tracing::debug;

/// Lock-free counters over the delivery lifecycle.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    published: AtomicU64,
    attempts: AtomicU64,
    succeeded: AtomicU64,
    permanently_failed: AtomicU64,
    retries_scheduled: AtomicU64,
    short_circuited: AtomicU64,
    dead_lettered: AtomicU64,
    replayed: AtomicU64,
    cancelled: AtomicU64,
    outcomes_discarded: AtomicU64,
    broker_published: AtomicU64,
    broker_failed: AtomicU64,
    completed_attempts: AtomicU64,
    total_latency_ms: AtomicU64,
    circuit_transitions: Mutex<BTreeMap<String, u64>>,
    failures_by_category: Mutex<BTreeMap<String, u64>>,
}

/// Point-in-time copy of [`DeliveryMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Events accepted by `publish`.
    pub published: u64,
    /// Network attempts started.
    pub attempts: u64,
    /// Deliveries accepted by consumers.
    pub succeeded: u64,
    /// Deliveries rejected permanently.
    pub permanently_failed: u64,
    /// Retryable failures that were rescheduled.
    pub retries_scheduled: u64,
    /// Deliveries deferred by an open circuit.
    pub short_circuited: u64,
    /// Deliveries moved to the dead letter store.
    pub dead_lettered: u64,
    /// Deliveries replayed from the dead letter store.
    pub replayed: u64,
    /// Events cancelled before their first attempt.
    pub cancelled: u64,
    /// Attempt outcomes dropped because the event was cancelled.
    pub outcomes_discarded: u64,
    /// Events published to the legacy broker.
    pub broker_published: u64,
    /// Failed legacy broker publishes.
    pub broker_failed: u64,
    /// Mean latency of completed attempts that received a response.
    pub mean_latency_ms: u64,
    /// Circuit transitions keyed `"<from>-><to>"`.
    pub circuit_transitions: BTreeMap<String, u64>,
    /// Failed attempts keyed by error category.
    pub failures_by_category: BTreeMap<String, u64>,
}

impl DeliveryMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = self.completed_attempts.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);
        let circuit_transitions =
            self.circuit_transitions.lock().map(|map| map.clone()).unwrap_or_default();
        let failures_by_category =
            self.failures_by_category.lock().map(|map| map.clone()).unwrap_or_default();

        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            permanently_failed: self.permanently_failed.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            outcomes_discarded: self.outcomes_discarded.load(Ordering::Relaxed),
            broker_published: self.broker_published.load(Ordering::Relaxed),
            broker_failed: self.broker_failed.load(Ordering::Relaxed),
            mean_latency_ms: total_latency.checked_div(completed).unwrap_or(0),
            circuit_transitions,
            failures_by_category,
        }
    }

    fn observe_latency(&self, latency: std::time::Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.completed_attempts.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(millis, Ordering::Relaxed);
    }
}

impl MetricsSink for DeliveryMetrics {
    fn record(&self, event: &DeliveryEvent) {
        let counter = match event {
            DeliveryEvent::Published { .. } => &self.published,
            DeliveryEvent::AttemptStarted { .. } => &self.attempts,
            DeliveryEvent::Succeeded { latency, .. } => {
                self.observe_latency(*latency);
                &self.succeeded
            },
            DeliveryEvent::AttemptFailed { category, .. } => {
                if let Ok(mut failures) = self.failures_by_category.lock() {
                    *failures.entry(category.as_str().to_string()).or_insert(0) += 1;
                }
                return;
            },
            DeliveryEvent::PermanentlyFailed { .. } => &self.permanently_failed,
            DeliveryEvent::RetryScheduled { latency, .. } => {
                self.observe_latency(*latency);
                &self.retries_scheduled
            },
            DeliveryEvent::ShortCircuited { .. } => &self.short_circuited,
            DeliveryEvent::DeadLettered { .. } => &self.dead_lettered,
            DeliveryEvent::Replayed { .. } => &self.replayed,
            DeliveryEvent::Cancelled { .. } => &self.cancelled,
            DeliveryEvent::OutcomeDiscarded { .. } => &self.outcomes_discarded,
            DeliveryEvent::BrokerPublished { .. } => &self.broker_published,
            DeliveryEvent::BrokerFailed { .. } => &self.broker_failed,
            DeliveryEvent::CircuitTransition { from, to, .. } => {
                if let Ok(mut transitions) = self.circuit_transitions.lock() {
                    *transitions.entry(format!("{from}->{to}")).or_insert(0) += 1;
                }
                return;
            },
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Sink that logs every delivery event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record(&self, event: &DeliveryEvent) {
        debug!(metric = event.name(), event = ?event, "delivery event");
    }
}
