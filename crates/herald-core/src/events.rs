//! Delivery lifecycle events and the metrics sink contract.
//!
//! Every state transition in the delivery pipeline is described by a
//! [`DeliveryEvent`] and handed to a [`MetricsSink`]. Sinks are passive
//! observers: they must not block and must not influence delivery.
//!
//! ```text
//! ┌────────────┐   DeliveryEvent   ┌──────────────────┐
//! │ Dispatcher │ ─────────────────▶│ MulticastMetrics │
//! │ Tracker    │                   └──────────────────┘
//! │ Scheduler  │                      │            │
//! └────────────┘                      ▼            ▼
//!                              ┌──────────┐  ┌───────────┐
//!                              │ counters │  │  tracing  │
//!                              └──────────┘  └───────────┘
//! ```

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{CircuitState, DeliveryKey, Destination, EventId, EventType};

/// Failure class used to label metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection failures and timeouts.
    Network,
    /// HTTP 4xx, plus 1xx/3xx which are never followed.
    Client,
    /// HTTP 5xx.
    Server,
    /// Consumer asked for a pause with `Retry-After`.
    RateLimit,
    /// Dead letter storage.
    Storage,
    /// Legacy broker.
    Broker,
    /// Invalid configuration or input.
    Configuration,
    /// Anything else.
    Internal,
}

impl ErrorCategory {
    /// Stable label used in metrics output.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Client => "client",
            Self::Server => "server",
            Self::RateLimit => "rate_limit",
            Self::Storage => "storage",
            Self::Broker => "broker",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State transitions reported by the delivery pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryEvent {
    /// An event was accepted by `publish`.
    Published {
        /// Published event.
        event_id: EventId,
        /// Kind of event.
        event_type: EventType,
        /// Number of webhook destinations it fans out to.
        destinations: usize,
    },

    /// A network delivery attempt is starting.
    AttemptStarted {
        /// Delivery being attempted.
        key: DeliveryKey,
        /// 1-based attempt number.
        attempt_number: u32,
    },

    /// The consumer accepted the delivery.
    Succeeded {
        /// Delivered key.
        key: DeliveryKey,
        /// Attempt that succeeded.
        attempt_number: u32,
        /// HTTP status returned.
        status_code: u16,
        /// Round-trip latency.
        latency: Duration,
    },

    /// The consumer rejected the delivery permanently.
    PermanentlyFailed {
        /// Rejected key.
        key: DeliveryKey,
        /// Attempt that was rejected.
        attempt_number: u32,
        /// HTTP status, if any.
        status_code: Option<u16>,
        /// Error description.
        error: String,
    },

    /// An attempt failed, retryable or not.
    AttemptFailed {
        /// Failed key.
        key: DeliveryKey,
        /// Attempt that failed.
        attempt_number: u32,
        /// Failure classification.
        category: ErrorCategory,
    },

    /// A retryable failure was rescheduled.
    RetryScheduled {
        /// Rescheduled key.
        key: DeliveryKey,
        /// Attempt that failed.
        attempt_number: u32,
        /// When the next attempt is due.
        next_attempt_at: DateTime<Utc>,
        /// Delay applied.
        delay: Duration,
        /// Latency of the failed attempt.
        latency: Duration,
    },

    /// The circuit breaker blocked the delivery without a network call.
    ShortCircuited {
        /// Blocked key.
        key: DeliveryKey,
        /// When the delivery will be tried again.
        retry_at: DateTime<Utc>,
    },

    /// Retries were exhausted and the envelope was dead-lettered.
    DeadLettered {
        /// Dead-lettered key.
        key: DeliveryKey,
        /// Attempts made.
        attempts: u32,
    },

    /// A dead-lettered delivery was re-injected by an operator.
    Replayed {
        /// Replayed key.
        key: DeliveryKey,
    },

    /// An event was cancelled before its first attempt completed.
    Cancelled {
        /// Cancelled event.
        event_id: EventId,
    },

    /// An in-flight attempt finished after its event was cancelled.
    OutcomeDiscarded {
        /// Key whose outcome was dropped.
        key: DeliveryKey,
    },

    /// A destination's circuit changed state.
    CircuitTransition {
        /// Destination whose circuit changed.
        destination: Destination,
        /// Previous state.
        from: CircuitState,
        /// New state.
        to: CircuitState,
    },

    /// The event was published on the legacy broker channel.
    BrokerPublished {
        /// Published event.
        event_id: EventId,
    },

    /// Publishing on the legacy broker channel failed.
    BrokerFailed {
        /// Event that failed to publish.
        event_id: EventId,
        /// Error description.
        error: String,
    },
}

impl DeliveryEvent {
    /// Stable metric name for this event.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Published { .. } => "published",
            Self::AttemptStarted { .. } => "attempt_started",
            Self::Succeeded { .. } => "succeeded",
            Self::AttemptFailed { .. } => "attempt_failed",
            Self::PermanentlyFailed { .. } => "permanently_failed",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::ShortCircuited { .. } => "short_circuited",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::Replayed { .. } => "replayed",
            Self::Cancelled { .. } => "cancelled",
            Self::OutcomeDiscarded { .. } => "outcome_discarded",
            Self::CircuitTransition { .. } => "circuit_transition",
            Self::BrokerPublished { .. } => "broker_published",
            Self::BrokerFailed { .. } => "broker_failed",
        }
    }
}

/// Passive observer of delivery events.
///
/// Implementations record counts, latencies and transitions. `record` is
/// called inline on the delivery path and must return quickly.
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    /// Records a delivery event.
    fn record(&self, event: &DeliveryEvent);
}

/// Sink that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMetrics;

impl MetricsSink for NoOpMetrics {
    fn record(&self, _event: &DeliveryEvent) {}
}

/// Sink that forwards every event to a list of subscribers.
#[derive(Debug, Clone, Default)]
pub struct MulticastMetrics {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl MulticastMetrics {
    /// Creates a multicast sink with no subscribers.
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Adds a subscriber.
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sinks.len()
    }
}

impl MetricsSink for MulticastMetrics {
    fn record(&self, event: &DeliveryEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}
