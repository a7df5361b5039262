//! Per-destination circuit breaker.
//!
//! Tracks the health of every destination and gates delivery attempts. All
//! mutation goes through [`HealthTracker::transition`], which holds the
//! tracker lock for the whole read-modify-write, so the half-open probe
//! guard is enforced by mutual exclusion rather than by a racy check.
//!
//! # State machine
//!
//! ```text
//!             threshold consecutive failures
//!   ┌────────┐ ──────────────────────────────▶ ┌────────┐
//!   │ CLOSED │                                 │  OPEN  │◀───────┐
//!   └────────┘ ◀─────────┐                     └────────┘        │
//!                        │ probe succeeds          │             │ probe fails
//!                        │                         │ cooldown    │ (cooldown restarts)
//!                        │                         ▼ elapsed     │
//!                        │                    ┌───────────┐      │
//!                        └─────────────────── │ HALF_OPEN │ ─────┘
//!                                             └───────────┘
//!                                          exactly one probe in flight
//! ```

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use herald_core::{CircuitState, Clock, DeliveryEvent, Destination, MetricsSink};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, Result};

/// Circuit breaker thresholds shared by all destinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive retryable failures that open the circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting a probe.
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown: Duration::from_secs(30) }
    }
}

impl CircuitConfig {
    /// Validates thresholds.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` for a zero failure threshold.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(DeliveryError::configuration("circuit failure_threshold must be > 0"));
        }
        Ok(())
    }
}

/// Health state of one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointHealth {
    /// Current circuit state.
    pub state: CircuitState,
    /// Retryable failures since the last success.
    pub consecutive_failures: u32,
    /// Successes since the last failure.
    pub consecutive_successes: u32,
    /// When the circuit last opened.
    pub opened_at: Option<DateTime<Utc>>,
    /// Whether the single half-open probe is currently in flight.
    pub half_open_probe_in_flight: bool,
}

impl EndpointHealth {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            half_open_probe_in_flight: false,
        }
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.consecutive_successes = 0;
        self.half_open_probe_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.consecutive_failures = 0;
        self.half_open_probe_in_flight = false;
    }

    fn remaining_cooldown(&self, now: DateTime<Utc>, cooldown: Duration) -> Duration {
        let Some(opened_at) = self.opened_at else {
            return Duration::ZERO;
        };
        let elapsed = (now - opened_at).to_std().unwrap_or(Duration::ZERO);
        cooldown.saturating_sub(elapsed)
    }
}

/// Decision returned when a delivery asks to go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The attempt may proceed.
    Allowed {
        /// Whether this attempt is the half-open probe.
        probe: bool,
    },
    /// The attempt must not touch the network.
    Rejected {
        /// Time until the circuit may admit a probe.
        retry_after: Duration,
    },
}

impl Admission {
    /// Whether the attempt may proceed.
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Process-wide registry of destination health.
#[derive(Debug)]
pub struct HealthTracker {
    config: CircuitConfig,
    endpoints: Mutex<HashMap<Destination, EndpointHealth>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl HealthTracker {
    /// Creates a tracker with no known destinations.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { config, endpoints: Mutex::new(HashMap::new()), clock, metrics }
    }

    /// Asks whether a delivery to `destination` may go out now.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open and
    /// admits the caller as the probe. Concurrent callers see the probe flag
    /// already set and are rejected until the probe resolves.
    pub async fn acquire(&self, destination: &Destination) -> Admission {
        let cooldown = self.config.cooldown;
        self.transition(destination, |health, now| match health.state {
            CircuitState::Closed => Admission::Allowed { probe: false },
            CircuitState::Open => {
                let remaining = health.remaining_cooldown(now, cooldown);
                if remaining.is_zero() {
                    health.state = CircuitState::HalfOpen;
                    health.half_open_probe_in_flight = true;
                    Admission::Allowed { probe: true }
                } else {
                    Admission::Rejected { retry_after: remaining }
                }
            },
            CircuitState::HalfOpen => {
                if health.half_open_probe_in_flight {
                    Admission::Rejected { retry_after: Duration::ZERO }
                } else {
                    health.half_open_probe_in_flight = true;
                    Admission::Allowed { probe: true }
                }
            },
        })
        .await
    }

    /// Records a successful delivery.
    ///
    /// While the circuit is open or half-open only the probe's outcome
    /// counts. A delivery admitted before the circuit opened may still be
    /// in flight and its result is ignored.
    pub async fn record_success(&self, destination: &Destination, probe: bool) {
        self.transition(destination, |health, _| {
            if !probe && health.state != CircuitState::Closed {
                debug!(destination = %destination, state = %health.state, "ignoring stale success");
                return;
            }
            health.consecutive_failures = 0;
            health.consecutive_successes = health.consecutive_successes.saturating_add(1);
            if health.state == CircuitState::HalfOpen {
                health.close();
            }
        })
        .await;
    }

    /// Records a retryable failure. Same stale-outcome rule as
    /// [`record_success`](Self::record_success).
    pub async fn record_failure(&self, destination: &Destination, probe: bool) {
        let threshold = self.config.failure_threshold;
        self.transition(destination, |health, now| {
            if !probe && health.state != CircuitState::Closed {
                debug!(destination = %destination, state = %health.state, "ignoring stale failure");
                return;
            }
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            health.consecutive_successes = 0;
            match health.state {
                CircuitState::Closed if health.consecutive_failures >= threshold => health.open(now),
                CircuitState::HalfOpen => health.open(now),
                CircuitState::Closed | CircuitState::Open => {},
            }
        })
        .await;
    }

    /// Releases a half-open probe whose outcome says nothing about health.
    ///
    /// Used when the probe was rejected permanently (4xx): the endpoint
    /// answered, but not in a way that proves recovery.
    pub async fn release_probe(&self, destination: &Destination) {
        self.transition(destination, |health, _| {
            if health.state == CircuitState::HalfOpen {
                health.half_open_probe_in_flight = false;
            }
        })
        .await;
    }

    /// Current health of one destination.
    pub async fn snapshot(&self, destination: &Destination) -> Option<EndpointHealth> {
        self.endpoints.lock().await.get(destination).cloned()
    }

    /// Health of every destination seen so far, ordered by destination.
    pub async fn all(&self) -> Vec<(Destination, EndpointHealth)> {
        let mut all: Vec<_> = self
            .endpoints
            .lock()
            .await
            .iter()
            .map(|(destination, health)| (destination.clone(), health.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Forces a destination into a state (for tests and operator tooling).
    pub async fn force_state(&self, destination: &Destination, state: CircuitState) {
        self.transition(destination, |health, now| match state {
            CircuitState::Closed => health.close(),
            CircuitState::Open => health.open(now),
            CircuitState::HalfOpen => {
                health.state = CircuitState::HalfOpen;
                health.half_open_probe_in_flight = false;
            },
        })
        .await;
    }

    /// Applies `step` to a destination's health under the tracker lock.
    ///
    /// Entries are created lazily. State changes are logged and reported to
    /// the metrics sink after the step runs.
    async fn transition<T>(
        &self,
        destination: &Destination,
        step: impl FnOnce(&mut EndpointHealth, DateTime<Utc>) -> T,
    ) -> T {
        let now = self.clock.now_utc();
        let (output, from, to) = {
            let mut endpoints = self.endpoints.lock().await;
            let health = endpoints.entry(destination.clone()).or_insert_with(EndpointHealth::new);
            let from = health.state;
            let output = step(health, now);
            (output, from, health.state)
        };

        if from != to {
            match to {
                CircuitState::Open => {
                    warn!(destination = %destination, from = %from, state = %to, "circuit opened");
                },
                CircuitState::Closed => {
                    info!(destination = %destination, from = %from, state = %to, "circuit closed");
                },
                CircuitState::HalfOpen => {
                    debug!(destination = %destination, from = %from, state = %to, "circuit half-open");
                },
            }
            self.metrics.record(&DeliveryEvent::CircuitTransition {
                destination: destination.clone(),
                from,
                to,
            });
        }

        output
    }
}
