//! Delivery subsystem configuration.

use std::{fmt, time::Duration};

use crate::{
    circuit::CircuitConfig,
    client::ClientConfig,
    error::{DeliveryError, Result},
    retry::RetryPolicy,
};

/// Default bound on concurrently executing deliveries.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Default subject prefix for the legacy broker channel.
pub const DEFAULT_BROKER_SUBJECT_PREFIX: &str = "herald.events";

/// Configuration of the dispatcher and its worker pool.
#[derive(Clone)]
pub struct DispatcherConfig {
    /// Backoff and retry budget.
    pub retry: RetryPolicy,

    /// Circuit breaker thresholds.
    pub circuit: CircuitConfig,

    /// HTTP client settings.
    pub client: ClientConfig,

    /// Signing secrets, newest first. The first signs; all verify.
    pub active_secrets: Vec<String>,

    /// Maximum deliveries executing at once across all destinations.
    pub max_in_flight_deliveries: usize,

    /// Publish every event to the legacy broker as well as to webhooks.
    pub dual_publish_enabled: bool,

    /// Subject prefix for broker publishes; the event type is appended.
    pub broker_subject_prefix: String,

    /// Upper bound on how long the scheduler sleeps between queue checks.
    pub poll_interval: Duration,

    /// Time allowed for in-flight deliveries during shutdown.
    pub shutdown_timeout: Duration,

    /// Events retained in the attempt ledger.
    pub attempt_history_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            circuit: CircuitConfig::default(),
            client: ClientConfig::default(),
            active_secrets: Vec::new(),
            max_in_flight_deliveries: DEFAULT_MAX_IN_FLIGHT,
            dual_publish_enabled: false,
            broker_subject_prefix: DEFAULT_BROKER_SUBJECT_PREFIX.to_string(),
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            attempt_history_capacity: 10_000,
        }
    }
}

impl DispatcherConfig {
    /// Checks the configuration for values that can never work.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` naming the first invalid
    /// setting.
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.circuit.validate()?;

        if self.active_secrets.is_empty() {
            return Err(DeliveryError::configuration("at least one signing secret is required"));
        }
        if self.max_in_flight_deliveries == 0 {
            return Err(DeliveryError::configuration("max_in_flight_deliveries must be > 0"));
        }
        if self.client.request_timeout.is_zero() {
            return Err(DeliveryError::configuration("request_timeout must be > 0"));
        }
        if self.circuit.cooldown < self.client.request_timeout {
            return Err(DeliveryError::configuration(
                "circuit cooldown must be at least the request timeout",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(DeliveryError::configuration("poll_interval must be > 0"));
        }
        if self.dual_publish_enabled && self.broker_subject_prefix.trim().is_empty() {
            return Err(DeliveryError::configuration(
                "broker_subject_prefix is required when dual publish is enabled",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for DispatcherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherConfig")
            .field("retry", &self.retry)
            .field("circuit", &self.circuit)
            .field("client", &self.client)
            .field("active_secrets", &format_args!("[{} redacted]", self.active_secrets.len()))
            .field("max_in_flight_deliveries", &self.max_in_flight_deliveries)
            .field("dual_publish_enabled", &self.dual_publish_enabled)
            .field("broker_subject_prefix", &self.broker_subject_prefix)
            .field("poll_interval", &self.poll_interval)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("attempt_history_capacity", &self.attempt_history_capacity)
            .finish()
    }
}
