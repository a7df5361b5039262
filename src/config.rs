//! Service configuration.

use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use herald_delivery::{CircuitConfig, ClientConfig, DispatcherConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "herald.toml";
const ENV_PREFIX: &str = "HERALD_";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Complete service configuration.
///
/// Loaded in priority order:
/// 1. Environment variables prefixed with `HERALD_` (highest priority)
/// 2. `herald.toml` in the working directory
/// 3. Built-in defaults (lowest priority)
///
/// Everything except `active_secrets` has a working default, so a minimal
/// deployment sets only `HERALD_ACTIVE_SECRETS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Retry
    /// Total attempts per destination before dead-lettering.
    pub max_attempts: u32,
    /// Base of the exponential backoff in milliseconds.
    pub base_backoff_ms: u64,
    /// Ceiling on a single backoff delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Jitter as a fraction of the computed delay.
    pub jitter_fraction: f64,

    // Delivery
    /// Timeout for one outbound request in milliseconds.
    pub request_timeout_ms: u64,
    /// Maximum deliveries executing at once.
    pub max_in_flight_deliveries: usize,
    /// Signing secrets, comma-separated, newest first.
    ///
    /// Environment variable: `HERALD_ACTIVE_SECRETS`
    pub active_secrets: String,

    // Circuit breaker
    /// Consecutive retryable failures that open a destination's circuit.
    pub circuit_failure_threshold: u32,
    /// Time an open circuit waits before allowing a probe, in milliseconds.
    pub circuit_cooldown_ms: u64,

    // Legacy broker
    /// Publish every event to NATS in addition to webhooks.
    pub dual_publish_enabled: bool,
    /// NATS server URL.
    pub nats_url: String,
    /// JetStream stream capturing published events.
    pub nats_stream: String,
    /// Subject prefix; the event type is appended.
    pub nats_subject: String,

    // Server
    /// Operator API bind address.
    pub bind_addr: SocketAddr,
    /// Seconds allowed for in-flight deliveries at shutdown.
    pub shutdown_timeout_secs: u64,

    // Storage
    /// PostgreSQL URL for the dead-letter store. In-memory when unset.
    pub database_url: Option<String>,
    /// Maximum connections in the dead-letter store pool.
    pub database_max_connections: u32,

    // Logging
    /// `pretty` or `json`.
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let circuit = CircuitConfig::default();

        Self {
            max_attempts: retry.max_attempts,
            base_backoff_ms: millis(retry.base_backoff),
            max_backoff_ms: millis(retry.max_backoff),
            jitter_fraction: retry.jitter_fraction,
            request_timeout_ms: millis(ClientConfig::default().request_timeout),
            max_in_flight_deliveries: herald_delivery::config::DEFAULT_MAX_IN_FLIGHT,
            active_secrets: String::new(),
            circuit_failure_threshold: circuit.failure_threshold,
            circuit_cooldown_ms: millis(circuit.cooldown),
            dual_publish_enabled: false,
            nats_url: "nats://127.0.0.1:4222".to_string(),
            nats_stream: "HERALD_EVENTS".to_string(),
            nats_subject: herald_delivery::config::DEFAULT_BROKER_SUBJECT_PREFIX.to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            shutdown_timeout_secs: 30,
            database_url: None,
            database_max_connections: 10,
            log_format: LogFormat::Pretty,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Layered configuration sources.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Loads and validates configuration from all sources.
    ///
    /// # Errors
    ///
    /// Fails if a source cannot be parsed or the result is invalid.
    pub fn load() -> Result<Self> {
        let config: Self = Self::figment().extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Signing secrets in order, newest first.
    pub fn secrets(&self) -> Vec<String> {
        self.active_secrets
            .split(',')
            .map(str::trim)
            .filter(|secret| !secret.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Converts to the delivery subsystem's configuration.
    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_backoff: Duration::from_millis(self.base_backoff_ms),
                max_backoff: Duration::from_millis(self.max_backoff_ms),
                jitter_fraction: self.jitter_fraction,
            },
            circuit: CircuitConfig {
                failure_threshold: self.circuit_failure_threshold,
                cooldown: Duration::from_millis(self.circuit_cooldown_ms),
            },
            client: ClientConfig {
                request_timeout: Duration::from_millis(self.request_timeout_ms),
                ..ClientConfig::default()
            },
            active_secrets: self.secrets(),
            max_in_flight_deliveries: self.max_in_flight_deliveries,
            dual_publish_enabled: self.dual_publish_enabled,
            broker_subject_prefix: self.nats_subject.clone(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            ..DispatcherConfig::default()
        }
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> Option<String> {
        self.database_url.as_ref().map(|url| {
            if let Some(at_pos) = url.find('@') {
                if let Some(colon_pos) = url[..at_pos].rfind(':') {
                    let mut masked = url.clone();
                    masked.replace_range(colon_pos + 1..at_pos, "***");
                    return masked;
                }
            }
            url.clone()
        })
    }

    /// Validates settings the delivery subsystem and server depend on.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        self.to_dispatcher_config().validate().context("invalid delivery configuration")?;

        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.dual_publish_enabled && self.nats_url.trim().is_empty() {
            anyhow::bail!("nats_url is required when dual_publish_enabled is set");
        }

        Ok(())
    }
}
