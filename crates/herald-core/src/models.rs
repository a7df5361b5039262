//! Domain models and strongly-typed identifiers.
//!
//! Defines the event envelope that flows through the delivery pipeline, the
//! immutable delivery attempt record, dead-letter entries, and newtype
//! wrappers that keep identifiers, keys and destinations from being mixed up.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Strongly-typed event identifier.
///
/// Assigned once when an event is published and shared by every destination
/// the event fans out to.
///
/// # Example
///
/// ```
/// use herald_core::models::EventId;
/// let event_id = EventId::new();
/// println!("publishing event: {}", event_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for EventId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoreError::invalid(format!("invalid event id '{s}': {e}")))
    }
}

/// Kind of business event being announced to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new model was registered.
    ModelRegistered,
    /// A model version passed validation and may be deployed.
    ModelReadyForDeploy,
    /// A model version was deployed.
    ModelDeployed,
    /// A model version was archived.
    ModelArchived,
}

impl EventType {
    /// All known event types.
    pub const ALL: [Self; 4] =
        [Self::ModelRegistered, Self::ModelReadyForDeploy, Self::ModelDeployed, Self::ModelArchived];

    /// Wire name of the event type.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ModelRegistered => "model_registered",
            Self::ModelReadyForDeploy => "model_ready_for_deploy",
            Self::ModelDeployed => "model_deployed",
            Self::ModelArchived => "model_archived",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == s)
            .ok_or_else(|| CoreError::invalid(format!("unknown event type '{s}'")))
    }
}

/// Deterministic key consumers use to discard duplicate deliveries.
///
/// Derived from the event type and the caller's business identifiers (for
/// example model id and version). Identical inputs always produce the same
/// key, so re-deliveries and duplicate emissions collapse at the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derives the key from the event type and ordered business identifiers.
    ///
    /// Each component is length-prefixed before hashing so that
    /// `["ab", "c"]` and `["a", "bc"]` never collide.
    pub fn derive<S: AsRef<str>>(event_type: EventType, business_ids: &[S]) -> Self {
        let mut hasher = Sha256::new();
        let mut absorb = |part: &[u8]| {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        };

        absorb(event_type.as_str().as_bytes());
        for id in business_ids {
            absorb(id.as_ref().as_bytes());
        }

        Self(hex::encode(hasher.finalize()))
    }

    /// Wraps a key that was previously derived, e.g. when loading from storage.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated consumer endpoint URL.
///
/// Only absolute `http`/`https` URLs with a host are accepted. The parsed
/// form is stored so that equivalent spellings compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Destination(String);

impl Destination {
    /// Parses and validates a destination URL.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for malformed URLs, non-HTTP schemes,
    /// or URLs without a host.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = url::Url::parse(raw)
            .map_err(|e| CoreError::invalid(format!("invalid destination '{raw}': {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(CoreError::invalid(format!(
                "destination '{raw}' must use http or https, got '{}'",
                url.scheme()
            )));
        }

        if url.host_str().map_or(true, str::is_empty) {
            return Err(CoreError::invalid(format!("destination '{raw}' has no host")));
        }

        Ok(Self(url.into()))
    }

    /// Returns the URL as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host portion of the URL, used to label per-host resources.
    pub fn host(&self) -> Option<String> {
        url::Url::parse(&self.0).ok().and_then(|url| url.host_str().map(str::to_string))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Destination {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Destination> for String {
    fn from(destination: Destination) -> Self {
        destination.0
    }
}

impl FromStr for Destination {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Identity of one logical delivery: an event bound to one destination.
///
/// Fan-out produces one key per destination, each with its own retry
/// timeline and circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryKey {
    /// Event being delivered.
    pub event_id: EventId,
    /// Destination receiving the event.
    pub destination: Destination,
}

impl fmt::Display for DeliveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.event_id, self.destination)
    }
}

/// Signature bound to a single delivery attempt.
///
/// Recomputed for every attempt because the timestamp changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptSignature {
    /// Unix timestamp (seconds) covered by the signature.
    pub timestamp: i64,
    /// Encoded digest, e.g. `v1=<hex>`.
    pub value: String,
}

/// Unit of work flowing through the delivery pipeline.
///
/// One envelope exists per (event, destination). `idempotency_key` never
/// changes across retries; `attempt_count`, `next_attempt_at` and
/// `signature` are updated by the pipeline as attempts happen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique event identifier.
    pub event_id: EventId,
    /// Consumer-side deduplication key.
    pub idempotency_key: IdempotencyKey,
    /// Kind of event.
    pub event_type: EventType,
    /// Event-specific structured payload.
    pub payload: serde_json::Value,
    /// When the event was published.
    pub created_at: DateTime<Utc>,
    /// Number of delivery attempts made so far.
    pub attempt_count: u32,
    /// When the next delivery attempt is due.
    pub next_attempt_at: DateTime<Utc>,
    /// Target endpoint.
    pub destination: Destination,
    /// Signature of the most recent attempt.
    pub signature: Option<AttemptSignature>,
}

impl Envelope {
    /// Creates a fresh envelope that is due immediately.
    pub fn new(
        event_id: EventId,
        idempotency_key: IdempotencyKey,
        event_type: EventType,
        payload: serde_json::Value,
        destination: Destination,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id,
            idempotency_key,
            event_type,
            payload,
            created_at: now,
            attempt_count: 0,
            next_attempt_at: now,
            destination,
            signature: None,
        }
    }

    /// Identity of this envelope within the pending set.
    pub fn key(&self) -> DeliveryKey {
        DeliveryKey { event_id: self.event_id, destination: self.destination.clone() }
    }

    /// Resets the envelope so it re-enters the lifecycle from scratch.
    pub fn reset_for_replay(&mut self, now: DateTime<Utc>) {
        self.attempt_count = 0;
        self.next_attempt_at = now;
        self.signature = None;
    }
}

/// Classification of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Consumer accepted the event (2xx).
    Success,
    /// Transient failure (408, 429, 5xx, transport error).
    RetryableFailure,
    /// Consumer rejected the event (other 4xx).
    PermanentFailure,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::RetryableFailure => write!(f, "retryable_failure"),
            Self::PermanentFailure => write!(f, "permanent_failure"),
        }
    }
}

/// Immutable record of one network call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Event that was delivered.
    pub event_id: EventId,
    /// Destination that was called.
    pub destination: Destination,
    /// 1-based attempt number within the current lifecycle.
    pub attempt_number: u32,
    /// When the request was issued.
    pub attempted_at: DateTime<Utc>,
    /// HTTP status, if the consumer responded.
    pub http_status: Option<u16>,
    /// Transport or classification error message.
    pub error: Option<String>,
    /// Round-trip latency in milliseconds.
    pub latency_ms: u64,
    /// Outcome classification.
    pub outcome: AttemptOutcome,
}

/// Lifecycle state of one (event, destination) delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting for its next attempt.
    Pending,
    /// Consumer accepted the event.
    Delivered,
    /// Consumer rejected the event permanently.
    Failed,
    /// Retries exhausted; held in the dead letter store.
    DeadLettered,
    /// Cancelled before its first attempt completed.
    Cancelled,
}

impl DeliveryStatus {
    /// Whether no further automatic attempts will happen.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Delivered => write!(f, "delivered"),
            Self::Failed => write!(f, "failed"),
            Self::DeadLettered => write!(f, "dead_lettered"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Envelope that exhausted its retries, with its full attempt history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Envelope as it was when retries ran out.
    pub envelope: Envelope,
    /// Every attempt made during the failed lifecycle.
    pub attempts: Vec<DeliveryAttempt>,
    /// Error reported by the final attempt.
    pub last_error: Option<String>,
    /// When the entry was written.
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Identity of the dead-lettered delivery.
    pub fn key(&self) -> DeliveryKey {
        self.envelope.key()
    }
}

/// Health state of one destination's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Deliveries permitted.
    Closed,
    /// Deliveries short-circuited until cool-down elapses.
    Open,
    /// A single probe delivery is permitted.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn idempotency_key_is_deterministic() {
        let first = IdempotencyKey::derive(EventType::ModelReadyForDeploy, &["model-7", "3"]);
        let second = IdempotencyKey::derive(EventType::ModelReadyForDeploy, &["model-7", "3"]);
        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), 64);
    }

    #[test]
    fn idempotency_key_separates_components() {
        let joined = IdempotencyKey::derive(EventType::ModelRegistered, &["ab", "c"]);
        let split = IdempotencyKey::derive(EventType::ModelRegistered, &["a", "bc"]);
        assert_ne!(joined, split);

        let other_type = IdempotencyKey::derive(EventType::ModelDeployed, &["ab", "c"]);
        assert_ne!(joined, other_type);
    }

    #[test]
    fn destination_rejects_invalid_urls() {
        assert!(Destination::parse("https://hooks.example.com/ml").is_ok());
        assert!(Destination::parse("http://10.0.0.4:8080/cb").is_ok());

        assert!(Destination::parse("not a url").is_err());
        assert!(Destination::parse("ftp://files.example.com").is_err());
        assert!(Destination::parse("mailto:ops@example.com").is_err());
    }

    #[test]
    fn destination_normalizes_and_round_trips_through_serde() {
        let destination = Destination::parse("HTTPS://Hooks.Example.com").unwrap();
        assert_eq!(destination.as_str(), "https://hooks.example.com/");
        assert_eq!(destination.host().as_deref(), Some("hooks.example.com"));

        let json = serde_json::to_string(&destination).unwrap();
        assert_eq!(json, "\"https://hooks.example.com/\"");

        let invalid: std::result::Result<Destination, _> = serde_json::from_str("\"ftp://x\"");
        assert!(invalid.is_err());
    }

    #[test]
    fn event_type_parses_wire_names() {
        for event_type in EventType::ALL {
            assert_eq!(event_type.as_str().parse::<EventType>().unwrap(), event_type);
        }
        assert!("model_exploded".parse::<EventType>().is_err());
        assert_eq!(
            serde_json::to_string(&EventType::ModelReadyForDeploy).unwrap(),
            "\"model_ready_for_deploy\""
        );
    }

    #[test]
    fn replay_reset_preserves_identity() {
        let now = Utc::now();
        let mut envelope = Envelope::new(
            EventId::new(),
            IdempotencyKey::derive(EventType::ModelDeployed, &["m"]),
            EventType::ModelDeployed,
            json!({"model": "m"}),
            Destination::parse("https://example.com/hook").unwrap(),
            now,
        );
        envelope.attempt_count = 5;
        envelope.signature = Some(AttemptSignature { timestamp: 1, value: "v1=00".into() });

        let key_before = envelope.key();
        let later = now + chrono::Duration::minutes(10);
        envelope.reset_for_replay(later);

        assert_eq!(envelope.attempt_count, 0);
        assert_eq!(envelope.next_attempt_at, later);
        assert!(envelope.signature.is_none());
        assert_eq!(envelope.key(), key_before);
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(DeliveryStatus::DeadLettered.is_terminal());
        assert!(DeliveryStatus::Cancelled.is_terminal());
    }
}
