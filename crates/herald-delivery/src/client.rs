//! HTTP transport for webhook delivery.
//!
//! Builds the signed POST for one attempt, sends it through a pooled
//! `reqwest` client with a bounded timeout, and classifies the response for
//! the retry and circuit breaker decisions.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use herald_core::{AttemptSignature, Destination, Envelope, EventId, EventType, IdempotencyKey};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::{
    error::{DeliveryError, Result},
    signing::canonical_json,
};

/// Header carrying the `v1=<hex>` signature.
pub const SIGNATURE_HEADER: &str = "X-Herald-Signature";
/// Header carrying the signed Unix timestamp (seconds).
pub const TIMESTAMP_HEADER: &str = "X-Herald-Timestamp";
/// Header carrying the consumer deduplication key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "X-Herald-Idempotency-Key";
/// Header carrying the event type.
pub const EVENT_TYPE_HEADER: &str = "X-Herald-Event-Type";
/// Header carrying the event id.
pub const EVENT_ID_HEADER: &str = "X-Herald-Event-Id";
/// Header carrying the 1-based attempt number.
pub const ATTEMPT_HEADER: &str = "X-Herald-Delivery-Attempt";

const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;
const MAX_RECORDED_BODY_SIZE: usize = 1024;

/// Configuration for the delivery HTTP client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Upper bound on a single request, connect through body.
    pub request_timeout: Duration,
    /// User agent sent with every delivery.
    pub user_agent: String,
    /// Idle connections kept per destination host.
    pub pool_max_idle_per_host: usize,
    /// How long an idle pooled connection is kept.
    pub pool_idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            user_agent: format!("Herald-Webhooks/{}", env!("CARGO_PKG_VERSION")),
            pool_max_idle_per_host: 16,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// One outbound delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Event being delivered.
    pub event_id: EventId,
    /// Kind of event.
    pub event_type: EventType,
    /// Target endpoint.
    pub destination: Destination,
    /// Consumer deduplication key.
    pub idempotency_key: IdempotencyKey,
    /// Signature for this attempt.
    pub signature: AttemptSignature,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Canonical JSON body.
    pub body: Bytes,
}

impl DeliveryRequest {
    /// Builds the request for the envelope's current attempt.
    pub fn from_envelope(envelope: &Envelope, signature: AttemptSignature) -> Self {
        Self {
            event_id: envelope.event_id,
            event_type: envelope.event_type,
            destination: envelope.destination.clone(),
            idempotency_key: envelope.idempotency_key.clone(),
            signature,
            attempt_number: envelope.attempt_count,
            body: Bytes::from(canonical_json(&envelope.payload)),
        }
    }
}

/// Consumer response to a delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers, lower-cased names.
    pub headers: HashMap<String, String>,
    /// Response body, truncated for storage.
    pub body: String,
    /// Round-trip duration.
    pub duration: Duration,
}

impl DeliveryResponse {
    /// Maps the response onto the delivery outcome.
    ///
    /// 2xx is success. 429 and 503 carrying `Retry-After` become
    /// `RateLimited` so the consumer's guidance overrides backoff. Other 4xx
    /// become `ClientError` (permanent unless 408/429) and 5xx become
    /// `ServerError`. Redirects are not followed, so 1xx and 3xx are
    /// permanent `ClientError`s as well.
    ///
    /// # Errors
    ///
    /// Returns the classified failure for non-2xx statuses.
    pub fn classify(&self, now: DateTime<Utc>) -> Result<()> {
        match self.status_code {
            200..=299 => Ok(()),
            429 | 503 => {
                if let Some(seconds) = extract_retry_after_seconds(&self.headers, now) {
                    Err(DeliveryError::rate_limited(self.status_code, seconds))
                } else if self.status_code == 429 {
                    Err(DeliveryError::client_error(self.status_code, self.body.clone()))
                } else {
                    Err(DeliveryError::server_error(self.status_code, self.body.clone()))
                }
            },
            100..=199 | 300..=499 => {
                Err(DeliveryError::client_error(self.status_code, self.body.clone()))
            },
            _ => Err(DeliveryError::server_error(self.status_code, self.body.clone())),
        }
    }
}

/// Sends delivery attempts over the network.
///
/// `Err` is reserved for transport failures (connect, timeout). Any HTTP
/// response, including error statuses, is returned as `Ok`.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Sends a single attempt.
    async fn send(&self, request: DeliveryRequest) -> Result<DeliveryResponse>;
}

/// Pooled `reqwest` transport.
///
/// One client is shared by all workers; `reqwest` keeps a connection pool per
/// host so TLS setup is amortized across deliveries.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a delivery client.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a client with default configuration.
    ///
    /// # Errors
    ///
    /// See [`DeliveryClient::new`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "webhook_delivery",
            event_id = %request.event_id,
            destination = %request.destination,
            attempt = request.attempt_number
        );

        async move {
            tracing::debug!("sending delivery");

            let response = self
                .client
                .post(request.destination.as_str())
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(SIGNATURE_HEADER, &request.signature.value)
                .header(TIMESTAMP_HEADER, request.signature.timestamp.to_string())
                .header(IDEMPOTENCY_KEY_HEADER, request.idempotency_key.as_str())
                .header(EVENT_TYPE_HEADER, request.event_type.as_str())
                .header(EVENT_ID_HEADER, request.event_id.to_string())
                .header(ATTEMPT_HEADER, request.attempt_number.to_string())
                .body(request.body)
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), error = %e, "request failed");

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.request_timeout));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let status_code = response.status().as_u16();
            let headers = extract_headers(response.headers());
            let body = read_body(response).await;
            let duration = start_time.elapsed();

            tracing::debug!(status_code, duration_ms = duration.as_millis(), "received response");

            Ok(DeliveryResponse { status_code, headers, body, duration })
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl Transport for DeliveryClient {
    async fn send(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        self.deliver(request).await
    }
}

async fn read_body(response: reqwest::Response) -> String {
    match response.bytes().await {
        Ok(bytes) => truncate_body(&bytes),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read response body");
            format!("[failed to read response body: {e}]")
        },
    }
}

fn truncate_body(bytes: &[u8]) -> String {
    let limit = bytes.len().min(MAX_RESPONSE_BODY_SIZE).min(MAX_RECORDED_BODY_SIZE);
    let text = String::from_utf8_lossy(&bytes[..limit]);
    if bytes.len() > limit {
        format!("{text}... (truncated)")
    } else {
        text.into_owned()
    }
}

fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    header_map
        .iter()
        .filter_map(|(key, value)| {
            value.to_str().ok().map(|value| (key.as_str().to_ascii_lowercase(), value.to_string()))
        })
        .collect()
}

/// Extracts the `Retry-After` delay in whole seconds.
///
/// Accepts delta-seconds and HTTP-date forms. Dates in the past yield zero.
/// Returns `None` when the header is missing or unparseable so that
/// computed backoff applies.
pub fn extract_retry_after_seconds<S: std::hash::BuildHasher>(
    headers: &HashMap<String, String, S>,
    now: DateTime<Utc>,
) -> Option<u64> {
    let retry_after = headers.get("retry-after")?.trim();

    if let Ok(seconds) = retry_after.parse::<u64>() {
        return Some(seconds);
    }

    let retry_at = DateTime::parse_from_rfc2822(retry_after).ok()?.with_timezone(&Utc);
    Some(u64::try_from((retry_at - now).num_seconds()).unwrap_or(0))
}
