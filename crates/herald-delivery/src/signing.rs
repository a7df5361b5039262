//! HMAC-SHA256 signing of outbound deliveries.
//!
//! The signature binds the attempt timestamp, the idempotency key and the
//! canonical payload:
//!
//! ```text
//! v1=hex(HMAC-SHA256(secret, "{timestamp}.{idempotency_key}.{canonical_json(payload)}"))
//! ```
//!
//! Canonical JSON sorts object keys recursively and uses compact separators,
//! so any consumer can rebuild the signed bytes from the request body without
//! depending on a particular serializer. The signer holds an ordered list of
//! secrets (newest first); signing uses the newest, verification accepts any.

use std::{fmt, time::Duration};

use herald_core::{AttemptSignature, IdempotencyKey};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

use crate::error::{DeliveryError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Version prefix of the signature header value.
pub const SIGNATURE_VERSION: &str = "v1";

/// Reasons a signature fails verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    /// Header value is not `v1=<hex>`.
    #[error("malformed signature header")]
    Malformed,

    /// Timestamp lies outside the freshness window.
    #[error("signature timestamp outside tolerance: {age_seconds}s")]
    Stale {
        /// Absolute distance between the signed timestamp and now.
        age_seconds: u64,
    },

    /// No active secret produced a matching digest.
    #[error("signature mismatch")]
    Mismatch,
}

/// Signs deliveries with the newest of an ordered set of secrets.
#[derive(Clone)]
pub struct Signer {
    keys: Vec<HmacSha256>,
}

impl Signer {
    /// Creates a signer from secrets ordered newest first.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the list is empty or any
    /// secret is blank. No event can be dispatched without a secret, so this
    /// is checked once at startup.
    pub fn new<I, S>(secrets: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = secrets
            .into_iter()
            .map(|secret| keyed_mac(secret.as_ref().as_bytes()))
            .collect::<Result<Vec<_>>>()?;

        if keys.is_empty() {
            return Err(DeliveryError::configuration("no active signing secret configured"));
        }

        Ok(Self { keys })
    }

    /// Number of secrets accepted for verification.
    pub fn secret_count(&self) -> usize {
        self.keys.len()
    }

    /// Signs one attempt with the newest secret.
    pub fn sign(
        &self,
        idempotency_key: &IdempotencyKey,
        payload: &Value,
        timestamp: i64,
    ) -> AttemptSignature {
        let message = canonical_bytes(timestamp, idempotency_key, payload);
        let mut mac = self.keys[0].clone();
        mac.update(&message);
        AttemptSignature { timestamp, value: encode(&mac.finalize().into_bytes()) }
    }

    /// Verifies a signature header against every active secret.
    ///
    /// The signed timestamp must lie within `tolerance` of `now`.
    ///
    /// # Errors
    ///
    /// Returns the first reason verification failed.
    pub fn verify(
        &self,
        idempotency_key: &IdempotencyKey,
        payload: &Value,
        timestamp: i64,
        header: &str,
        now: i64,
        tolerance: Duration,
    ) -> std::result::Result<(), VerificationError> {
        let digest = decode(header)?;

        let age_seconds = now.abs_diff(timestamp);
        if age_seconds > tolerance.as_secs() {
            return Err(VerificationError::Stale { age_seconds });
        }

        let message = canonical_bytes(timestamp, idempotency_key, payload);
        let matched = self.keys.iter().any(|key| {
            let mut mac = key.clone();
            mac.update(&message);
            mac.verify_slice(&digest).is_ok()
        });

        if matched {
            Ok(())
        } else {
            Err(VerificationError::Mismatch)
        }
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").field("secrets", &self.keys.len()).finish_non_exhaustive()
    }
}

/// Signs a single attempt with one secret.
///
/// # Errors
///
/// Returns `DeliveryError::Configuration` for an empty secret.
pub fn sign(
    idempotency_key: &IdempotencyKey,
    payload: &Value,
    timestamp: i64,
    secret: &str,
) -> Result<String> {
    let mut mac = keyed_mac(secret.as_bytes())?;
    mac.update(&canonical_bytes(timestamp, idempotency_key, payload));
    Ok(encode(&mac.finalize().into_bytes()))
}

/// Verifies a signature header against an ordered list of secrets.
///
/// Convenience for consumers that hold raw secrets rather than a [`Signer`].
///
/// # Errors
///
/// Returns `VerificationError::Mismatch` when no usable secret is supplied.
pub fn verify_signature<S: AsRef<str>>(
    secrets: &[S],
    idempotency_key: &IdempotencyKey,
    payload: &Value,
    timestamp: i64,
    header: &str,
    now: i64,
    tolerance: Duration,
) -> std::result::Result<(), VerificationError> {
    let signer = Signer::new(secrets).map_err(|_| VerificationError::Mismatch)?;
    signer.verify(idempotency_key, payload, timestamp, header, now, tolerance)
}

/// Bytes covered by the signature.
pub fn canonical_bytes(timestamp: i64, idempotency_key: &IdempotencyKey, payload: &Value) -> Vec<u8> {
    let body = canonical_json(payload);
    let mut message = format!("{timestamp}.{idempotency_key}.").into_bytes();
    message.extend_from_slice(body.as_bytes());
    message
}

/// Serializes a JSON value with recursively sorted keys and no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        },
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        },
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn keyed_mac(secret: &[u8]) -> Result<HmacSha256> {
    if secret.is_empty() {
        return Err(DeliveryError::configuration("signing secret must not be empty"));
    }
    <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|e| DeliveryError::configuration(format!("invalid signing secret: {e}")))
}

fn encode(digest: &[u8]) -> String {
    format!("{SIGNATURE_VERSION}={}", hex::encode(digest))
}

fn decode(header: &str) -> std::result::Result<Vec<u8>, VerificationError> {
    let encoded = header
        .strip_prefix(SIGNATURE_VERSION)
        .and_then(|rest| rest.strip_prefix('='))
        .ok_or(VerificationError::Malformed)?;
    hex::decode(encoded).map_err(|_| VerificationError::Malformed)
}
