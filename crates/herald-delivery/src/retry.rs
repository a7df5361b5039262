//! Exponential backoff and retry scheduling.
//!
//! After a retryable failure the envelope is re-inserted into the pending
//! queue with `next_attempt_at = now + delay`, where
//! `delay = min(base * 2^attempt_count, max_backoff)` with proportional
//! jitter. Once `attempt_count` reaches `max_attempts` the envelope goes to
//! the dead letter store instead; that transition is terminal.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use herald_core::{Clock, DeadLetterEntry, DeliveryEvent, DeliveryStatus, Envelope, MetricsSink};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::{
    dead_letter::DeadLetterStore,
    error::{DeliveryError, Result},
    ledger::DeliveryLedger,
    queue::PendingQueue,
};

/// Backoff policy for retryable failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first, before dead-lettering.
    pub max_attempts: u32,
    /// Multiplier base for exponential backoff.
    pub base_backoff: Duration,
    /// Ceiling on any single delay.
    pub max_backoff: Duration,
    /// Jitter as a fraction of the computed delay (0.2 = ±20%).
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            jitter_fraction: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` for zero attempts, a base
    /// larger than the ceiling, or jitter outside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be > 0"));
        }
        if self.base_backoff > self.max_backoff {
            return Err(DeliveryError::configuration("base_backoff must not exceed max_backoff"));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(DeliveryError::configuration("jitter_fraction must be within [0, 1]"));
        }
        Ok(())
    }

    /// Un-jittered delay after `attempt_count` attempts.
    ///
    /// Non-decreasing in `attempt_count` and never above `max_backoff`.
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(attempt_count.min(31));
        self.base_backoff.checked_mul(multiplier).unwrap_or(self.max_backoff).min(self.max_backoff)
    }

    /// Delay before the next attempt.
    ///
    /// A consumer-supplied `Retry-After` replaces the computed backoff and
    /// is not jittered. Both are capped at `max_backoff`.
    pub fn delay_for(&self, attempt_count: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(requested) => requested.min(self.max_backoff),
            None => apply_jitter(self.backoff(attempt_count), self.jitter_fraction)
                .min(self.max_backoff),
        }
    }

    /// Whether an envelope with `attempt_count` attempts is out of budget.
    pub fn is_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }
}

/// Randomizes `duration` by ±`fraction` of itself.
fn apply_jitter(duration: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 || duration.is_zero() {
        return duration;
    }

    let range = duration.as_secs_f64() * fraction.clamp(0.0, 1.0);
    let offset = rand::rng().random_range(-range..=range);
    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

/// Where a failed delivery went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Re-queued for a later attempt.
    Rescheduled {
        /// When the next attempt is due.
        next_attempt_at: DateTime<Utc>,
        /// Delay that was applied.
        delay: Duration,
    },
    /// Retries exhausted; written to the dead letter store.
    DeadLettered,
}

/// Routes failed and short-circuited deliveries.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    policy: RetryPolicy,
    queue: Arc<PendingQueue>,
    dead_letters: Arc<dyn DeadLetterStore>,
    ledger: Arc<DeliveryLedger>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

impl RetryScheduler {
    /// Creates a scheduler.
    pub fn new(
        policy: RetryPolicy,
        queue: Arc<PendingQueue>,
        dead_letters: Arc<dyn DeadLetterStore>,
        ledger: Arc<DeliveryLedger>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { policy, queue, dead_letters, ledger, metrics, clock }
    }

    /// Policy in force.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Handles a retryable failure.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if the dead letter write fails; see
    /// [`RetryScheduler::dead_letter`].
    pub async fn schedule(
        &self,
        mut envelope: Envelope,
        failure: &DeliveryError,
        latency: Duration,
    ) -> Result<ScheduleOutcome> {
        if self.policy.is_exhausted(envelope.attempt_count) {
            self.dead_letter(envelope, failure.to_string()).await?;
            return Ok(ScheduleOutcome::DeadLettered);
        }

        let key = envelope.key();
        let now = self.clock.now_utc();
        let delay = self.policy.delay_for(envelope.attempt_count, failure.retry_after());
        let next_attempt_at = now + to_chrono(delay);
        let attempt_number = envelope.attempt_count;
        envelope.next_attempt_at = next_attempt_at;
        self.queue.push(envelope).await;
        self.ledger.set_status(&key, DeliveryStatus::Pending).await;

        self.metrics.record(&DeliveryEvent::RetryScheduled {
            key: key.clone(),
            attempt_number,
            next_attempt_at,
            delay,
            latency,
        });
        warn!(
            event_id = %key.event_id,
            destination = %key.destination,
            attempt = attempt_number,
            error = %failure,
            next_attempt_at = %next_attempt_at,
            delay_ms = delay.as_millis(),
            "delivery failed, retry scheduled"
        );

        Ok(ScheduleOutcome::Rescheduled { next_attempt_at, delay })
    }

    /// Writes an exhausted envelope to the dead letter store.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if the write fails. The envelope is
    /// then parked in the queue for `max_backoff`; when it comes due again
    /// the dispatcher retries the write without another network attempt.
    pub async fn dead_letter(&self, mut envelope: Envelope, last_error: String) -> Result<()> {
        let key = envelope.key();
        let now = self.clock.now_utc();
        let attempt_count = envelope.attempt_count;
        let entry = DeadLetterEntry {
            envelope: envelope.clone(),
            attempts: self.ledger.attempts_for(&key).await,
            last_error: Some(last_error),
            dead_lettered_at: now,
        };

        if let Err(e) = self.dead_letters.record(entry).await {
            error!(
                event_id = %key.event_id,
                destination = %key.destination,
                error = %e,
                "failed to write dead letter, parking envelope"
            );
            envelope.next_attempt_at = now + to_chrono(self.policy.max_backoff);
            self.queue.push(envelope).await;
            return Err(e);
        }

        self.ledger.set_status(&key, DeliveryStatus::DeadLettered).await;
        self.metrics.record(&DeliveryEvent::DeadLettered { key: key.clone(), attempts: attempt_count });
        error!(
            event_id = %key.event_id,
            destination = %key.destination,
            attempt = attempt_count,
            "retries exhausted, delivery dead-lettered"
        );
        Ok(())
    }

    /// Reschedules a delivery the circuit breaker refused.
    ///
    /// No attempt was made, so `attempt_count` is unchanged. The envelope
    /// waits for the longer of the remaining cooldown and its current
    /// backoff step.
    pub async fn defer(&self, mut envelope: Envelope, remaining_cooldown: Duration) -> DateTime<Utc> {
        let key = envelope.key();
        let delay = remaining_cooldown.max(self.policy.backoff(envelope.attempt_count));
        let retry_at = self.clock.now_utc() + to_chrono(delay);

        envelope.next_attempt_at = retry_at;
        self.queue.push(envelope).await;

        self.metrics.record(&DeliveryEvent::ShortCircuited { key: key.clone(), retry_at });
        tracing::debug!(
            event_id = %key.event_id,
            destination = %key.destination,
            next_attempt_at = %retry_at,
            "circuit open, delivery deferred"
        );

        retry_at
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)))
}

#[cfg(test)]
mod tests {
    use herald_core::{Destination, EventId, EventType, IdempotencyKey, NoOpMetrics, TestClock};
    use serde_json::json;

    use super::*;
    use crate::dead_letter::{DeadLetterFilter, InMemoryDeadLetterStore};

    fn policy_without_jitter() -> RetryPolicy {
        RetryPolicy { jitter_fraction: 0.0, ..RetryPolicy::default() }
    }

    fn envelope(now: DateTime<Utc>) -> Envelope {
        Envelope::new(
            EventId::new(),
            IdempotencyKey::derive(EventType::ModelReadyForDeploy, &["m", "1"]),
            EventType::ModelReadyForDeploy,
            json!({"model": "m"}),
            Destination::parse("https://consumer.test/hook").unwrap(),
            now,
        )
    }

    #[test]
    fn backoff_doubles_from_base() {
        let policy = policy_without_jitter();
        let delays: Vec<_> = (1..=5).map(|n| policy.delay_for(n, None)).collect();
        assert_eq!(
            delays,
            [2, 4, 8, 16, 32].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy { max_backoff: Duration::from_secs(10), ..policy_without_jitter() };
        assert_eq!(policy.backoff(4), Duration::from_secs(10));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_fraction_and_ceiling() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let delay = policy.delay_for(3, None);
            assert!(delay >= Duration::from_secs_f64(8.0 * 0.8));
            assert!(delay <= Duration::from_secs_f64(8.0 * 1.2));
        }
        for _ in 0..200 {
            assert!(policy.delay_for(20, None) <= policy.max_backoff);
        }
    }

    #[test]
    fn retry_after_overrides_but_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1, Some(Duration::from_secs(42))), Duration::from_secs(42));
        assert_eq!(policy.delay_for(1, Some(Duration::from_secs(86_400))), policy.max_backoff);
    }

    #[test]
    fn invalid_policies_are_rejected() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy { max_attempts: 0, ..RetryPolicy::default() }.validate().is_err());
        assert!(RetryPolicy { jitter_fraction: 1.5, ..RetryPolicy::default() }.validate().is_err());
        assert!(RetryPolicy {
            base_backoff: Duration::from_secs(600),
            ..RetryPolicy::default()
        }
        .validate()
        .is_err());
    }

    struct Harness {
        scheduler: RetryScheduler,
        queue: Arc<PendingQueue>,
        store: Arc<InMemoryDeadLetterStore>,
        clock: TestClock,
    }

    fn harness() -> Harness {
        let clock = TestClock::new();
        let queue = Arc::new(PendingQueue::new());
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let scheduler = RetryScheduler::new(
            policy_without_jitter(),
            queue.clone(),
            store.clone(),
            Arc::new(DeliveryLedger::new(16)),
            Arc::new(NoOpMetrics),
            Arc::new(clock.clone()),
        );
        Harness { scheduler, queue, store, clock }
    }

    #[tokio::test]
    async fn retryable_failure_is_requeued_with_backoff() {
        let h = harness();
        let mut envelope = envelope(h.clock.now_utc());
        envelope.attempt_count = 2;

        let outcome = h
            .scheduler
            .schedule(envelope.clone(), &DeliveryError::server_error(500, ""), Duration::ZERO)
            .await
            .unwrap();

        let expected_at = h.clock.now_utc() + chrono::Duration::seconds(4);
        assert_eq!(
            outcome,
            ScheduleOutcome::Rescheduled { next_attempt_at: expected_at, delay: Duration::from_secs(4) }
        );
        assert!(h.queue.contains(&envelope.key()).await);
        assert_eq!(h.queue.next_due_at().await, Some(expected_at));
    }

    #[tokio::test]
    async fn exhausted_envelope_is_dead_lettered_not_requeued() {
        let h = harness();
        let mut envelope = envelope(h.clock.now_utc());
        envelope.attempt_count = 5;

        let outcome = h
            .scheduler
            .schedule(envelope.clone(), &DeliveryError::timeout(Duration::from_secs(10)), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(outcome, ScheduleOutcome::DeadLettered);
        assert!(h.queue.is_empty().await);
        let entries = h.store.list(&DeadLetterFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].envelope.attempt_count, 5);
        assert_eq!(entries[0].last_error.as_deref(), Some("request timeout after 10000ms"));
    }

    #[tokio::test]
    async fn deferral_keeps_attempt_count() {
        let h = harness();
        let mut envelope = envelope(h.clock.now_utc());
        envelope.attempt_count = 1;

        let retry_at = h.scheduler.defer(envelope.clone(), Duration::from_secs(20)).await;
        assert_eq!(retry_at, h.clock.now_utc() + chrono::Duration::seconds(20));

        let retry_at = h.scheduler.defer(envelope.clone(), Duration::ZERO).await;
        assert_eq!(retry_at, h.clock.now_utc() + chrono::Duration::seconds(2));

        let claimed = h.queue.claim_due(retry_at, 10).await;
        assert_eq!(claimed[0].attempt_count, 1);
    }
}
