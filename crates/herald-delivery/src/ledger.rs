//! In-memory record of attempts and per-destination status.
//!
//! The ledger is the source of attempt history handed to the dead letter
//! store and the operator API. It also arbitrates cancellation: cancelling
//! and completing an attempt both take the same write lock, so an attempt
//! that finishes after its event was cancelled is reliably discarded.

use std::collections::{BTreeMap, HashMap, VecDeque};

use herald_core::{DeliveryAttempt, DeliveryKey, DeliveryStatus, Destination, EventId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

/// Reasons cancellation is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelError {
    /// The event is unknown or has been evicted.
    #[error("event not found")]
    NotFound,
    /// At least one attempt has already completed.
    #[error("delivery already started")]
    AlreadyStarted,
}

/// Result of recording a completed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptRecorded {
    /// Attempt stored; the outcome should be routed.
    Recorded,
    /// Event was cancelled while the attempt was in flight.
    Discarded,
}

/// Delivery status of one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationStatus {
    /// Destination URL.
    pub destination: Destination,
    /// Current lifecycle status.
    pub status: DeliveryStatus,
    /// Attempts recorded for this destination.
    pub attempts: usize,
}

#[derive(Debug)]
struct EventRecord {
    statuses: BTreeMap<Destination, DeliveryStatus>,
    attempts: Vec<DeliveryAttempt>,
    cancelled: bool,
}

impl EventRecord {
    fn is_settled(&self) -> bool {
        self.statuses.values().all(|status| status.is_terminal())
    }
}

#[derive(Debug, Default)]
struct Inner {
    events: HashMap<EventId, EventRecord>,
    order: VecDeque<EventId>,
}

/// Capacity-bounded ledger of recent events.
///
/// When full, the oldest settled event is evicted. Events with pending
/// deliveries are never evicted, so the bound is soft while many deliveries
/// are outstanding.
#[derive(Debug)]
pub struct DeliveryLedger {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl DeliveryLedger {
    /// Creates a ledger retaining up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self { inner: RwLock::new(Inner::default()), capacity: capacity.max(1) }
    }

    /// Registers a freshly published event with all destinations pending.
    pub async fn register(&self, event_id: EventId, destinations: &[Destination]) {
        let mut inner = self.inner.write().await;
        let statuses =
            destinations.iter().map(|d| (d.clone(), DeliveryStatus::Pending)).collect();
        let record = EventRecord { statuses, attempts: Vec::new(), cancelled: false };

        if inner.events.insert(event_id, record).is_none() {
            inner.order.push_back(event_id);
        }
        self.evict(&mut inner);
    }

    /// Marks a destination pending again, registering the event if the
    /// ledger no longer knows it (e.g. replay after restart).
    pub async fn reopen(&self, key: &DeliveryKey) {
        let mut inner = self.inner.write().await;
        if !inner.events.contains_key(&key.event_id) {
            inner.order.push_back(key.event_id);
        }
        let record = inner.events.entry(key.event_id).or_insert_with(|| EventRecord {
            statuses: BTreeMap::new(),
            attempts: Vec::new(),
            cancelled: false,
        });
        record.cancelled = false;
        record.statuses.insert(key.destination.clone(), DeliveryStatus::Pending);
        self.evict(&mut inner);
    }

    /// Records a completed attempt unless the event was cancelled.
    pub async fn record_attempt(&self, attempt: DeliveryAttempt) -> AttemptRecorded {
        let mut inner = self.inner.write().await;
        match inner.events.get_mut(&attempt.event_id) {
            Some(record) if record.cancelled => AttemptRecorded::Discarded,
            Some(record) => {
                record.attempts.push(attempt);
                AttemptRecorded::Recorded
            },
            None => AttemptRecorded::Recorded,
        }
    }

    /// Updates the status of one destination.
    pub async fn set_status(&self, key: &DeliveryKey, status: DeliveryStatus) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.events.get_mut(&key.event_id) {
            record.statuses.insert(key.destination.clone(), status);
        }
    }

    /// Cancels an event whose attempts have not completed yet.
    ///
    /// # Errors
    ///
    /// Returns `CancelError::AlreadyStarted` once any attempt has completed.
    pub async fn cancel(&self, event_id: EventId) -> Result<(), CancelError> {
        let mut inner = self.inner.write().await;
        let record = inner.events.get_mut(&event_id).ok_or(CancelError::NotFound)?;

        if !record.attempts.is_empty() {
            return Err(CancelError::AlreadyStarted);
        }

        record.cancelled = true;
        for status in record.statuses.values_mut() {
            *status = DeliveryStatus::Cancelled;
        }
        Ok(())
    }

    /// Whether the event has been cancelled.
    pub async fn is_cancelled(&self, event_id: EventId) -> bool {
        self.inner.read().await.events.get(&event_id).is_some_and(|record| record.cancelled)
    }

    /// Full attempt history of an event, oldest first.
    pub async fn attempts(&self, event_id: EventId) -> Option<Vec<DeliveryAttempt>> {
        self.inner.read().await.events.get(&event_id).map(|record| record.attempts.clone())
    }

    /// Attempt history of one destination.
    pub async fn attempts_for(&self, key: &DeliveryKey) -> Vec<DeliveryAttempt> {
        self.inner
            .read()
            .await
            .events
            .get(&key.event_id)
            .map(|record| {
                record
                    .attempts
                    .iter()
                    .filter(|attempt| attempt.destination == key.destination)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Status of every destination of an event.
    pub async fn statuses(&self, event_id: EventId) -> Option<Vec<DestinationStatus>> {
        let inner = self.inner.read().await;
        let record = inner.events.get(&event_id)?;
        Some(
            record
                .statuses
                .iter()
                .map(|(destination, status)| DestinationStatus {
                    destination: destination.clone(),
                    status: *status,
                    attempts: record
                        .attempts
                        .iter()
                        .filter(|attempt| &attempt.destination == destination)
                        .count(),
                })
                .collect(),
        )
    }

    /// Number of events retained.
    pub async fn len(&self) -> usize {
        self.inner.read().await.events.len()
    }

    /// Whether the ledger holds no events.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn evict(&self, inner: &mut Inner) {
        while inner.events.len() > self.capacity {
            let Some(position) = inner
                .order
                .iter()
                .position(|id| inner.events.get(id).map_or(true, EventRecord::is_settled))
            else {
                break;
            };
            if let Some(event_id) = inner.order.remove(position) {
                inner.events.remove(&event_id);
            }
        }
    }
}
