//! Pending-delivery set ordered by `next_attempt_at`.
//!
//! Retries are data, not sleeping tasks: the scheduler re-inserts an
//! envelope with its next due time and the worker pool claims whatever is
//! due. Each (event, destination) key is present at most once, so
//! successive attempts of one delivery never overlap.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
};

use chrono::{DateTime, Utc};
use herald_core::{DeliveryKey, Envelope, EventId};
use tokio::sync::{futures::Notified, Mutex, Notify};

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, u64, DeliveryKey)>>,
    entries: HashMap<DeliveryKey, (u64, Envelope)>,
    next_seq: u64,
}

impl Inner {
    fn is_live(&self, seq: u64, key: &DeliveryKey) -> bool {
        self.entries.get(key).is_some_and(|(live_seq, _)| *live_seq == seq)
    }

    fn drop_stale_head(&mut self) {
        while let Some(Reverse((_, seq, key))) = self.heap.peek() {
            if self.is_live(*seq, key) {
                break;
            }
            self.heap.pop();
        }
    }
}

/// Concurrent priority queue of envelopes awaiting delivery.
///
/// Re-inserting a key replaces the queued envelope; superseded heap entries
/// are skipped lazily when they surface.
#[derive(Debug, Default)]
pub struct PendingQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl PendingQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an envelope and wakes the scheduler.
    pub async fn push(&self, envelope: Envelope) {
        {
            let mut inner = self.inner.lock().await;
            let seq = inner.next_seq;
            inner.next_seq += 1;

            let key = envelope.key();
            inner.heap.push(Reverse((envelope.next_attempt_at, seq, key.clone())));
            inner.entries.insert(key, (seq, envelope));
        }
        self.notify.notify_one();
    }

    /// Removes and returns up to `limit` envelopes due at or before `now`,
    /// earliest first.
    pub async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Vec<Envelope> {
        let mut inner = self.inner.lock().await;
        let mut claimed = Vec::new();

        while claimed.len() < limit {
            inner.drop_stale_head();
            let Some(Reverse((due_at, _, _))) = inner.heap.peek() else {
                break;
            };
            if *due_at > now {
                break;
            }

            if let Some(Reverse((_, _, key))) = inner.heap.pop() {
                if let Some((_, envelope)) = inner.entries.remove(&key) {
                    claimed.push(envelope);
                }
            }
        }

        claimed
    }

    /// Due time of the earliest queued envelope.
    pub async fn next_due_at(&self) -> Option<DateTime<Utc>> {
        let mut inner = self.inner.lock().await;
        inner.drop_stale_head();
        inner.heap.peek().map(|Reverse((due_at, _, _))| *due_at)
    }

    /// Removes every queued envelope of an event.
    pub async fn remove_event(&self, event_id: EventId) -> Vec<Envelope> {
        let mut inner = self.inner.lock().await;
        let keys: Vec<DeliveryKey> =
            inner.entries.keys().filter(|key| key.event_id == event_id).cloned().collect();

        keys.into_iter().filter_map(|key| inner.entries.remove(&key)).map(|(_, e)| e).collect()
    }

    /// Whether a delivery is currently queued.
    pub async fn contains(&self, key: &DeliveryKey) -> bool {
        self.inner.lock().await.entries.contains_key(key)
    }

    /// Number of queued envelopes.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Resolves on the next `push`, or immediately if one happened since the
    /// last wake-up.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}
