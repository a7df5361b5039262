//! Dead letter storage for deliveries that exhausted their retries.
//!
//! The store is append-only from the pipeline's point of view: entries are
//! written once and removed only when an operator replays them. It is the
//! only component that writes to durable storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::{DeadLetterEntry, Destination, EventId, EventType};
use serde::Deserialize;

use crate::error::Result;

mod memory;
mod postgres;

pub use memory::InMemoryDeadLetterStore;
pub use postgres::PostgresDeadLetterStore;

/// Default page size for listings.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Criteria for listing dead-lettered deliveries.
///
/// All fields are optional; unset fields match everything. The time range
/// applies to `dead_lettered_at` and is inclusive on both ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DeadLetterFilter {
    /// Only entries of this event type.
    pub event_type: Option<EventType>,
    /// Only entries for this destination.
    pub destination: Option<Destination>,
    /// Only entries dead-lettered at or after this time.
    pub from: Option<DateTime<Utc>>,
    /// Only entries dead-lettered at or before this time.
    pub to: Option<DateTime<Utc>>,
    /// Maximum entries returned; defaults to [`DEFAULT_LIST_LIMIT`].
    pub limit: Option<usize>,
}

impl DeadLetterFilter {
    /// Whether an entry satisfies every set criterion.
    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        let envelope = &entry.envelope;
        self.event_type.map_or(true, |t| t == envelope.event_type)
            && self.destination.as_ref().map_or(true, |d| d == &envelope.destination)
            && self.from.map_or(true, |from| entry.dead_lettered_at >= from)
            && self.to.map_or(true, |to| entry.dead_lettered_at <= to)
    }

    /// Effective page size.
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT)
    }
}

/// Durable holding area for exhausted deliveries.
#[async_trait]
pub trait DeadLetterStore: Send + Sync + std::fmt::Debug {
    /// Stores an entry. Writing the same (event, destination) twice keeps the
    /// first entry.
    async fn record(&self, entry: DeadLetterEntry) -> Result<()>;

    /// Lists entries matching `filter`, oldest first.
    async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>>;

    /// All entries of one event.
    async fn get(&self, event_id: EventId) -> Result<Vec<DeadLetterEntry>>;

    /// Removes and returns all entries of one event for replay.
    async fn take(&self, event_id: EventId) -> Result<Vec<DeadLetterEntry>>;
}
