//! In-memory dead letter store for tests and single-process deployments.

use async_trait::async_trait;
use herald_core::{DeadLetterEntry, EventId};
use tokio::sync::RwLock;

use super::{DeadLetterFilter, DeadLetterStore};
use crate::error::Result;

/// Process-local dead letter store.
///
/// Entries are lost on restart; use the PostgreSQL store where dead letters
/// must survive the process.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    entries: RwLock<Vec<DeadLetterEntry>>,
}

impl InMemoryDeadLetterStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn record(&self, entry: DeadLetterEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        let key = entry.key();
        if !entries.iter().any(|existing| existing.key() == key) {
            entries.push(entry);
        }
        Ok(())
    }

    async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        let entries = self.entries.read().await;
        let mut matched: Vec<_> = entries.iter().filter(|e| filter.matches(e)).cloned().collect();
        matched.sort_by_key(|e| e.dead_lettered_at);
        matched.truncate(filter.effective_limit());
        Ok(matched)
    }

    async fn get(&self, event_id: EventId) -> Result<Vec<DeadLetterEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.iter().filter(|e| e.envelope.event_id == event_id).cloned().collect())
    }

    async fn take(&self, event_id: EventId) -> Result<Vec<DeadLetterEntry>> {
        let mut entries = self.entries.write().await;
        let (taken, kept): (Vec<_>, Vec<_>) =
            entries.drain(..).partition(|e| e.envelope.event_id == event_id);
        *entries = kept;
        Ok(taken)
    }
}
