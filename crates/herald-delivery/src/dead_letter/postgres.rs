//! PostgreSQL dead letter store.
//!
//! One row per (event, destination). Recording is idempotent on that pair
//! and replay removes rows with `DELETE ... RETURNING`.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::{
    DeadLetterEntry, DeliveryAttempt, Destination, Envelope, EventId, EventType, IdempotencyKey,
};
use sqlx::{types::Json, PgPool};
use uuid::Uuid;

use super::{DeadLetterFilter, DeadLetterStore};
use crate::error::{DeliveryError, Result};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS dead_letters (
    event_id          UUID        NOT NULL,
    destination       TEXT        NOT NULL,
    idempotency_key   TEXT        NOT NULL,
    event_type        TEXT        NOT NULL,
    payload           JSONB       NOT NULL,
    created_at        TIMESTAMPTZ NOT NULL,
    attempt_count     INTEGER     NOT NULL,
    attempts          JSONB       NOT NULL,
    last_error        TEXT,
    dead_lettered_at  TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (event_id, destination)
);
CREATE INDEX IF NOT EXISTS idx_dead_letters_dead_lettered_at ON dead_letters (dead_lettered_at);
";

const COLUMNS: &str = "event_id, destination, idempotency_key, event_type, payload, created_at, \
                       attempt_count, attempts, last_error, dead_lettered_at";

/// PostgreSQL-backed dead letter store.
///
/// Attempt history is stored as JSONB next to the envelope columns.
#[derive(Debug, Clone)]
pub struct PostgresDeadLetterStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    event_id: Uuid,
    destination: String,
    idempotency_key: String,
    event_type: String,
    payload: Json<serde_json::Value>,
    created_at: DateTime<Utc>,
    attempt_count: i32,
    attempts: Json<Vec<DeliveryAttempt>>,
    last_error: Option<String>,
    dead_lettered_at: DateTime<Utc>,
}

impl TryFrom<DeadLetterRow> for DeadLetterEntry {
    type Error = DeliveryError;

    fn try_from(row: DeadLetterRow) -> Result<Self> {
        let destination = Destination::parse(&row.destination)
            .map_err(|e| DeliveryError::storage(format!("corrupt destination: {e}")))?;
        let event_type = EventType::from_str(&row.event_type)
            .map_err(|e| DeliveryError::storage(format!("corrupt event type: {e}")))?;

        let envelope = Envelope {
            event_id: EventId(row.event_id),
            idempotency_key: IdempotencyKey::from_raw(row.idempotency_key),
            event_type,
            payload: row.payload.0,
            created_at: row.created_at,
            attempt_count: u32::try_from(row.attempt_count).unwrap_or(0),
            next_attempt_at: row.dead_lettered_at,
            destination,
            signature: None,
        };

        Ok(Self {
            envelope,
            attempts: row.attempts.0,
            last_error: row.last_error,
            dead_lettered_at: row.dead_lettered_at,
        })
    }
}

impl PostgresDeadLetterStore {
    /// Creates a store on an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to `database_url` and creates the table if needed.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if the connection or DDL fails.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Creates the `dead_letters` table and index if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if the DDL fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn into_entries(rows: Vec<DeadLetterRow>) -> Result<Vec<DeadLetterEntry>> {
        rows.into_iter().map(DeadLetterEntry::try_from).collect()
    }
}

#[async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    async fn record(&self, entry: DeadLetterEntry) -> Result<()> {
        let envelope = &entry.envelope;
        sqlx::query(
            r"
            INSERT INTO dead_letters (
                event_id, destination, idempotency_key, event_type, payload, created_at,
                attempt_count, attempts, last_error, dead_lettered_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (event_id, destination) DO NOTHING
            ",
        )
        .bind(envelope.event_id.0)
        .bind(envelope.destination.as_str())
        .bind(envelope.idempotency_key.as_str())
        .bind(envelope.event_type.as_str())
        .bind(Json(&envelope.payload))
        .bind(envelope.created_at)
        .bind(i32::try_from(envelope.attempt_count).unwrap_or(i32::MAX))
        .bind(Json(&entry.attempts))
        .bind(&entry.last_error)
        .bind(entry.dead_lettered_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        let query = format!(
            "SELECT {COLUMNS} FROM dead_letters
             WHERE ($1::TEXT IS NULL OR event_type = $1)
               AND ($2::TEXT IS NULL OR destination = $2)
               AND ($3::TIMESTAMPTZ IS NULL OR dead_lettered_at >= $3)
               AND ($4::TIMESTAMPTZ IS NULL OR dead_lettered_at <= $4)
             ORDER BY dead_lettered_at ASC
             LIMIT $5"
        );

        let rows = sqlx::query_as::<_, DeadLetterRow>(&query)
            .bind(filter.event_type.map(EventType::as_str))
            .bind(filter.destination.as_ref().map(Destination::as_str))
            .bind(filter.from)
            .bind(filter.to)
            .bind(i64::try_from(filter.effective_limit()).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        Self::into_entries(rows)
    }

    async fn get(&self, event_id: EventId) -> Result<Vec<DeadLetterEntry>> {
        let query =
            format!("SELECT {COLUMNS} FROM dead_letters WHERE event_id = $1 ORDER BY destination");
        let rows = sqlx::query_as::<_, DeadLetterRow>(&query)
            .bind(event_id.0)
            .fetch_all(&self.pool)
            .await?;

        Self::into_entries(rows)
    }

    async fn take(&self, event_id: EventId) -> Result<Vec<DeadLetterEntry>> {
        let query = format!("DELETE FROM dead_letters WHERE event_id = $1 RETURNING {COLUMNS}");
        let rows = sqlx::query_as::<_, DeadLetterRow>(&query)
            .bind(event_id.0)
            .fetch_all(&self.pool)
            .await?;

        Self::into_entries(rows)
    }
}
