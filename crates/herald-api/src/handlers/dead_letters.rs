//! Dead-letter listing and replay.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use herald_core::DeadLetterEntry;
use herald_delivery::DeadLetterFilter;
use serde::Serialize;
use tracing::{info, instrument};

use super::events::parse_event_id;
use crate::{
    error::{ApiError, ApiResult},
    AppState,
};

/// Response of a replay request.
#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    /// Deliveries moved back into the queue.
    pub replayed: usize,
}

/// Lists dead-lettered deliveries matching the query.
#[instrument(name = "list_dead_letters", skip(state))]
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(filter): Query<DeadLetterFilter>,
) -> ApiResult<Json<Vec<DeadLetterEntry>>> {
    let entries = state.dispatcher.dead_letters(&filter).await?;
    Ok(Json(entries))
}

/// Requeues every dead-lettered delivery of an event with a fresh lifecycle.
#[instrument(name = "replay_dead_letters", skip(state))]
pub async fn replay_dead_letters(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<ReplayResponse>> {
    let event_id = parse_event_id(&event_id)?;
    let replayed = state.dispatcher.replay(event_id).await?;
    if replayed == 0 {
        return Err(ApiError::NotFound(format!("no dead letters for event {event_id}")));
    }

    info!(event_id = %event_id, replayed, "dead letters replayed via api");
    Ok(Json(ReplayResponse { replayed }))
}
