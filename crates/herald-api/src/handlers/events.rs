//! Publishing, cancellation and per-event inspection.

use std::str::FromStr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use herald_core::{DeliveryAttempt, EventId, EventType};
use herald_delivery::{DestinationStatus, OutboundEvent};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{
    error::{ApiError, ApiResult},
    AppState,
};

/// Body of `POST /events`.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// Kind of event.
    pub event_type: EventType,
    /// Business identifiers the idempotency key derives from.
    pub business_ids: Vec<String>,
    /// Event payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Webhook URLs to deliver to.
    pub destinations: Vec<String>,
}

/// Response of `POST /events`.
#[derive(Debug, Serialize)]
pub struct PublishResponse {
    /// Identifier of the accepted event.
    pub event_id: EventId,
}

pub(crate) fn parse_event_id(raw: &str) -> ApiResult<EventId> {
    EventId::from_str(raw).map_err(ApiError::from)
}

/// Accepts an event for asynchronous delivery.
#[instrument(name = "publish_event", skip(state, request), fields(event_type = %request.event_type))]
pub async fn publish_event(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> ApiResult<(StatusCode, Json<PublishResponse>)> {
    let event = OutboundEvent::new(request.event_type, request.business_ids, request.payload);
    let event_id = state.dispatcher.publish(event, request.destinations).await?;

    Ok((StatusCode::ACCEPTED, Json(PublishResponse { event_id })))
}

/// Cancels an event whose deliveries have not completed an attempt yet.
#[instrument(name = "cancel_event", skip(state))]
pub async fn cancel_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<StatusCode> {
    let event_id = parse_event_id(&event_id)?;
    state.dispatcher.cancel(event_id).await?;
    info!(event_id = %event_id, "event cancelled via api");
    Ok(StatusCode::NO_CONTENT)
}

/// Attempt history for an event, oldest first.
#[instrument(name = "event_attempts", skip(state))]
pub async fn event_attempts(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<Vec<DeliveryAttempt>>> {
    let event_id = parse_event_id(&event_id)?;
    state
        .dispatcher
        .attempts(event_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("event {event_id} not found")))
}

/// Per-destination delivery status for an event.
#[instrument(name = "event_deliveries", skip(state))]
pub async fn event_deliveries(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<Vec<DestinationStatus>>> {
    let event_id = parse_event_id(&event_id)?;
    state
        .dispatcher
        .deliveries(event_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("event {event_id} not found")))
}
