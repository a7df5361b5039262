//! Circuit breaker inspection.

use axum::{extract::State, Json};
use herald_core::Destination;
use herald_delivery::EndpointHealth;
use serde::Serialize;
use tracing::instrument;

use crate::AppState;

/// Health of one destination.
#[derive(Debug, Serialize)]
pub struct CircuitView {
    /// Destination URL.
    pub destination: Destination,
    /// Breaker state and counters.
    #[serde(flatten)]
    pub health: EndpointHealth,
}

/// Lists breaker state for every destination seen so far.
#[instrument(name = "list_circuits", skip(state))]
pub async fn list_circuits(State(state): State<AppState>) -> Json<Vec<CircuitView>> {
    let circuits = state
        .dispatcher
        .circuits()
        .await
        .into_iter()
        .map(|(destination, health)| CircuitView { destination, health })
        .collect();
    Json(circuits)
}
