//! Metrics snapshot endpoint.

use axum::{extract::State, Json};
use herald_delivery::MetricsSnapshot;

use crate::AppState;

/// Point-in-time delivery counters.
pub async fn metrics_snapshot(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
