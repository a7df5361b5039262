//! Liveness endpoint.

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use herald_core::Clock;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `healthy` while the process serves requests.
    pub status: &'static str,
    /// When the check ran.
    pub timestamp: DateTime<Utc>,
    /// Seconds since startup.
    pub uptime_seconds: i64,
    /// Deliveries waiting in the queue.
    pub pending_deliveries: usize,
    /// Service version.
    pub version: &'static str,
}

/// Reports liveness with queue depth.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let now = state.dispatcher.clock().now_utc();
    let pending_deliveries = state.dispatcher.pending_count().await;
    debug!(pending_deliveries, "health check");

    Json(HealthResponse {
        status: "healthy",
        timestamp: now,
        uptime_seconds: (now - state.started_at).num_seconds().max(0),
        pending_deliveries,
        version: env!("CARGO_PKG_VERSION"),
    })
}
