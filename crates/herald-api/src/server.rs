//! HTTP server setup and routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation
//! 2. Request/response tracing
//! 3. Timeout enforcement
//! 4. Handler execution

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use herald_core::Clock;
use herald_delivery::{DeliveryMetrics, Dispatcher};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::handlers;

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Dispatcher handling publishes and operator actions.
    pub dispatcher: Dispatcher,
    /// Counters exposed on `/metrics`.
    pub metrics: Arc<DeliveryMetrics>,
    /// Process start time.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Creates handler state.
    pub fn new(dispatcher: Dispatcher, metrics: Arc<DeliveryMetrics>) -> Self {
        let started_at = dispatcher.clock().now_utc();
        Self { dispatcher, metrics, started_at }
    }
}

/// Creates the router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let event_routes = Router::new()
        .route("/events", post(handlers::publish_event))
        .route("/events/{event_id}", delete(handlers::cancel_event))
        .route("/events/{event_id}/attempts", get(handlers::event_attempts))
        .route("/events/{event_id}/deliveries", get(handlers::event_deliveries));

    let operator_routes = Router::new()
        .route("/dead-letters", get(handlers::list_dead_letters))
        .route("/dead-letters/{event_id}/replay", post(handlers::replay_dead_letters))
        .route("/circuits", get(handlers::list_circuits))
        .route("/metrics", get(handlers::metrics_snapshot));

    Router::new()
        .route("/health", get(handlers::health_check))
        .merge(event_routes)
        .merge(operator_routes)
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Adds an `X-Request-Id` header to every response.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;
    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }
    response
}

/// Serves the API until `shutdown` resolves.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound.
pub async fn start_server<F>(state: AppState, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    info!("HTTP server stopped gracefully");
    Ok(())
}

/// Resolves on CTRL+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received CTRL+C, starting graceful shutdown"),
        () = terminate => info!("received SIGTERM, starting graceful shutdown"),
    }
}
