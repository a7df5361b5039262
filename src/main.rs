//! Herald webhook delivery service.
//!
//! Wires the dispatcher, the delivery worker pool and the operator API, and
//! coordinates graceful startup and shutdown.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_api::{shutdown_signal, start_server, AppState};
use herald_core::MulticastMetrics;
use herald_delivery::{
    DeliveryMetrics, Dispatcher, DispatcherBuilder, PostgresDeadLetterStore, TracingMetrics,
    WorkerPool,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(config.log_format)?;

    info!(
        bind_addr = %config.bind_addr,
        database_url = config.database_url_masked().as_deref().unwrap_or("in-memory"),
        max_attempts = config.max_attempts,
        max_in_flight = config.max_in_flight_deliveries,
        dual_publish = config.dual_publish_enabled,
        "starting herald webhook delivery service"
    );

    let dispatcher_config = config.to_dispatcher_config();
    let shutdown_timeout = dispatcher_config.shutdown_timeout;

    let metrics = Arc::new(DeliveryMetrics::new());
    let sink = MulticastMetrics::new().with(metrics.clone()).with(Arc::new(TracingMetrics));
    let mut builder = Dispatcher::builder(dispatcher_config).metrics(Arc::new(sink));

    let db_pool = match &config.database_url {
        Some(url) => {
            let pool = create_database_pool(url, config.database_max_connections).await?;
            let store = PostgresDeadLetterStore::new(pool.clone());
            store.ensure_schema().await.context("failed to create dead-letter schema")?;
            builder = builder.dead_letters(Arc::new(store));
            info!("using PostgreSQL dead-letter store");
            Some(pool)
        },
        None => {
            warn!("no database_url configured, dead letters are kept in memory");
            None
        },
    };

    let builder = attach_broker(builder, &config).await?;
    let dispatcher = builder.build().context("failed to build dispatcher")?;

    let shutdown = CancellationToken::new();
    let workers = WorkerPool::start_with_token(dispatcher.clone(), shutdown.child_token());

    let server = tokio::spawn({
        let state = AppState::new(dispatcher, metrics);
        let addr = config.bind_addr;
        let shutdown = shutdown.clone();
        async move {
            let stopped = shutdown.clone().cancelled_owned();
            let result = start_server(state, addr, stopped).await;
            if result.is_err() {
                shutdown.cancel();
            }
            result
        }
    });

    info!(addr = %config.bind_addr, "herald is ready to deliver events");

    tokio::select! {
        () = shutdown_signal() => {},
        () = shutdown.cancelled() => {},
    }
    shutdown.cancel();

    match server.await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
    }

    if let Err(e) = workers.shutdown_graceful(shutdown_timeout).await {
        warn!(error = %e, "worker pool did not shut down cleanly");
    }

    if let Some(pool) = db_pool {
        pool.close().await;
        info!("database connections closed");
    }

    info!("herald shutdown complete");
    Ok(())
}

/// Initializes tracing. `RUST_LOG` overrides the default filter.
fn init_tracing(format: LogFormat) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,herald=debug,tower_http=debug"))
        .context("invalid RUST_LOG filter")?;

    let (json, pretty) = match format {
        LogFormat::Json => (Some(fmt::layer().json().with_current_span(true)), None),
        LogFormat::Pretty => (None, Some(fmt::layer().with_target(true).with_line_number(true))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .try_init()
        .context("failed to install tracing subscriber")
}

/// Creates the database pool, retrying while the database comes up.
async fn create_database_pool(url: &str, max_connections: u32) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect(url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database pool after retries");
            },
        }
    }
}

#[cfg(feature = "nats")]
async fn attach_broker(builder: DispatcherBuilder, config: &Config) -> Result<DispatcherBuilder> {
    if !config.dual_publish_enabled {
        return Ok(builder);
    }

    let publisher = herald_delivery::NatsPublisher::connect(
        &config.nats_url,
        &config.nats_stream,
        &config.nats_subject,
    )
    .await
    .context("failed to connect to legacy broker")?;
    Ok(builder.broker(Arc::new(publisher)))
}

#[cfg(not(feature = "nats"))]
#[allow(clippy::unused_async)]
async fn attach_broker(builder: DispatcherBuilder, config: &Config) -> Result<DispatcherBuilder> {
    if config.dual_publish_enabled {
        anyhow::bail!("dual_publish_enabled requires building with the `nats` feature");
    }
    Ok(builder)
}
