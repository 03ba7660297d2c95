//! Staff Service - Main Entry Point
//!
//! Staff management HTTP API publishing domain events to RabbitMQ.

use anyhow::{Context, Result};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use staff_service::api::{self, handlers::AppState};
use staff_service::messaging::{
    broker_for_url, topology::STAFF_QUEUE, ConnectionManager, EventConsumer, EventPublisher,
};
use staff_service::staff::{InMemoryStaffStore, StaffService};
use staff_service::types::{LogFormat, ServiceConfig};

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "staff_service=info,tower_http=debug".into()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();
    let config = ServiceConfig::from_env().context("invalid configuration")?;

    init_tracing(config.log_format);

    info!("Starting Staff Service v{}", env!("CARGO_PKG_VERSION"));
    info!(
        exchange = %config.exchange_name,
        kind = %config.exchange_kind,
        "Broker topology"
    );

    // Connect to the broker; the service does not start without it
    let manager = ConnectionManager::new(
        broker_for_url(&config.rabbitmq_url),
        config.topology(),
        config.retry_policy(),
    );
    manager
        .initialize()
        .await
        .context("failed to connect to message broker")?;

    if config.consume_staff_events {
        let consumer = EventConsumer::new(manager.clone()).with_config(config.consumer_config());
        consumer
            .start_consuming(STAFF_QUEUE, |event: Value| async move {
                info!(event = %event, "Staff event received");
                Ok::<_, anyhow::Error>(())
            })
            .await
            .context("failed to start staff event consumer")?;
    }

    // Initialize components
    let service = StaffService::new(
        Arc::new(InMemoryStaffStore::new()),
        EventPublisher::new(manager.clone()),
    );
    let state = Arc::new(AppState {
        service,
        manager: manager.clone(),
    });
    let app = api::router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = manager.close_connection().await {
        warn!(error = %e, "Error closing broker connection");
    }
    info!("Staff Service stopped");

    Ok(())
}
