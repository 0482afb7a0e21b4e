//! Trusted Group - threshold-signed custody of ledger outputs
//!
//! Runs one member node: drains the group's outputs from the ledger, dispatches
//! them to workers, and co-signs and publishes the group's transactions.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use trusted_group::api;
use trusted_group::config::Settings;
use trusted_group::coordination::Group;
use trusted_group::ledger::{HttpLedgerClient, LedgerApi};
use trusted_group::metrics::{self, MetricsServer};
use trusted_group::state::{SqliteStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Trusted Group v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        members = settings.genesis.members.len(),
        threshold = settings.genesis.threshold,
        "Loaded group configuration"
    );

    // Open the state store
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(&settings.store).await?);
    info!("State store opened");

    let ledger: Arc<dyn LedgerApi> = Arc::new(HttpLedgerClient::new(settings.ledger.clone())?);

    // Build the group from its genesis
    let group = Arc::new(Group::build(store.clone(), ledger, &settings, Vec::new()).await?);
    info!(group_id = %group.genesis_id(), "Group initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let group = group.clone();
        async move {
            if let Err(e) = api::run_server(config, group).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let store = store.clone();
        let interval = settings.coordinator.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                match store.health_check().await {
                    Ok(()) => metrics::record_health_check(),
                    Err(e) => {
                        warn!("Store health check failed: {}", e);
                        metrics::record_health_check_failure();
                    }
                }
            }
        }
    });

    info!("Trusted Group is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    let mut run_handle = tokio::spawn(group.clone().run());
    let finished = tokio::select! {
        joined = &mut run_handle => Some(joined),
        _ = shutdown_signal() => None,
    };
    let outcome = match finished {
        Some(joined) => joined,
        None => {
            info!("Shutdown signal received, stopping...");
            group.stop().await;
            run_handle.await
        }
    };

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    match outcome {
        Ok(Ok(())) => {
            info!("Trusted Group stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Group halted: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Group task aborted: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,trusted_group=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
