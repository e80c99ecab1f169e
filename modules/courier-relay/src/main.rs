use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use courier_common::RelayConfig;
use courier_events::EventRegistry;
use courier_store::PgOutboxStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("courier=info".parse()?))
        .init();

    info!("Courier relay starting...");

    let config = RelayConfig::from_env()?;
    config.log_redacted();

    let pool = PgPoolOptions::new()
        .max_connections((config.tenants.len() * config.workers_per_tenant + 2) as u32)
        .connect(&config.database_url)
        .await?;

    let store = PgOutboxStore::new(pool);
    store.migrate().await?;

    // Types are not known here; rows are relayed as untyped envelopes.
    let registry = Arc::new(EventRegistry::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!(error = %e, "Failed to listen for ctrl-c, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    courier_relay::run(store, registry, &config, shutdown_rx).await?;

    info!("Courier relay stopped");
    Ok(())
}
