//! Relay runtime: projector pools for each configured tenant.
//!
//! The binary uses this with an empty registry. Services that want typed
//! envelopes on the wire embed [`run`] with their own registry.

use std::sync::Arc;

use anyhow::Result;
use courier_common::RelayConfig;
use courier_engine::{EventPublisher, LogPublisher, Projector, ProjectorConfig, WebhookPublisher};
use courier_events::EventRegistry;
use courier_store::OutboxStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Pick the sink: the webhook if one is configured, the log otherwise.
pub fn build_publisher(config: &RelayConfig) -> Result<Arc<dyn EventPublisher>> {
    match &config.webhook_url {
        Some(url) => {
            info!("Publishing to webhook");
            let publisher = WebhookPublisher::new(url, config.outbox.publish_timeout)?;
            Ok(Arc::new(publisher))
        }
        None => {
            info!("No COURIER_WEBHOOK_URL set, publishing to the log");
            Ok(Arc::new(LogPublisher))
        }
    }
}

/// Spawn `workers_per_tenant` projectors for every tenant.
pub fn spawn_tenants<S>(
    store: S,
    registry: Arc<EventRegistry>,
    publisher: Arc<dyn EventPublisher>,
    config: &RelayConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>>
where
    S: OutboxStore + Clone,
{
    config
        .tenants
        .iter()
        .flat_map(|tenant| {
            let projector = Arc::new(Projector::new(
                store.clone(),
                registry.clone(),
                publisher.clone(),
                ProjectorConfig::new(tenant.clone(), &config.outbox),
            ));
            info!(tenant = tenant.as_str(), workers = config.workers_per_tenant, "Starting projectors");
            projector.spawn_pool(config.workers_per_tenant, shutdown.clone())
        })
        .collect()
}

/// Run projectors until `shutdown` flips, then wait for them to finish their
/// current cycle.
pub async fn run<S>(
    store: S,
    registry: Arc<EventRegistry>,
    config: &RelayConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: OutboxStore + Clone,
{
    let publisher = build_publisher(config)?;
    let handles = spawn_tenants(store, registry, publisher, config, shutdown);

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            warn!(error = %e, "Projector task ended abnormally");
        }
    }
    Ok(())
}
