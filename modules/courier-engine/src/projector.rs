//! Projector: per-tenant worker that relays unsent outbox rows.
//!
//! Each cycle runs in one short transaction: claim up to `batch_size` `NEW`
//! rows with a skip-locked read, rebuild the events through the registry,
//! publish them as one batch, and record the result. Several projectors may
//! work the same tenant; the claim keeps their batches disjoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use courier_common::OutboxConfig;
use courier_events::{DomainEvent, EventRegistry};
use courier_store::{OutboxStatus, OutboxStore, OutboxTransaction};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::publisher::{EventPublisher, PublishError};

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectorConfig {
    pub tenant_id: String,
    pub batch_size: usize,
    pub max_retry: u32,
    /// Sleep after a cycle that claimed rows.
    pub poll_interval_busy: Duration,
    /// Sleep after an empty or failed cycle.
    pub poll_interval_idle: Duration,
    pub publish_timeout: Duration,
}

impl ProjectorConfig {
    pub fn new(tenant_id: impl Into<String>, config: &OutboxConfig) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            batch_size: config.batch_size,
            max_retry: config.max_retry,
            poll_interval_busy: config.poll_interval_busy,
            poll_interval_idle: config.poll_interval_idle,
            publish_timeout: config.publish_timeout,
        }
    }
}

/// Result of one projector cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub sent: usize,
    /// Failed and still `NEW`.
    pub retried: usize,
    /// Failed for the last time, now `ERR`.
    pub dead: usize,
}

pub struct Projector<S: OutboxStore> {
    store: S,
    registry: Arc<EventRegistry>,
    publisher: Arc<dyn EventPublisher>,
    config: ProjectorConfig,
}

impl<S: OutboxStore> Projector<S> {
    pub fn new(
        store: S,
        registry: Arc<EventRegistry>,
        publisher: Arc<dyn EventPublisher>,
        config: ProjectorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &ProjectorConfig {
        &self.config
    }

    /// Run a single claim → publish → mark cycle.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let tenant = self.config.tenant_id.as_str();
        let mut tx = self.store.begin().await?;

        let rows = tx
            .select_batch(tenant, OutboxStatus::New, self.config.batch_size)
            .await?;
        if rows.is_empty() {
            tx.commit().await?;
            return Ok(CycleReport::default());
        }

        let mut report = CycleReport {
            claimed: rows.len(),
            ..CycleReport::default()
        };
        let events: Vec<DomainEvent> = rows
            .iter()
            .map(|row| row.to_domain_event(&self.registry))
            .collect();
        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();

        match self.publish(&events).await {
            Ok(()) => {
                report.sent = tx.mark_sent(&ids).await? as usize;
                debug!(tenant, sent = report.sent, "Published outbox batch");
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(tenant, rows = ids.len(), error = %e, "Outbox batch publish failed");

                for row in &rows {
                    match tx.mark_error(row.id, self.config.max_retry, &reason).await? {
                        Some(OutboxStatus::Err) => {
                            report.dead += 1;
                            error!(
                                tenant,
                                event_id = %row.id,
                                event_type = %row.event_type,
                                retries = row.retry_count + 1,
                                "Outbox event gave up after max retries"
                            );
                        }
                        Some(_) => report.retried += 1,
                        None => {}
                    }
                }
            }
        }

        tx.commit().await?;
        Ok(report)
    }

    /// Loop until `shutdown` turns true (or its sender is dropped).
    ///
    /// A failing cycle is logged and retried after the idle interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(tenant = %self.config.tenant_id, "Projector started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_once().await {
                Ok(report) if report.claimed > 0 => {
                    debug!(
                        claimed = report.claimed,
                        sent = report.sent,
                        retried = report.retried,
                        dead = report.dead,
                        "Projector cycle"
                    );
                    self.config.poll_interval_busy
                }
                Ok(_) => self.config.poll_interval_idle,
                Err(e) => {
                    error!(tenant = %self.config.tenant_id, error = %e, "Projector cycle failed");
                    self.config.poll_interval_idle
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(tenant = %self.config.tenant_id, "Projector stopped");
    }

    async fn publish(&self, events: &[DomainEvent]) -> Result<(), PublishError> {
        match tokio::time::timeout(self.config.publish_timeout, self.publisher.publish_batch(events)).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(self.config.publish_timeout)),
        }
    }
}

impl<S: OutboxStore> Projector<S> {
    /// Start `workers` concurrent loops over this projector's tenant.
    pub fn spawn_pool(self: Arc<Self>, workers: usize, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|worker| {
                let projector = self.clone();
                let shutdown = shutdown.clone();
                let span = tracing::info_span!(
                    "projector",
                    tenant = %projector.config.tenant_id,
                    worker
                );
                tokio::spawn(async move { projector.run(shutdown).await }.instrument(span))
            })
            .collect()
    }
}
