//! Pre-commit hooks and the outbox capture hook.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use courier_events::DomainEvent;
use courier_store::{OutboxRecord, OutboxTransaction};
use tracing::{debug, warn};
use uuid::Uuid;

/// Runs inside the open transaction just before it commits. An error aborts
/// the transaction.
#[async_trait]
pub trait PreCommitHook<T: OutboxTransaction>: Send + Sync {
    async fn before_commit(&self, tx: &mut T, pending: &[DomainEvent]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureReport {
    pub inserted: u64,
    pub skipped: usize,
}

/// Writes pending events to the outbox table in the caller's transaction.
///
/// Safe to run more than once per transaction: ids that already have a row,
/// or repeat within `pending`, are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxCapture;

impl OutboxCapture {
    pub async fn capture<T: OutboxTransaction>(
        &self,
        tx: &mut T,
        pending: &[DomainEvent],
    ) -> Result<CaptureReport> {
        if pending.is_empty() {
            return Ok(CaptureReport::default());
        }

        let mut seen = HashSet::with_capacity(pending.len());
        let unique: Vec<&DomainEvent> = pending
            .iter()
            .filter(|e| seen.insert(e.event_id()))
            .collect();

        let ids: Vec<Uuid> = unique.iter().map(|e| e.event_id()).collect();
        let existing = tx.exists_any(&ids).await?;

        let records: Vec<OutboxRecord> = unique
            .iter()
            .filter(|e| !existing.contains(&e.event_id()))
            .map(|e| OutboxRecord::from_domain_event(e))
            .collect();

        let skipped = pending.len() - records.len();
        if skipped > 0 {
            for id in &existing {
                warn!(event_id = %id, "Event already in outbox, skipping insert");
            }
            if unique.len() < pending.len() {
                warn!(
                    duplicates = pending.len() - unique.len(),
                    "Pending batch repeats event ids, keeping first occurrence"
                );
            }
        }

        let inserted = tx.insert(&records).await?;
        if inserted < records.len() as u64 {
            warn!(
                staged = records.len(),
                inserted,
                "Concurrent writer inserted some outbox rows first"
            );
        }

        debug!(inserted, skipped, "Captured events into outbox");
        Ok(CaptureReport { inserted, skipped })
    }
}

#[async_trait]
impl<T: OutboxTransaction> PreCommitHook<T> for OutboxCapture {
    async fn before_commit(&self, tx: &mut T, pending: &[DomainEvent]) -> Result<()> {
        self.capture(tx, pending).await?;
        Ok(())
    }
}
