//! Storage contracts for the outbox.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{OutboxRecord, OutboxStats, OutboxStatus};

/// A transactional outbox backend.
///
/// Implemented by `PgOutboxStore` (postgres) and `MemoryOutboxStore` (tests).
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    type Tx: OutboxTransaction;

    /// Open a transaction. Business writes and outbox inserts that must commit
    /// together go through the same transaction.
    async fn begin(&self) -> Result<Self::Tx>;

    async fn find(&self, id: Uuid) -> Result<Option<OutboxRecord>>;

    async fn stats(&self, tenant_id: &str) -> Result<OutboxStats>;
}

/// One open transaction against the outbox.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait OutboxTransaction: Send + Sized + 'static {
    /// Which of `ids` already have a row. One query regardless of `ids.len()`.
    async fn exists_any(&mut self, ids: &[Uuid]) -> Result<HashSet<Uuid>>;

    /// Stage inserts. Rows whose id already exists are skipped.
    /// Returns the number of rows inserted.
    async fn insert(&mut self, records: &[OutboxRecord]) -> Result<u64>;

    /// Claim up to `limit` rows for `tenant_id` in `status`, oldest first.
    ///
    /// Claimed rows stay locked until the transaction ends. Rows locked by a
    /// concurrent claimant are skipped, never waited on.
    async fn select_batch(
        &mut self,
        tenant_id: &str,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>>;

    /// `NEW → SENT` for each id still `NEW`. Returns rows updated.
    async fn mark_sent(&mut self, ids: &[Uuid]) -> Result<u64>;

    /// Record a failed delivery: bump `retry_count` and go terminal (`ERR`)
    /// once it reaches `max_retry`. Returns the resulting status, or `None`
    /// if the row was not `NEW`.
    async fn mark_error(
        &mut self,
        id: Uuid,
        max_retry: u32,
        error: &str,
    ) -> Result<Option<OutboxStatus>>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}
