//! PgOutboxStore: the outbox table backed by Postgres.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` scoped by tenant, so any number of
//! projector workers can share the table without an external lock manager.

use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::traits::{OutboxStore, OutboxTransaction};
use crate::types::{OutboxRecord, OutboxStats, OutboxStatus};

/// Rows per INSERT statement. Keeps bind parameters well under the
/// Postgres limit of 65535.
const INSERT_CHUNK: usize = 1000;

const RECORD_COLUMNS: &str = "id, tenant_id, aggregate_id, event_type, schema_id, schema_version, \
     payload, status, retry_count, created_at, occurred_at, last_error";

// ---------------------------------------------------------------------------
// PgOutboxStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox table and its claim index. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_events (
                id             UUID         PRIMARY KEY,
                tenant_id      TEXT         NOT NULL,
                aggregate_id   TEXT,
                event_type     TEXT         NOT NULL,
                schema_id      TEXT         NOT NULL DEFAULT '',
                schema_version INTEGER      NOT NULL DEFAULT 1,
                payload        JSONB        NOT NULL,
                status         TEXT         NOT NULL DEFAULT 'NEW'
                               CHECK (status IN ('NEW', 'SENT', 'ERR')),
                retry_count    INTEGER      NOT NULL DEFAULT 0,
                created_at     TIMESTAMPTZ  NOT NULL DEFAULT now(),
                occurred_at    TIMESTAMPTZ  NOT NULL DEFAULT now(),
                last_error     TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating outbox_events")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_outbox_events_claim
            ON outbox_events (tenant_id, status, created_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating outbox_events claim index")?;

        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    type Tx = PgOutboxTransaction;

    async fn begin(&self) -> Result<PgOutboxTransaction> {
        let tx = self.pool.begin().await?;
        Ok(PgOutboxTransaction { tx })
    }

    async fn find(&self, id: Uuid) -> Result<Option<OutboxRecord>> {
        let row = sqlx::query_as::<_, OutboxRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM outbox_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn stats(&self, tenant_id: &str) -> Result<OutboxStats> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT status, COUNT(*)
            FROM outbox_events
            WHERE tenant_id = $1
            GROUP BY status
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = OutboxStats::default();
        for (status, count) in rows {
            let count = count as u64;
            match status.parse::<OutboxStatus>()? {
                OutboxStatus::New => stats.new = count,
                OutboxStatus::Sent => stats.sent = count,
                OutboxStatus::Err => stats.err = count,
            }
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// PgOutboxTransaction
// ---------------------------------------------------------------------------

/// An open Postgres transaction. Business writes go through [`conn`](Self::conn)
/// so they commit or roll back together with the outbox rows.
pub struct PgOutboxTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgOutboxTransaction {
    /// The underlying connection, for business queries in the same transaction.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut *self.tx
    }
}

#[async_trait]
impl OutboxTransaction for PgOutboxTransaction {
    async fn exists_any(&mut self, ids: &[Uuid]) -> Result<HashSet<Uuid>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }

        let found = sqlx::query_scalar::<_, Uuid>("SELECT id FROM outbox_events WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&mut *self.tx)
            .await?;

        Ok(found.into_iter().collect())
    }

    async fn insert(&mut self, records: &[OutboxRecord]) -> Result<u64> {
        let mut inserted = 0;

        for chunk in records.chunks(INSERT_CHUNK) {
            let mut query_builder = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO outbox_events ({RECORD_COLUMNS}) "
            ));

            query_builder.push_values(chunk, |mut b, record| {
                b.push_bind(record.id)
                    .push_bind(record.tenant_id.clone())
                    .push_bind(record.aggregate_id.clone())
                    .push_bind(record.event_type.clone())
                    .push_bind(record.schema_id.clone())
                    .push_bind(record.schema_version)
                    .push_bind(record.payload.clone())
                    .push_bind(record.status.as_str())
                    .push_bind(record.retry_count)
                    .push_bind(record.created_at)
                    .push_bind(record.occurred_at)
                    .push_bind(record.last_error.clone());
            });
            query_builder.push(" ON CONFLICT (id) DO NOTHING");

            let result = query_builder.build().execute(&mut *self.tx).await?;
            inserted += result.rows_affected();
        }

        debug!(requested = records.len(), inserted, "Staged outbox inserts");
        Ok(inserted)
    }

    async fn select_batch(
        &mut self,
        tenant_id: &str,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query_as::<_, OutboxRecord>(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM outbox_events
            WHERE tenant_id = $1 AND status = $2
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(tenant_id)
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows)
    }

    async fn mark_sent(&mut self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'SENT', last_error = NULL
            WHERE id = ANY($1) AND status = 'NEW'
            "#,
        )
        .bind(ids)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_error(
        &mut self,
        id: Uuid,
        max_retry: u32,
        error: &str,
    ) -> Result<Option<OutboxStatus>> {
        let max_retry = i32::try_from(max_retry).context("max_retry exceeds the retry_count column")?;

        // Right-hand sides see the pre-update row, hence `retry_count + 1`.
        let status = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE outbox_events
            SET retry_count = retry_count + 1,
                status = CASE WHEN retry_count + 1 >= $2 THEN 'ERR' ELSE status END,
                last_error = $3
            WHERE id = $1 AND status = 'NEW'
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(max_retry)
        .bind(error)
        .fetch_optional(&mut *self.tx)
        .await?;

        status
            .map(|s| s.parse::<OutboxStatus>().map_err(anyhow::Error::from))
            .transpose()
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// sqlx::FromRow for OutboxRecord
// ---------------------------------------------------------------------------

impl<'r> sqlx::FromRow<'r, PgRow> for OutboxRecord {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<OutboxStatus>()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "status".into(),
                source: Box::new(e),
            })?;

        Ok(OutboxRecord {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            schema_id: row.try_get("schema_id")?,
            schema_version: row.try_get("schema_version")?,
            payload: row.try_get("payload")?,
            status,
            retry_count: row.try_get("retry_count")?,
            created_at: row.try_get("created_at")?,
            occurred_at: row.try_get("occurred_at")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Test utilities
// ---------------------------------------------------------------------------

#[cfg(feature = "test-utils")]
impl PgOutboxStore {
    /// Every row, oldest first (for tests).
    pub async fn read_all(&self) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query_as::<_, OutboxRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM outbox_events ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
