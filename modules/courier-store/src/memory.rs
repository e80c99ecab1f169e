//! MemoryOutboxStore: in-process outbox for tests and embedding.
//!
//! Mirrors the Postgres semantics the rest of the crate relies on: writes are
//! staged per transaction and applied together on commit, and claimed rows are
//! locked until the claiming transaction ends, with other claimants skipping
//! them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::traits::{OutboxStore, OutboxTransaction};
use crate::types::{OutboxRecord, OutboxStats, OutboxStatus};

#[derive(Default)]
struct MemoryState {
    records: HashMap<Uuid, OutboxRecord>,
    /// Insertion order of `records`.
    order: Vec<Uuid>,
    /// Business rows by table name, committed alongside outbox rows.
    tables: HashMap<String, Vec<serde_json::Value>>,
    locked: HashSet<Uuid>,
    fail_next_commit: bool,
}

#[derive(Clone, Default)]
pub struct MemoryOutboxStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.inner)
    }

    /// Committed outbox rows in insertion order.
    pub fn records(&self) -> Vec<OutboxRecord> {
        let state = self.state();
        state
            .order
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect()
    }

    pub fn record(&self, id: Uuid) -> Option<OutboxRecord> {
        self.state().records.get(&id).cloned()
    }

    /// Committed business rows written through [`MemoryTransaction::stage_row`].
    pub fn rows(&self, table: &str) -> Vec<serde_json::Value> {
        self.state().tables.get(table).cloned().unwrap_or_default()
    }

    /// Insert a committed row directly, bypassing any transaction.
    pub fn seed(&self, record: OutboxRecord) {
        let mut state = self.state();
        if !state.records.contains_key(&record.id) {
            state.order.push(record.id);
        }
        state.records.insert(record.id, record);
    }

    /// Make the next commit fail after its writes were staged. Nothing staged
    /// by that transaction becomes visible.
    pub fn fail_next_commit(&self) {
        self.state().fail_next_commit = true;
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction> {
        Ok(MemoryTransaction {
            inner: self.inner.clone(),
            staged_records: Vec::new(),
            staged_rows: Vec::new(),
            pending_updates: HashMap::new(),
            held_locks: HashSet::new(),
            finished: false,
        })
    }

    async fn find(&self, id: Uuid) -> Result<Option<OutboxRecord>> {
        Ok(self.record(id))
    }

    async fn stats(&self, tenant_id: &str) -> Result<OutboxStats> {
        let state = self.state();
        let mut stats = OutboxStats::default();
        for record in state.records.values().filter(|r| r.tenant_id == tenant_id) {
            match record.status {
                OutboxStatus::New => stats.new += 1,
                OutboxStatus::Sent => stats.sent += 1,
                OutboxStatus::Err => stats.err += 1,
            }
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// MemoryTransaction
// ---------------------------------------------------------------------------

pub struct MemoryTransaction {
    inner: Arc<Mutex<MemoryState>>,
    staged_records: Vec<OutboxRecord>,
    staged_rows: Vec<(String, serde_json::Value)>,
    /// Updated copies of committed rows this transaction holds locked.
    pending_updates: HashMap<Uuid, OutboxRecord>,
    held_locks: HashSet<Uuid>,
    finished: bool,
}

impl MemoryTransaction {
    /// Stage a business row. Visible through [`MemoryOutboxStore::rows`] only
    /// after commit.
    pub fn stage_row(&mut self, table: impl Into<String>, row: serde_json::Value) {
        self.staged_rows.push((table.into(), row));
    }

    /// This transaction's view of a row: its own staged insert or update
    /// first, then the committed row.
    fn current(&self, state: &MemoryState, id: Uuid) -> Option<OutboxRecord> {
        if let Some(staged) = self.staged_records.iter().find(|r| r.id == id) {
            return Some(staged.clone());
        }
        if let Some(updated) = self.pending_updates.get(&id) {
            return Some(updated.clone());
        }
        state.records.get(&id).cloned()
    }

    fn write(&mut self, record: OutboxRecord) {
        if let Some(staged) = self.staged_records.iter_mut().find(|r| r.id == record.id) {
            *staged = record;
        } else {
            self.pending_updates.insert(record.id, record);
        }
    }

    /// Take the row lock before updating a committed row. A row locked by
    /// another transaction is not writable here.
    fn lock_for_write(&mut self, state: &mut MemoryState, id: Uuid) -> bool {
        if self.held_locks.contains(&id) || self.staged_records.iter().any(|r| r.id == id) {
            return true;
        }
        if state.locked.contains(&id) {
            return false;
        }
        state.locked.insert(id);
        self.held_locks.insert(id);
        true
    }

    fn release(&mut self, state: &mut MemoryState) {
        for id in self.held_locks.drain() {
            state.locked.remove(&id);
        }
        self.finished = true;
    }
}

#[async_trait]
impl OutboxTransaction for MemoryTransaction {
    async fn exists_any(&mut self, ids: &[Uuid]) -> Result<HashSet<Uuid>> {
        let state = lock(&self.inner);
        Ok(ids
            .iter()
            .copied()
            .filter(|id| {
                state.records.contains_key(id) || self.staged_records.iter().any(|r| r.id == *id)
            })
            .collect())
    }

    async fn insert(&mut self, records: &[OutboxRecord]) -> Result<u64> {
        let existing: HashSet<Uuid> = {
            let state = lock(&self.inner);
            records
                .iter()
                .map(|r| r.id)
                .filter(|id| state.records.contains_key(id))
                .collect()
        };

        let mut inserted = 0;
        for record in records {
            if existing.contains(&record.id) || self.staged_records.iter().any(|r| r.id == record.id) {
                continue;
            }
            self.staged_records.push(record.clone());
            inserted += 1;
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
        let inner = self.inner.clone();
        let mut state = lock(&inner);

        let mut candidates: Vec<OutboxRecord> = state
            .records
            .keys()
            .filter(|id| self.held_locks.contains(*id) || !state.locked.contains(*id))
            .filter_map(|id| self.current(&state, *id))
            .filter(|r| r.tenant_id == tenant_id && r.status == status)
            .collect();
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        candidates.truncate(limit);

        for record in &candidates {
            state.locked.insert(record.id);
            self.held_locks.insert(record.id);
        }
        Ok(candidates)
    }

    async fn mark_sent(&mut self, ids: &[Uuid]) -> Result<u64> {
        let inner = self.inner.clone();
        let updates: Vec<OutboxRecord> = {
            let mut state = lock(&inner);
            let mut updates = Vec::new();
            for id in ids {
                let Some(mut record) = self.current(&state, *id) else {
                    continue;
                };
                if record.status != OutboxStatus::New || !self.lock_for_write(&mut state, *id) {
                    continue;
                }
                record.status = OutboxStatus::Sent;
                record.last_error = None;
                updates.push(record);
            }
            updates
        };

        let updated = updates.len() as u64;
        for record in updates {
            self.write(record);
        }
        Ok(updated)
    }

    async fn mark_error(
        &mut self,
        id: Uuid,
        max_retry: u32,
        error: &str,
    ) -> Result<Option<OutboxStatus>> {
        let inner = self.inner.clone();
        let current = {
            let mut state = lock(&inner);
            self.current(&state, id)
                .filter(|r| r.status == OutboxStatus::New)
                .filter(|_| self.lock_for_write(&mut state, id))
        };

        let Some(mut record) = current else {
            return Ok(None);
        };

        record.retry_count += 1;
        if record.retry_count as i64 >= max_retry as i64 {
            record.status = OutboxStatus::Err;
        }
        record.last_error = Some(error.to_string());
        let status = record.status;
        self.write(record);
        Ok(Some(status))
    }

    async fn commit(mut self) -> Result<()> {
        let inner = self.inner.clone();
        let mut state = lock(&inner);

        if state.fail_next_commit {
            state.fail_next_commit = false;
            self.release(&mut state);
            bail!("commit failed (injected)");
        }

        for record in std::mem::take(&mut self.staged_records) {
            if state.records.contains_key(&record.id) {
                continue;
            }
            state.order.push(record.id);
            state.records.insert(record.id, record);
        }
        for (id, record) in std::mem::take(&mut self.pending_updates) {
            state.records.insert(id, record);
        }
        for (table, row) in std::mem::take(&mut self.staged_rows) {
            state.tables.entry(table).or_default().push(row);
        }

        self.release(&mut state);
        Ok(())
    }

    async fn rollback(mut self) -> Result<()> {
        let inner = self.inner.clone();
        let mut state = lock(&inner);
        self.release(&mut state);
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let inner = self.inner.clone();
        let mut state = lock(&inner);
        self.release(&mut state);
    }
}

fn lock(inner: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}
