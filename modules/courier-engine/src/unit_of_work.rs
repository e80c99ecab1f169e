//! UnitOfWork: the transaction boundary on the write side.
//!
//! ```text
//! Idle ──begin──▶ Active ──commit──▶ Committing ──▶ Idle
//!                   │
//!                   └──rollback──▶ RollingBack ──▶ Idle
//! ```
//!
//! On commit the unit of work drains tracked aggregates, runs its pre-commit
//! hooks (the outbox capture hook first) inside the open transaction, commits,
//! and then optionally hands the events to an immediate publisher. Immediate
//! publish is best effort and never writes `SENT`; the projector owns that.

use std::sync::Arc;

use courier_events::DomainEvent;
use courier_store::{OutboxStore, OutboxTransaction};
use tracing::{debug, info, warn};

use crate::aggregate::{Aggregate, EventRecorder};
use crate::capture::{OutboxCapture, PreCommitHook};
use crate::publisher::{EventPublisher, PublishError};
use crate::retry::PublishRetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UowState {
    Idle,
    Active,
    Committing,
    RollingBack,
}

#[derive(Debug, thiserror::Error)]
pub enum UnitOfWorkError {
    #[error("unit of work is not active")]
    NotActive,

    #[error("unit of work is already active")]
    AlreadyActive,

    #[error("failed to begin transaction: {0:#}")]
    Begin(anyhow::Error),

    #[error("flush failed, transaction rolled back: {0:#}")]
    Flush(anyhow::Error),

    #[error("commit failed, nothing was persisted: {0:#}")]
    Commit(anyhow::Error),

    #[error("rollback failed: {0:#}")]
    Rollback(anyhow::Error),
}

/// What happened after a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// No publisher configured, or nothing to publish.
    NotPublished { events: usize },
    /// The immediate publisher accepted every event.
    Published { events: usize, attempts: u32 },
    /// Immediate publish gave up. The rows are committed and the projector
    /// will deliver them.
    Deferred {
        events: usize,
        attempts: u32,
        last_error: String,
    },
}

impl CommitOutcome {
    pub fn events(&self) -> usize {
        match self {
            CommitOutcome::NotPublished { events }
            | CommitOutcome::Published { events, .. }
            | CommitOutcome::Deferred { events, .. } => *events,
        }
    }
}

pub struct UnitOfWork<S: OutboxStore> {
    store: S,
    tx: Option<S::Tx>,
    state: UowState,
    tracked: Vec<Arc<dyn Aggregate>>,
    pending: Vec<DomainEvent>,
    /// Events in `pending[..collected]` came from tracked aggregates; the rest
    /// were registered directly.
    collected: usize,
    hooks: Vec<Arc<dyn PreCommitHook<S::Tx>>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    retry: PublishRetryPolicy,
}

impl<S: OutboxStore> UnitOfWork<S> {
    /// A unit of work with the outbox capture hook installed and no
    /// immediate publisher.
    pub fn new(store: S) -> Self {
        Self {
            store,
            tx: None,
            state: UowState::Idle,
            tracked: Vec::new(),
            pending: Vec::new(),
            collected: 0,
            hooks: vec![Arc::new(OutboxCapture) as Arc<dyn PreCommitHook<S::Tx>>],
            publisher: None,
            retry: PublishRetryPolicy::default(),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_retry(mut self, retry: PublishRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Add a hook that runs after the capture hook.
    pub fn with_hook(mut self, hook: Arc<dyn PreCommitHook<S::Tx>>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn state(&self) -> UowState {
        self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Events collected or registered and not yet committed.
    pub fn pending_events(&self) -> &[DomainEvent] {
        &self.pending
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    pub async fn begin(&mut self) -> Result<(), UnitOfWorkError> {
        if self.state != UowState::Idle {
            return Err(UnitOfWorkError::AlreadyActive);
        }
        let tx = self.store.begin().await.map_err(UnitOfWorkError::Begin)?;
        self.tx = Some(tx);
        self.state = UowState::Active;
        debug!("Unit of work started");
        Ok(())
    }

    /// The open transaction, for business writes that must commit together
    /// with the outbox rows.
    pub fn transaction(&mut self) -> Result<&mut S::Tx, UnitOfWorkError> {
        match self.state {
            UowState::Active => self.tx.as_mut().ok_or(UnitOfWorkError::NotActive),
            _ => Err(UnitOfWorkError::NotActive),
        }
    }

    /// Track an aggregate so its buffered events are collected at commit.
    /// Tracking the same handle twice is a no-op.
    pub fn track(&mut self, aggregate: Arc<dyn Aggregate>) -> Result<(), UnitOfWorkError> {
        self.ensure_active()?;
        let ptr = Arc::as_ptr(&aggregate) as *const ();
        if !self.tracked.iter().any(|a| Arc::as_ptr(a) as *const () == ptr) {
            self.tracked.push(aggregate);
        }
        Ok(())
    }

    pub fn register_event(&mut self, event: DomainEvent) -> Result<(), UnitOfWorkError> {
        self.ensure_active()?;
        self.pending.push(event);
        Ok(())
    }

    /// Drain every tracked aggregate's buffer into the pending queue, ahead of
    /// directly registered events. Returns how many events were collected.
    pub fn collect_events(&mut self) -> usize {
        let drained: Vec<DomainEvent> = self
            .tracked
            .iter()
            .flat_map(|aggregate| aggregate.event_buffer().drain())
            .collect();
        let count = drained.len();

        let at = self.collected;
        self.pending.splice(at..at, drained);
        self.collected += count;
        count
    }

    /// Collect and run the pre-commit hooks without committing.
    ///
    /// Running it again, or committing afterwards, does not duplicate rows.
    /// On failure the transaction is rolled back and the unit of work is idle.
    pub async fn flush(&mut self) -> Result<(), UnitOfWorkError> {
        self.ensure_active()?;
        self.collect_events();

        let Some(mut tx) = self.tx.take() else {
            return Err(UnitOfWorkError::NotActive);
        };
        if let Err(e) = self.run_hooks(&mut tx).await {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback after failed flush also failed");
            }
            self.reset();
            return Err(UnitOfWorkError::Flush(e));
        }
        self.tx = Some(tx);
        Ok(())
    }

    /// Persist pending events atomically with the business writes, then try
    /// an immediate publish if a publisher is configured.
    ///
    /// Only a failure to persist is an error. Publish problems are reported in
    /// the returned [`CommitOutcome`].
    pub async fn commit(&mut self) -> Result<CommitOutcome, UnitOfWorkError> {
        self.ensure_active()?;
        self.collect_events();
        self.state = UowState::Committing;

        let persisted = self.persist().await;
        let events = std::mem::take(&mut self.pending);
        self.reset();
        persisted?;

        info!(events = events.len(), "Unit of work committed");

        let Some(publisher) = self.publisher.clone() else {
            return Ok(CommitOutcome::NotPublished {
                events: events.len(),
            });
        };
        if events.is_empty() {
            return Ok(CommitOutcome::NotPublished { events: 0 });
        }
        Ok(self.publish_immediately(publisher.as_ref(), &events).await)
    }

    /// Abort the transaction and drop everything pending. Never publishes and
    /// never runs hooks.
    pub async fn rollback(&mut self) -> Result<(), UnitOfWorkError> {
        self.ensure_active()?;
        self.state = UowState::RollingBack;

        let discarded = self.pending.len();
        let result = match self.tx.take() {
            Some(tx) => tx.rollback().await,
            None => Ok(()),
        };
        self.reset();

        debug!(discarded, "Unit of work rolled back");
        result.map_err(UnitOfWorkError::Rollback)
    }

    async fn persist(&mut self) -> Result<(), UnitOfWorkError> {
        let Some(mut tx) = self.tx.take() else {
            return Err(UnitOfWorkError::NotActive);
        };

        if let Err(e) = self.run_hooks(&mut tx).await {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback after failed pre-commit hook also failed");
            }
            return Err(UnitOfWorkError::Commit(e));
        }

        tx.commit().await.map_err(UnitOfWorkError::Commit)
    }

    async fn run_hooks(&self, tx: &mut S::Tx) -> anyhow::Result<()> {
        for hook in &self.hooks {
            hook.before_commit(tx, &self.pending).await?;
        }
        Ok(())
    }

    async fn publish_immediately(
        &self,
        publisher: &dyn EventPublisher,
        events: &[DomainEvent],
    ) -> CommitOutcome {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let result = match tokio::time::timeout(
                self.retry.attempt_timeout,
                publisher.publish_batch(events),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PublishError::Timeout(self.retry.attempt_timeout)),
            };

            match result {
                Ok(()) => {
                    debug!(events = events.len(), attempt, "Immediate publish succeeded");
                    return CommitOutcome::Published {
                        events: events.len(),
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    warn!(attempt, max_attempts, error = %e, "Immediate publish failed");
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        warn!(
            events = events.len(),
            attempts = max_attempts,
            "Immediate publish exhausted, leaving delivery to the projector"
        );
        CommitOutcome::Deferred {
            events: events.len(),
            attempts: max_attempts,
            last_error,
        }
    }

    fn ensure_active(&self) -> Result<(), UnitOfWorkError> {
        if self.state == UowState::Active && self.tx.is_some() {
            Ok(())
        } else {
            Err(UnitOfWorkError::NotActive)
        }
    }

    fn reset(&mut self) {
        self.tx = None;
        self.pending.clear();
        self.collected = 0;
        self.tracked.clear();
        self.state = UowState::Idle;
    }
}

impl<S: OutboxStore> EventRecorder for UnitOfWork<S> {
    fn record(&mut self, event: DomainEvent) -> Result<(), UnitOfWorkError> {
        self.register_event(event)
    }
}
