//! UnitOfWork against the in-memory store.
//! Covers atomic capture, idempotent flush, rollback, and immediate publish.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_engine::{
    Aggregate, CommitOutcome, EventBuffer, EventRecorder, MemoryPublisher, PreCommitHook,
    PublishRetryPolicy, UnitOfWork, UnitOfWorkError, UowState,
};
use courier_events::{DomainEvent, Event};
use courier_store::{MemoryOutboxStore, MemoryTransaction, OutboxStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

// =========================================================================
// Fixtures
// =========================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderCreated {
    order_id: Uuid,
    total_cents: i64,
}

impl Event for OrderCreated {
    const TYPE: &'static str = "orders.created";
}

struct Order {
    id: Uuid,
    events: EventBuffer,
}

impl Order {
    fn place(total_cents: i64) -> Arc<Self> {
        let order = Arc::new(Self {
            id: Uuid::new_v4(),
            events: EventBuffer::new(),
        });
        let event = DomainEvent::new(&OrderCreated {
            order_id: order.id,
            total_cents,
        })
        .unwrap()
        .with_tenant("acme");
        order.raise(event);
        order
    }
}

impl Aggregate for Order {
    fn aggregate_id(&self) -> String {
        self.id.to_string()
    }

    fn event_buffer(&self) -> &EventBuffer {
        &self.events
    }
}

struct RejectingHook;

#[async_trait]
impl PreCommitHook<MemoryTransaction> for RejectingHook {
    async fn before_commit(
        &self,
        _tx: &mut MemoryTransaction,
        _pending: &[DomainEvent],
    ) -> anyhow::Result<()> {
        anyhow::bail!("validation failed")
    }
}

fn fast_retry() -> PublishRetryPolicy {
    PublishRetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        multiplier: 2.0,
        max_delay: Duration::from_millis(5),
        attempt_timeout: Duration::from_secs(1),
    }
}

fn note(text: &str) -> DomainEvent {
    DomainEvent::untyped("orders.note_added", json!({ "text": text })).with_tenant("acme")
}

// =========================================================================
// Commit and capture
// =========================================================================

#[tokio::test]
async fn commit_without_publisher_leaves_one_new_row() {
    let store = MemoryOutboxStore::new();
    let mut uow = UnitOfWork::new(store.clone());
    let order = Order::place(4200);
    let staged = order.event_buffer().drain();
    let event_id = staged[0].event_id();
    order.raise(staged.into_iter().next().unwrap());

    uow.begin().await.unwrap();
    uow.track(order.clone()).unwrap();
    let outcome = uow.commit().await.unwrap();

    assert_eq!(outcome, CommitOutcome::NotPublished { events: 1 });
    let rows = store.records();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, event_id);
    assert_eq!(rows[0].status, OutboxStatus::New);
    assert_eq!(rows[0].retry_count, 0);
    assert_eq!(rows[0].tenant_id, "acme");
    assert_eq!(rows[0].aggregate_id.as_deref(), Some(order.id.to_string().as_str()));
    assert_eq!(uow.state(), UowState::Idle);
}

#[tokio::test]
async fn successful_immediate_publish_does_not_mark_sent() {
    let store = MemoryOutboxStore::new();
    let publisher = Arc::new(MemoryPublisher::new());
    let mut uow = UnitOfWork::new(store.clone()).with_publisher(publisher.clone());

    uow.begin().await.unwrap();
    uow.track(Order::place(100)).unwrap();
    let outcome = uow.commit().await.unwrap();

    assert_eq!(outcome, CommitOutcome::Published { events: 1, attempts: 1 });
    assert_eq!(publisher.published().len(), 1);
    assert_eq!(store.records()[0].status, OutboxStatus::New);
}

#[tokio::test]
async fn business_rows_and_outbox_rows_commit_together() {
    let store = MemoryOutboxStore::new();
    let mut uow = UnitOfWork::new(store.clone());

    uow.begin().await.unwrap();
    uow.transaction().unwrap().stage_row("orders", json!({"total_cents": 100}));
    uow.track(Order::place(100)).unwrap();
    uow.commit().await.unwrap();

    assert_eq!(store.rows("orders").len(), 1);
    assert_eq!(store.records().len(), 1);
}

#[tokio::test]
async fn failing_hook_persists_neither_business_nor_outbox_rows() {
    let store = MemoryOutboxStore::new();
    let mut uow = UnitOfWork::new(store.clone()).with_hook(Arc::new(RejectingHook));

    uow.begin().await.unwrap();
    uow.transaction().unwrap().stage_row("orders", json!({"total_cents": 100}));
    uow.track(Order::place(100)).unwrap();
    let err = uow.commit().await.unwrap_err();

    assert!(matches!(err, UnitOfWorkError::Commit(_)));
    assert!(store.rows("orders").is_empty());
    assert!(store.records().is_empty());
    assert_eq!(uow.state(), UowState::Idle);
    assert!(uow.pending_events().is_empty());
}

#[tokio::test]
async fn failed_database_commit_persists_nothing_and_skips_publish() {
    let store = MemoryOutboxStore::new();
    let publisher = Arc::new(MemoryPublisher::new());
    let mut uow = UnitOfWork::new(store.clone()).with_publisher(publisher.clone());
    store.fail_next_commit();

    uow.begin().await.unwrap();
    uow.transaction().unwrap().stage_row("orders", json!({"total_cents": 100}));
    uow.register_event(note("hello")).unwrap();
    assert!(uow.commit().await.is_err());

    assert!(store.rows("orders").is_empty());
    assert!(store.records().is_empty());
    assert_eq!(publisher.batch_calls(), 0);
}

#[tokio::test]
async fn flush_then_commit_inserts_each_event_once() {
    let store = MemoryOutboxStore::new();
    let mut uow = UnitOfWork::new(store.clone());

    uow.begin().await.unwrap();
    uow.track(Order::place(100)).unwrap();
    uow.register_event(note("first")).unwrap();
    uow.flush().await.unwrap();
    uow.flush().await.unwrap();
    uow.commit().await.unwrap();

    assert_eq!(store.records().len(), 2);
}

#[tokio::test]
async fn failing_flush_rolls_back_and_goes_idle() {
    let store = MemoryOutboxStore::new();
    let mut uow = UnitOfWork::new(store.clone()).with_hook(Arc::new(RejectingHook));

    uow.begin().await.unwrap();
    uow.register_event(note("x")).unwrap();
    let err = uow.flush().await.unwrap_err();

    assert!(matches!(err, UnitOfWorkError::Flush(_)));
    assert_eq!(uow.state(), UowState::Idle);
    assert!(uow.pending_events().is_empty());
    assert!(store.records().is_empty());
}

#[tokio::test]
async fn same_event_committed_twice_keeps_one_row() {
    let store = MemoryOutboxStore::new();
    let event = note("retry me");

    for _ in 0..2 {
        let mut uow = UnitOfWork::new(store.clone());
        uow.begin().await.unwrap();
        uow.register_event(event.clone()).unwrap();
        uow.commit().await.unwrap();
    }

    let rows = store.records();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, event.event_id());
}

// =========================================================================
// Tracking and ordering
// =========================================================================

#[tokio::test]
async fn tracked_aggregates_come_before_registered_events() {
    let store = MemoryOutboxStore::new();
    let mut uow = UnitOfWork::new(store.clone());
    let first = Order::place(1);
    let second = Order::place(2);

    uow.begin().await.unwrap();
    uow.register_event(note("direct")).unwrap();
    uow.track(first.clone()).unwrap();
    uow.track(second.clone()).unwrap();
    uow.track(first.clone()).unwrap();
    assert_eq!(uow.tracked_count(), 2);

    uow.collect_events();
    let order: Vec<String> = uow
        .pending_events()
        .iter()
        .map(|e| e.aggregate_id().unwrap_or("direct").to_string())
        .collect();
    assert_eq!(order, vec![first.id.to_string(), second.id.to_string(), "direct".to_string()]);

    // Draining again finds nothing new.
    assert_eq!(uow.collect_events(), 0);
    uow.commit().await.unwrap();
    assert_eq!(store.records().len(), 3);
}

#[tokio::test]
async fn use_cases_record_through_the_recorder_capability() {
    fn rename_customer(recorder: &mut dyn EventRecorder, name: &str) -> Result<(), UnitOfWorkError> {
        recorder.record(DomainEvent::untyped("customers.renamed", json!({ "name": name })))
    }

    let store = MemoryOutboxStore::new();
    let mut uow = UnitOfWork::new(store.clone());

    assert!(matches!(
        rename_customer(&mut uow, "ada"),
        Err(UnitOfWorkError::NotActive)
    ));

    uow.begin().await.unwrap();
    rename_customer(&mut uow, "ada").unwrap();
    uow.commit().await.unwrap();

    let rows = store.records();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].tenant_id, "default");
}

// =========================================================================
// State machine
// =========================================================================

#[tokio::test]
async fn begin_twice_is_an_error() {
    let mut uow = UnitOfWork::new(MemoryOutboxStore::new());
    uow.begin().await.unwrap();
    assert!(matches!(uow.begin().await, Err(UnitOfWorkError::AlreadyActive)));
    assert_eq!(uow.state(), UowState::Active);
}

#[tokio::test]
async fn commit_or_rollback_without_begin_is_an_error() {
    let mut uow = UnitOfWork::new(MemoryOutboxStore::new());
    assert!(matches!(uow.commit().await, Err(UnitOfWorkError::NotActive)));
    assert!(matches!(uow.rollback().await, Err(UnitOfWorkError::NotActive)));
    assert!(uow.transaction().is_err());
}

#[tokio::test]
async fn rollback_discards_staged_events() {
    let store = MemoryOutboxStore::new();
    let publisher = Arc::new(MemoryPublisher::new());
    let mut uow = UnitOfWork::new(store.clone()).with_publisher(publisher.clone());

    uow.begin().await.unwrap();
    uow.register_event(note("one")).unwrap();
    uow.register_event(note("two")).unwrap();
    uow.rollback().await.unwrap();

    assert!(store.records().is_empty());
    assert!(uow.pending_events().is_empty());
    assert_eq!(uow.tracked_count(), 0);
    assert_eq!(uow.state(), UowState::Idle);
    assert_eq!(publisher.batch_calls(), 0);
}

#[tokio::test]
async fn unit_of_work_is_reusable_after_commit() {
    let store = MemoryOutboxStore::new();
    let mut uow = UnitOfWork::new(store.clone());

    for text in ["a", "b"] {
        uow.begin().await.unwrap();
        uow.register_event(note(text)).unwrap();
        uow.commit().await.unwrap();
    }
    assert_eq!(store.records().len(), 2);
}

// =========================================================================
// Immediate publish
// =========================================================================

#[tokio::test]
async fn transient_publish_failures_are_retried() {
    let store = MemoryOutboxStore::new();
    let publisher = Arc::new(MemoryPublisher::new());
    publisher.fail_next(2);
    let mut uow = UnitOfWork::new(store.clone())
        .with_publisher(publisher.clone())
        .with_retry(fast_retry());

    uow.begin().await.unwrap();
    uow.register_event(note("x")).unwrap();
    let outcome = uow.commit().await.unwrap();

    assert_eq!(outcome, CommitOutcome::Published { events: 1, attempts: 3 });
    assert_eq!(publisher.batch_calls(), 3);
}

#[tokio::test]
async fn exhausted_publish_defers_to_the_projector() {
    let store = MemoryOutboxStore::new();
    let publisher = Arc::new(MemoryPublisher::failing());
    let mut uow = UnitOfWork::new(store.clone())
        .with_publisher(publisher.clone())
        .with_retry(fast_retry());

    uow.begin().await.unwrap();
    uow.register_event(note("x")).unwrap();
    let outcome = uow.commit().await.unwrap();

    match outcome {
        CommitOutcome::Deferred { events, attempts, last_error } => {
            assert_eq!(events, 1);
            assert_eq!(attempts, 3);
            assert!(last_error.contains("fail"));
        }
        other => panic!("expected Deferred, got {other:?}"),
    }
    assert_eq!(publisher.batch_calls(), 3);
    assert_eq!(store.records()[0].status, OutboxStatus::New);
}

#[tokio::test]
async fn stalled_publish_counts_as_a_failed_attempt() {
    let store = MemoryOutboxStore::new();
    let publisher = Arc::new(MemoryPublisher::stalling(Duration::from_millis(200)));
    let retry = PublishRetryPolicy {
        max_attempts: 1,
        attempt_timeout: Duration::from_millis(10),
        ..fast_retry()
    };
    let mut uow = UnitOfWork::new(store.clone())
        .with_publisher(publisher)
        .with_retry(retry);

    uow.begin().await.unwrap();
    uow.register_event(note("x")).unwrap();
    let outcome = uow.commit().await.unwrap();

    assert!(matches!(outcome, CommitOutcome::Deferred { attempts: 1, .. }));
    assert_eq!(store.records().len(), 1);
}

#[tokio::test]
async fn empty_commit_does_not_call_the_publisher() {
    let publisher = Arc::new(MemoryPublisher::new());
    let mut uow = UnitOfWork::new(MemoryOutboxStore::new()).with_publisher(publisher.clone());

    uow.begin().await.unwrap();
    let outcome = uow.commit().await.unwrap();

    assert_eq!(outcome.events(), 0);
    assert_eq!(publisher.batch_calls(), 0);
}
