//! Aggregates and the capability to record events.
//!
//! Aggregates never see a unit of work. They either buffer events on
//! themselves (drained when the unit of work collects) or are handed an
//! explicit `&mut dyn EventRecorder` by the use case that drives them.

use std::sync::Mutex;

use courier_events::DomainEvent;

use crate::unit_of_work::UnitOfWorkError;

/// Pending events raised by one aggregate, in the order they were raised.
#[derive(Debug, Default)]
pub struct EventBuffer {
    pending: Mutex<Vec<DomainEvent>>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: DomainEvent) {
        self.lock().push(event);
    }

    /// Take every pending event. A second drain returns nothing.
    pub fn drain(&self) -> Vec<DomainEvent> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DomainEvent>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A domain object that raises events.
///
/// Shared as `Arc<dyn Aggregate>` with the unit of work, so the buffer is
/// reached through `&self`.
pub trait Aggregate: Send + Sync + 'static {
    fn aggregate_id(&self) -> String;

    fn event_buffer(&self) -> &EventBuffer;

    /// Buffer `event`, stamping this aggregate's id unless it already has one.
    fn raise(&self, event: DomainEvent) {
        let event = if event.aggregate_id().is_none() {
            event.with_aggregate(self.aggregate_id())
        } else {
            event
        };
        self.event_buffer().push(event);
    }
}

/// Somewhere to record events for the current transaction.
pub trait EventRecorder {
    fn record(&mut self, event: DomainEvent) -> Result<(), UnitOfWorkError>;
}
