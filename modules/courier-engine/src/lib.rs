//! Outbox delivery engine.
//!
//! The write side is a [`UnitOfWork`]: aggregates stage events, the capture
//! hook persists them in the same transaction as the business write, and an
//! optional publisher gets a best-effort attempt right after commit. The read
//! side is the [`Projector`], a per-tenant worker that claims unsent rows,
//! publishes them and moves each row to `SENT` or, after repeated failure, `ERR`.

pub mod aggregate;
pub mod capture;
pub mod projector;
pub mod publisher;
pub mod retry;
pub mod unit_of_work;

pub use aggregate::{Aggregate, EventBuffer, EventRecorder};
pub use capture::{CaptureReport, OutboxCapture, PreCommitHook};
pub use projector::{CycleReport, Projector, ProjectorConfig};
#[cfg(any(test, feature = "test-utils"))]
pub use publisher::MemoryPublisher;
pub use publisher::{EventPublisher, LogPublisher, PublishError, WebhookPublisher};
pub use retry::PublishRetryPolicy;
pub use unit_of_work::{CommitOutcome, UnitOfWork, UnitOfWorkError, UowState};
