//! Outbox persistence: the record model, the store traits, and the Postgres
//! and in-memory implementations.
//!
//! Rows are created in the same transaction as the business write that caused
//! them and afterwards mutated only by the projector (`NEW → SENT | ERR`).
//! The core never deletes rows; retention belongs to whoever operates the table.

pub mod memory;
pub mod store;
pub mod traits;
pub mod types;

pub use memory::{MemoryOutboxStore, MemoryTransaction};
pub use store::{PgOutboxStore, PgOutboxTransaction};
pub use traits::{OutboxStore, OutboxTransaction};
pub use types::{OutboxRecord, OutboxStats, OutboxStatus, UnknownStatus};
