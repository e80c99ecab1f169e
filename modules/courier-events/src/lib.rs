//! Domain events and the type registry used to rebuild them from storage.
//!
//! Events are immutable envelopes (`DomainEvent`) around an opaque JSON payload.
//! Typed event bodies implement [`Event`]; the [`EventRegistry`] maps their
//! type tags back to a decoder so stored payloads can be rehydrated.

pub mod event;
pub mod registry;

pub use event::{DomainEvent, Event};
pub use registry::{EventConstructor, EventRegistry, RegistryError};
