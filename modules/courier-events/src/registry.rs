//! EventRegistry: type tag → constructor map.
//!
//! Built once at startup, then shared read-only (`Arc<EventRegistry>`) with
//! whatever needs to rebuild events from stored rows.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::warn;

use crate::event::{DomainEvent, Event};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("event type '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("expected event types are not registered: {0:?}")]
    MissingTypes(Vec<String>),
}

/// Object-safe constructor for one event type.
///
/// `construct` decodes a stored payload into the typed body and re-encodes it,
/// which turns string-encoded UUIDs and ISO timestamps back into their typed
/// form and rejects payloads that no longer match the type.
pub trait EventConstructor: Send + Sync {
    fn event_type(&self) -> &'static str;
    fn schema_id(&self) -> &'static str;
    fn schema_version(&self) -> i32;
    fn construct(&self, payload: serde_json::Value) -> Result<serde_json::Value, serde_json::Error>;
}

struct TypedConstructor<E: Event> {
    _marker: PhantomData<fn() -> E>,
}

impl<E: Event> TypedConstructor<E> {
    fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E: Event> EventConstructor for TypedConstructor<E> {
    fn event_type(&self) -> &'static str {
        E::TYPE
    }

    fn schema_id(&self) -> &'static str {
        E::SCHEMA_ID
    }

    fn schema_version(&self) -> i32 {
        E::SCHEMA_VERSION
    }

    fn construct(&self, payload: serde_json::Value) -> Result<serde_json::Value, serde_json::Error> {
        let body: E = serde_json::from_value(payload)?;
        serde_json::to_value(&body)
    }
}

#[derive(Default)]
pub struct EventRegistry {
    constructors: HashMap<String, Arc<dyn EventConstructor>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `E` under `E::TYPE`. Registering the same tag twice is an error.
    pub fn register<E: Event>(&mut self) -> Result<(), RegistryError> {
        if self.constructors.contains_key(E::TYPE) {
            return Err(RegistryError::AlreadyRegistered(E::TYPE.to_string()));
        }
        self.constructors
            .insert(E::TYPE.to_string(), Arc::new(TypedConstructor::<E>::new()));
        Ok(())
    }

    /// Register `E`, replacing any existing constructor for the tag.
    /// Returns true if one was replaced.
    pub fn register_override<E: Event>(&mut self) -> bool {
        let replaced = self
            .constructors
            .insert(E::TYPE.to_string(), Arc::new(TypedConstructor::<E>::new()))
            .is_some();
        if replaced {
            warn!(event_type = E::TYPE, "Event type registration overridden");
        }
        replaced
    }

    pub fn resolve(&self, type_name: &str) -> Option<Arc<dyn EventConstructor>> {
        self.constructors.get(type_name).cloned()
    }

    /// Rebuild an event from its stored type tag and payload.
    ///
    /// Never fails: an unknown tag, or a payload that no longer decodes, yields
    /// an untyped event so one bad row cannot block a delivery batch.
    pub fn deserialize(&self, type_name: &str, payload: serde_json::Value) -> DomainEvent {
        let Some(constructor) = self.resolve(type_name) else {
            warn!(event_type = type_name, "Unknown event type, delivering untyped");
            return DomainEvent::untyped(type_name, payload);
        };

        match constructor.construct(payload.clone()) {
            Ok(rehydrated) => DomainEvent::rehydrated(
                constructor.event_type(),
                constructor.schema_id(),
                constructor.schema_version(),
                rehydrated,
            ),
            Err(e) => {
                warn!(
                    event_type = type_name,
                    error = %e,
                    "Payload does not match registered type, delivering untyped"
                );
                DomainEvent::untyped(type_name, payload)
            }
        }
    }

    /// Fail fast if any of `expected` has no constructor.
    pub fn expect_types(&self, expected: &[&str]) -> Result<(), RegistryError> {
        let missing: Vec<String> = expected
            .iter()
            .filter(|t| !self.constructors.contains_key(**t))
            .map(|t| t.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::MissingTypes(missing))
        }
    }

    /// Registered type tags, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.constructors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}
