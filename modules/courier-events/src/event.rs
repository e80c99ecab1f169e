//! The event envelope and the trait typed event bodies implement.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A typed event body.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct OrderCreated { order_id: Uuid, placed_at: DateTime<Utc> }
///
/// impl Event for OrderCreated {
///     const TYPE: &'static str = "orders.order_created";
/// }
/// ```
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type tag stored in the outbox `type` column.
    const TYPE: &'static str;

    /// Identifier of the payload schema. Defaults to the type tag.
    const SCHEMA_ID: &'static str = Self::TYPE;

    const SCHEMA_VERSION: i32 = 1;
}

/// An immutable domain event envelope.
///
/// `event_id` is the idempotency key: the outbox keeps exactly one row per id
/// and consumers dedupe on it. The `with_*` builders consume the event and are
/// meant for assembling it before it is staged; nothing mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    event_id: Uuid,
    #[serde(rename = "type")]
    event_type: String,
    occurred_at: DateTime<Utc>,
    tenant_id: Option<String>,
    aggregate_id: Option<String>,
    schema_id: String,
    schema_version: i32,
    payload: serde_json::Value,
    #[serde(skip)]
    untyped: bool,
}

impl DomainEvent {
    /// Wrap a typed body in a fresh envelope (new id, current time).
    pub fn new<E: Event>(body: &E) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type: E::TYPE.to_string(),
            occurred_at: Utc::now(),
            tenant_id: None,
            aggregate_id: None,
            schema_id: E::SCHEMA_ID.to_string(),
            schema_version: E::SCHEMA_VERSION,
            payload: serde_json::to_value(body)?,
            untyped: false,
        })
    }

    /// A minimal envelope for a type the registry does not know.
    /// Carries the type tag and payload only.
    pub fn untyped(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            occurred_at: Utc::now(),
            tenant_id: None,
            aggregate_id: None,
            schema_id: String::new(),
            schema_version: 0,
            payload,
            untyped: true,
        }
    }

    pub(crate) fn rehydrated(
        event_type: &str,
        schema_id: &str,
        schema_version: i32,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            occurred_at: Utc::now(),
            tenant_id: None,
            aggregate_id: None,
            schema_id: schema_id.to_string(),
            schema_version,
            payload,
            untyped: false,
        }
    }

    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_aggregate(mut self, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    /// Override the schema stamp. An untyped event stays untyped.
    pub fn with_schema(mut self, schema_id: impl Into<String>, schema_version: i32) -> Self {
        self.schema_id = schema_id.into();
        self.schema_version = schema_version;
        self
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn aggregate_id(&self) -> Option<&str> {
        self.aggregate_id.as_deref()
    }

    pub fn schema_id(&self) -> &str {
        &self.schema_id
    }

    pub fn schema_version(&self) -> i32 {
        self.schema_version
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// True when the registry could not resolve this event's type.
    pub fn is_untyped(&self) -> bool {
        self.untyped
    }

    /// Decode the payload back into its typed body.
    pub fn decode<E: Event>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
