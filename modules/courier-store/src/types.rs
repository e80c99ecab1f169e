//! Outbox record model. Storage-agnostic.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use courier_common::DEFAULT_TENANT;
use courier_events::{DomainEvent, EventRegistry};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery status. Only `New → Sent` and `New → Err` are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxStatus {
    New,
    Sent,
    Err,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::New => "NEW",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Err => "ERR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OutboxStatus::New)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown outbox status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for OutboxStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, UnknownStatus> {
        match s {
            "NEW" => Ok(OutboxStatus::New),
            "SENT" => Ok(OutboxStatus::Sent),
            "ERR" => Ok(OutboxStatus::Err),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A domain event as persisted in the outbox, plus delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Equal to the event id. Primary key.
    pub id: Uuid,
    pub tenant_id: String,
    pub aggregate_id: Option<String>,
    pub event_type: String,
    pub schema_id: String,
    pub schema_version: i32,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl OutboxRecord {
    /// Pure mapping from an event. Starts `NEW` with no retries.
    pub fn from_domain_event(event: &DomainEvent) -> Self {
        Self {
            id: event.event_id(),
            tenant_id: event.tenant_id().unwrap_or(DEFAULT_TENANT).to_string(),
            aggregate_id: event.aggregate_id().map(String::from),
            event_type: event.event_type().to_string(),
            schema_id: event.schema_id().to_string(),
            schema_version: event.schema_version(),
            payload: event.payload().clone(),
            status: OutboxStatus::New,
            retry_count: 0,
            created_at: Utc::now(),
            occurred_at: event.occurred_at(),
            last_error: None,
        }
    }

    /// Rebuild the event through the registry.
    ///
    /// Unknown types come back untyped but still carry the row's envelope
    /// metadata, so a relay without registrations delivers them intact.
    pub fn to_domain_event(&self, registry: &EventRegistry) -> DomainEvent {
        let event = registry
            .deserialize(&self.event_type, self.payload.clone())
            .with_event_id(self.id)
            .with_occurred_at(self.occurred_at)
            .with_tenant(self.tenant_id.clone())
            .with_schema(self.schema_id.clone(), self.schema_version);
        match &self.aggregate_id {
            Some(aggregate_id) => event.with_aggregate(aggregate_id.clone()),
            None => event,
        }
    }
}

/// Row counts per status for one tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub new: u64,
    pub sent: u64,
    pub err: u64,
}
