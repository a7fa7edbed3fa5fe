use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AggregateId, CommandId, InstanceKey, TenantId};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-instance event version, used for optimistic concurrency control.
///
/// Versions start at 1 for the first event and increment by 1 for each
/// subsequent event on an instance. An instance without history is at 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) for an instance without events.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the first version (1) for the first event.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// A journal record: one domain event with everything needed to store,
/// replay and project it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// Canonical type identifier of the event.
    pub event_type: String,

    /// The type of aggregate (e.g., "Data", "Account").
    pub aggregate_type: String,

    /// The instance this event belongs to.
    pub aggregate_id: AggregateId,

    /// Tenant owning the instance.
    pub tenant_id: TenantId,

    /// Per-instance version of this event.
    pub version: Version,

    /// Schema version of `payload`, used to upcast old events.
    #[serde(default)]
    pub schema_version: u32,

    /// Idempotency key of the command that produced this event.
    #[serde(default)]
    pub command_id: Option<CommandId>,

    /// Global position assigned by the journal on append; 0 until then.
    #[serde(default)]
    pub journal_offset: i64,

    /// When the event was created.
    pub timestamp: DateTime<Utc>,

    /// The event payload as JSON.
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Returns the key of the instance this event belongs to.
    pub fn instance_key(&self) -> InstanceKey {
        InstanceKey::new(
            self.aggregate_type.clone(),
            self.aggregate_id.clone(),
            self.tenant_id.clone(),
        )
    }

    /// Returns true when the event belongs to the given instance.
    pub fn belongs_to(&self, key: &InstanceKey) -> bool {
        self.aggregate_type == key.aggregate_type
            && self.aggregate_id == key.aggregate_id
            && self.tenant_id == key.tenant_id
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    event_type: Option<String>,
    instance: Option<InstanceKey>,
    version: Option<Version>,
    schema_version: u32,
    command_id: Option<CommandId>,
    timestamp: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
}

impl EventEnvelopeBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets aggregate type, instance id and tenant in one go.
    pub fn instance(mut self, key: InstanceKey) -> Self {
        self.instance = Some(key);
        self
    }

    /// Sets the version.
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    /// Sets the originating command.
    pub fn command_id(mut self, command_id: CommandId) -> Self {
        self.command_id = Some(command_id);
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the event envelope.
    ///
    /// # Panics
    ///
    /// Panics if required fields (event_type, instance, version, payload)
    /// are not set.
    pub fn build(self) -> EventEnvelope {
        let instance = self.instance.expect("instance is required");
        EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self.event_type.expect("event_type is required"),
            aggregate_type: instance.aggregate_type,
            aggregate_id: instance.aggregate_id,
            tenant_id: instance.tenant_id,
            version: self.version.expect("version is required"),
            schema_version: self.schema_version,
            command_id: self.command_id,
            journal_offset: 0,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload: self.payload.expect("payload is required"),
        }
    }

    /// Tries to build the event envelope, returning None if required fields are missing.
    pub fn try_build(self) -> Option<EventEnvelope> {
        let instance = self.instance?;
        Some(EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self.event_type?,
            aggregate_type: instance.aggregate_type,
            aggregate_id: instance.aggregate_id,
            tenant_id: instance.tenant_id,
            version: self.version?,
            schema_version: self.schema_version,
            command_id: self.command_id,
            journal_offset: 0,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload: self.payload?,
        })
    }
}
