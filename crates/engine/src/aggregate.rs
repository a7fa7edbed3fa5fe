//! Core aggregate, command and domain event traits.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Trait for event-sourced aggregate state.
///
/// The engine treats the state as an opaque value: it is only ever produced
/// by folding events through registered aggregators, serialized into
/// snapshots and cached.
pub trait Aggregate: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Returns the aggregate type name.
    ///
    /// Used to key journal streams, snapshots and the deployment directory.
    fn aggregate_type() -> &'static str;

    /// Schema version of the serialized state written into snapshots.
    fn schema_version() -> u32 {
        0
    }

    /// Migrates a snapshot written with an older schema version.
    ///
    /// Returning `None` discards the snapshot and the instance is rebuilt
    /// from its full history.
    fn upcast_snapshot(_from_version: u32, _state: Value) -> Option<Value> {
        None
    }
}

/// Trait for commands handled by an aggregate's behaviours.
///
/// Commands arrive as JSON at the submission boundary and are decoded into
/// the registered type before the behaviour runs.
pub trait Command: DeserializeOwned + Send + Sync + 'static {}

impl<T> Command for T where T: DeserializeOwned + Send + Sync + 'static {}

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and should be named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Schema version written with new events of this type.
    fn schema_version() -> u32 {
        0
    }

    /// Migrates a payload stored with an older schema version.
    ///
    /// Returning `None` makes the stored event unreadable, which is fatal for
    /// the instance.
    fn upcast(_from_version: u32, _payload: Value) -> Option<Value> {
        None
    }
}

/// Returns the last path segment of a type name, without generic arguments.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// An event produced by a behaviour, not yet stamped with a version.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub event_type: String,
    pub schema_version: u32,
    pub payload: Value,
}

impl PendingEvent {
    /// Serializes a domain event, naming it after its type.
    pub fn new<E: DomainEvent>(event: &E) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_type: short_type_name::<E>().to_string(),
            schema_version: E::schema_version(),
            payload: serde_json::to_value(event)?,
        })
    }
}
