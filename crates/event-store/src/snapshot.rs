use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CommandId, InstanceKey, Result, Version};

/// A snapshot of an instance's folded state at a specific version.
///
/// Snapshots are used to optimize state reconstruction by providing
/// a starting point, avoiding the need to replay all events from the beginning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The instance this snapshot belongs to.
    pub key: InstanceKey,

    /// Version of the last event folded into `state`.
    pub version: Version,

    /// Schema version of `state`, used to upcast old snapshots.
    #[serde(default)]
    pub schema_version: u32,

    /// When the snapshot was created.
    pub timestamp: DateTime<Utc>,

    /// The serialized domain state.
    pub state: serde_json::Value,

    /// Idempotency keys applied up to `version`, oldest first.
    #[serde(default)]
    pub command_ids: Vec<CommandId>,
}

impl Snapshot {
    /// Creates a new snapshot.
    pub fn new(
        key: InstanceKey,
        version: Version,
        schema_version: u32,
        state: serde_json::Value,
    ) -> Self {
        Self {
            key,
            version,
            schema_version,
            timestamp: Utc::now(),
            state,
            command_ids: Vec::new(),
        }
    }

    /// Attaches the recently applied command ids.
    pub fn with_command_ids(mut self, command_ids: Vec<CommandId>) -> Self {
        self.command_ids = command_ids;
        self
    }

    /// Creates a snapshot from a serializable state.
    pub fn from_state<T: Serialize>(
        key: InstanceKey,
        version: Version,
        schema_version: u32,
        state: &T,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self::new(
            key,
            version,
            schema_version,
            serde_json::to_value(state)?,
        ))
    }

    /// Deserializes the snapshot state into a concrete type.
    pub fn into_state<T: for<'de> Deserialize<'de>>(
        self,
    ) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_value(self.state)
    }
}

/// Keyed store of point-in-time state captures.
///
/// Snapshots are derived data: writes carry no concurrency precondition and
/// the last writer wins.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Retrieves the snapshot for an instance.
    ///
    /// Returns None if no snapshot exists.
    async fn get(&self, key: &InstanceKey) -> Result<Option<Snapshot>>;

    /// Stores the first snapshot of an instance.
    ///
    /// Fails with `DuplicateSnapshot` when one already exists.
    async fn insert(&self, snapshot: Snapshot) -> Result<()>;

    /// Replaces the existing snapshot of an instance.
    ///
    /// Fails with `NotFound` when there is nothing to replace.
    async fn update(&self, snapshot: Snapshot) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AggregateId, TenantId};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestState {
        value: i32,
        name: String,
    }

    fn key() -> InstanceKey {
        InstanceKey::new("TestAggregate", AggregateId::new("A1"), TenantId::new("T1"))
    }

    #[test]
    fn snapshot_new() {
        let state = serde_json::json!({"value": 42});

        let snapshot = Snapshot::new(key(), Version::new(5), 0, state.clone());

        assert_eq!(snapshot.key, key());
        assert_eq!(snapshot.version, Version::new(5));
        assert_eq!(snapshot.state, state);
        assert!(snapshot.command_ids.is_empty());
    }

    #[test]
    fn snapshot_carries_command_ids() {
        let snapshot = Snapshot::new(key(), Version::new(2), 0, serde_json::json!({}))
            .with_command_ids(vec![CommandId::new("c1"), CommandId::new("c2")]);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["command_ids"], serde_json::json!(["c1", "c2"]));

        // Snapshots written before the field existed still decode
        let mut legacy = json;
        legacy.as_object_mut().unwrap().remove("command_ids");
        let decoded: Snapshot = serde_json::from_value(legacy).unwrap();
        assert!(decoded.command_ids.is_empty());
    }

    #[test]
    fn snapshot_from_state_and_into_state() {
        let original = TestState {
            value: 42,
            name: "test".to_string(),
        };

        let snapshot = Snapshot::from_state(key(), Version::new(5), 1, &original).unwrap();
        assert_eq!(snapshot.schema_version, 1);

        let restored: TestState = snapshot.into_state().unwrap();
        assert_eq!(restored, original);
    }
}
