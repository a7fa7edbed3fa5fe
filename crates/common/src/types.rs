use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an aggregate instance.
///
/// Instance ids are chosen by the caller (for example `"A1"` or an order
/// number); [`AggregateId::generate`] is available when any unique value will do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(String);

impl AggregateId {
    /// Creates an aggregate ID from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a new random aggregate ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AggregateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AggregateId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AggregateId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Tenant an aggregate instance belongs to.
///
/// The reserved [`TenantId::DEFAULT`] tenant owns the handlers every other
/// tenant falls back to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Name of the reserved fallback tenant.
    pub const DEFAULT: &'static str = "default";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the reserved fallback tenant.
    pub fn default_tenant() -> Self {
        Self(Self::DEFAULT.to_string())
    }

    pub fn is_default(&self) -> bool {
        self.0 == Self::DEFAULT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::default_tenant()
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TenantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Idempotency key carried by every command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a new random command ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommandId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifies one aggregate instance: (aggregate type, instance id, tenant).
///
/// This is the key for the journal stream, the snapshot store and the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub tenant_id: TenantId,
}

impl InstanceKey {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: AggregateId,
        tenant_id: TenantId,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            tenant_id,
        }
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.aggregate_type, self.aggregate_id, self.tenant_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_id_generate_creates_unique_ids() {
        let id1 = AggregateId::generate();
        let id2 = AggregateId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn aggregate_id_serializes_as_plain_string() {
        let id = AggregateId::new("A1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"A1\"");
        let deserialized: AggregateId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);
    }

    #[test]
    fn tenant_default_is_reserved_name() {
        let tenant = TenantId::default();
        assert!(tenant.is_default());
        assert_eq!(tenant.as_str(), "default");
        assert!(!TenantId::new("T1").is_default());
    }

    #[test]
    fn instance_key_display() {
        let key = InstanceKey::new("Data", AggregateId::new("A1"), TenantId::new("T1"));
        assert_eq!(key.to_string(), "Data/A1@T1");
    }
}
