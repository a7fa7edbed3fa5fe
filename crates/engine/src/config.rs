//! Engine configuration, resolved per tenant.

use std::collections::HashMap;
use std::time::Duration;

use event_store::TenantId;
use serde::{Deserialize, Serialize};

/// Whether the engine reads and writes the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    /// Journal, snapshots and failure sink are used.
    #[default]
    Database,
    /// All I/O is skipped; state lives only in the cache.
    Ephemeral,
}

impl std::str::FromStr for PersistenceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "database" => Ok(Self::Database),
            "ephemeral" => Ok(Self::Ephemeral),
            other => Err(format!("unknown persistence mode: {other}")),
        }
    }
}

/// Settings of one aggregate type for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateConfiguration {
    /// Events between snapshots; `None` disables snapshotting.
    pub snapshot_threshold: Option<u64>,
    /// Number of recent command ids remembered per instance.
    pub idempotency_window: usize,
    pub persistence_mode: PersistenceMode,
    /// Extra attempts after an optimistic concurrency conflict.
    pub conflict_retries: u32,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
}

impl AggregateConfiguration {
    pub fn is_ephemeral(&self) -> bool {
        self.persistence_mode == PersistenceMode::Ephemeral
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for AggregateConfiguration {
    fn default() -> Self {
        Self {
            snapshot_threshold: Some(100),
            idempotency_window: 20,
            persistence_mode: PersistenceMode::Database,
            conflict_retries: 1,
            cache_capacity: 10_000,
            cache_ttl_secs: 600,
        }
    }
}

/// Default configuration plus per-tenant overrides.
///
/// Reads from environment variables:
/// - `ENGINE_SNAPSHOT_THRESHOLD`: events between snapshots, `0` or `off` disables (default: `100`)
/// - `ENGINE_IDEMPOTENCY_WINDOW`: remembered command ids (default: `20`)
/// - `ENGINE_PERSISTENCE_MODE`: `database` or `ephemeral` (default: `database`)
/// - `ENGINE_CONFLICT_RETRIES`: retries after a conflict (default: `1`)
/// - `ENGINE_CACHE_CAPACITY`: cached instances (default: `10000`)
/// - `ENGINE_CACHE_TTL_SECS`: cache entry lifetime (default: `600`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default: AggregateConfiguration,
    pub tenants: HashMap<TenantId, AggregateConfiguration>,
}

impl EngineConfig {
    /// Loads the default configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = AggregateConfiguration::default();

        let snapshot_threshold = match lookup("ENGINE_SNAPSHOT_THRESHOLD") {
            Some(v) if v.trim() == "0" || v.trim().eq_ignore_ascii_case("off") => None,
            Some(v) => v.trim().parse().ok().or(defaults.snapshot_threshold),
            None => defaults.snapshot_threshold,
        };

        Self {
            default: AggregateConfiguration {
                snapshot_threshold,
                idempotency_window: parse_var(&lookup, "ENGINE_IDEMPOTENCY_WINDOW")
                    .unwrap_or(defaults.idempotency_window),
                persistence_mode: parse_var(&lookup, "ENGINE_PERSISTENCE_MODE")
                    .unwrap_or(defaults.persistence_mode),
                conflict_retries: parse_var(&lookup, "ENGINE_CONFLICT_RETRIES")
                    .unwrap_or(defaults.conflict_retries),
                cache_capacity: parse_var(&lookup, "ENGINE_CACHE_CAPACITY")
                    .unwrap_or(defaults.cache_capacity),
                cache_ttl_secs: parse_var(&lookup, "ENGINE_CACHE_TTL_SECS")
                    .unwrap_or(defaults.cache_ttl_secs),
            },
            tenants: HashMap::new(),
        }
    }

    /// Adds an override for one tenant.
    pub fn with_tenant(mut self, tenant: impl Into<TenantId>, config: AggregateConfiguration) -> Self {
        self.tenants.insert(tenant.into(), config);
        self
    }

    /// Returns the tenant's configuration, or the default.
    pub fn for_tenant(&self, tenant: &TenantId) -> &AggregateConfiguration {
        self.tenants.get(tenant).unwrap_or(&self.default)
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|v| v.trim().parse().ok())
}

impl From<AggregateConfiguration> for EngineConfig {
    fn from(default: AggregateConfiguration) -> Self {
        Self {
            default,
            tenants: HashMap::new(),
        }
    }
}
