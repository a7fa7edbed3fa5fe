use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    EventEnvelope, EventStoreError, FailedCommand, FailureSink, InstanceKey, JournalOffset,
    JournalQuery, OffsetStore, Result, Snapshot, SnapshotStore, TenantId, Version,
    store::{AppendOptions, EventJournal, validate_events_for_append},
};

/// In-memory journal, snapshot, offset and failure store for tests and
/// single-process use.
///
/// Cloning shares the underlying storage.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    events: Arc<RwLock<Vec<EventEnvelope>>>,
    snapshots: Arc<RwLock<HashMap<InstanceKey, Snapshot>>>,
    offsets: Arc<RwLock<HashMap<(String, TenantId), JournalOffset>>>,
    failures: Arc<RwLock<Vec<FailedCommand>>>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }

    /// Returns every recorded command failure, oldest first.
    pub async fn failures(&self) -> Vec<FailedCommand> {
        self.failures.read().await.clone()
    }

    /// Clears all events, snapshots, offsets and failures.
    pub async fn clear(&self) {
        self.events.write().await.clear();
        self.snapshots.write().await.clear();
        self.offsets.write().await.clear();
        self.failures.write().await.clear();
    }

    fn version_of(events: &[EventEnvelope], key: &InstanceKey) -> Option<Version> {
        events
            .iter()
            .filter(|e| e.belongs_to(key))
            .map(|e| e.version)
            .max()
    }
}

#[async_trait]
impl EventJournal for InMemoryEventStore {
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version> {
        validate_events_for_append(&events)?;

        let key = events[0].instance_key();
        let first_new_version = events[0].version;

        let mut store = self.events.write().await;

        let current_version = Self::version_of(&store, &key).unwrap_or(Version::initial());

        if let Some(expected) = options.expected_version
            && current_version != expected
        {
            return Err(EventStoreError::ConcurrencyConflict {
                instance: key,
                expected,
                actual: current_version,
            });
        }

        // Unique (instance, version) constraint simulation
        if first_new_version <= current_version {
            return Err(EventStoreError::ConcurrencyConflict {
                instance: key,
                expected: options.expected_version.unwrap_or(current_version),
                actual: current_version,
            });
        }

        let mut next_offset = store.last().map_or(0, |e| e.journal_offset);
        let mut last_version = current_version;
        for mut event in events {
            next_offset += 1;
            event.journal_offset = next_offset;
            last_version = event.version;
            store.push(event);
        }

        Ok(last_version)
    }

    async fn stream_since(&self, key: &InstanceKey, after: Version) -> Result<Vec<EventEnvelope>> {
        let store = self.events.read().await;
        let mut events: Vec<_> = store
            .iter()
            .filter(|e| e.belongs_to(key) && e.version > after)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn current_version(&self, key: &InstanceKey) -> Result<Option<Version>> {
        let store = self.events.read().await;
        Ok(Self::version_of(&store, key))
    }

    async fn fetch(&self, query: JournalQuery) -> Result<Vec<EventEnvelope>> {
        let store = self.events.read().await;
        // Offsets are assigned in push order, so the vector is already sorted.
        let events = store
            .iter()
            .filter(|e| {
                query.matches(
                    &e.tenant_id,
                    &e.aggregate_type,
                    &e.event_type,
                    e.journal_offset,
                )
            })
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(events)
    }
}

#[async_trait]
impl SnapshotStore for InMemoryEventStore {
    async fn get(&self, key: &InstanceKey) -> Result<Option<Snapshot>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(key).cloned())
    }

    async fn insert(&self, snapshot: Snapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        if snapshots.contains_key(&snapshot.key) {
            return Err(EventStoreError::DuplicateSnapshot(snapshot.key));
        }
        snapshots.insert(snapshot.key.clone(), snapshot);
        Ok(())
    }

    async fn update(&self, snapshot: Snapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        match snapshots.get_mut(&snapshot.key) {
            Some(existing) => {
                *existing = snapshot;
                Ok(())
            }
            None => Err(EventStoreError::NotFound(format!(
                "snapshot for {}",
                snapshot.key
            ))),
        }
    }
}

#[async_trait]
impl OffsetStore for InMemoryEventStore {
    async fn get(&self, consumer: &str, tenant_id: &TenantId) -> Result<JournalOffset> {
        let offsets = self.offsets.read().await;
        Ok(offsets
            .get(&(consumer.to_string(), tenant_id.clone()))
            .cloned()
            .unwrap_or_else(|| JournalOffset::start(consumer, tenant_id.clone())))
    }

    async fn put(&self, offset: JournalOffset) -> Result<()> {
        let mut offsets = self.offsets.write().await;
        offsets.insert((offset.consumer.clone(), offset.tenant_id.clone()), offset);
        Ok(())
    }
}

#[async_trait]
impl FailureSink for InMemoryEventStore {
    async fn record(&self, failure: FailedCommand) -> Result<()> {
        self.failures.write().await.push(failure);
        Ok(())
    }
}
