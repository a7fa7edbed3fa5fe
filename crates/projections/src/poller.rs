//! Offset-cursor poller feeding journal events to projections.

use std::future::Future;
use std::time::Duration;

use event_store::{DEFAULT_BATCH_SIZE, EventJournal, JournalOffset, OffsetStore};

use crate::Result;
use crate::projection::EventProjection;

/// Polls the journal on behalf of registered projections.
///
/// Each projection owns a cursor in the offset store, keyed by its name and
/// tenant. A poll reads the cursor, fetches the next batch after it, applies
/// the batch and then moves the cursor to the largest offset seen.
pub struct ProjectionPoller<J: EventJournal, O: OffsetStore> {
    journal: J,
    offsets: O,
    projections: Vec<Box<dyn EventProjection>>,
    batch_size: usize,
}

impl<J: EventJournal, O: OffsetStore> ProjectionPoller<J, O> {
    pub fn new(journal: J, offsets: O) -> Self {
        Self {
            journal,
            offsets,
            projections: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Overrides the number of events fetched per poll.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Registers a projection with this poller.
    pub fn register(&mut self, projection: Box<dyn EventProjection>) {
        self.projections.push(projection);
    }

    /// Returns the number of registered projections.
    pub fn projection_count(&self) -> usize {
        self.projections.len()
    }

    /// Runs one batch for every projection and returns the number of events applied.
    ///
    /// Stops at the first failing projection; its cursor is left unchanged.
    #[tracing::instrument(skip(self))]
    pub async fn poll_once(&self) -> Result<usize> {
        let mut applied = 0;
        for projection in &self.projections {
            applied += self.poll_projection(projection.as_ref()).await?;
        }
        Ok(applied)
    }

    async fn poll_projection(&self, projection: &dyn EventProjection) -> Result<usize> {
        let offset = self
            .offsets
            .get(projection.name(), projection.tenant())
            .await?;

        let events = self
            .journal
            .fetch(projection.query(offset.offset, self.batch_size))
            .await?;
        if events.is_empty() {
            return Ok(0);
        }

        projection.apply(&events).await?;
        let advanced = offset.advance(&events);
        self.offsets.put(advanced.clone()).await?;

        metrics::counter!("projections_events_processed", "projection" => projection.name().to_string())
            .increment(events.len() as u64);
        tracing::debug!(
            projection = projection.name(),
            tenant = %projection.tenant(),
            events = events.len(),
            offset = advanced.offset,
            "projection advanced"
        );

        Ok(events.len())
    }

    /// Polls every `interval` until `shutdown` resolves.
    ///
    /// A failed poll is logged and retried on the next tick.
    pub async fn run(&self, interval: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(projections = self.projections.len(), "projection poller started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        metrics::counter!("projections_poll_failures_total").increment(1);
                        tracing::error!(error = %err, "projection poll failed");
                    }
                }
            }
        }
        tracing::info!("projection poller stopped");
    }

    /// Resets every projection and its cursor, then replays the journal.
    ///
    /// Returns the number of events replayed.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild(&self) -> Result<usize> {
        for projection in &self.projections {
            projection.reset().await?;
            self.offsets
                .put(JournalOffset::start(
                    projection.name(),
                    projection.tenant().clone(),
                ))
                .await?;
        }

        let mut replayed = 0;
        loop {
            let applied = self.poll_once().await?;
            if applied == 0 {
                break;
            }
            replayed += applied;
        }

        tracing::info!(events = replayed, "rebuild complete");
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProjectionError;
    use async_trait::async_trait;
    use event_store::{
        AggregateId, AppendOptions, EventEnvelope, InMemoryEventStore, InstanceKey, TenantId,
        Version,
    };
    use std::sync::Arc;
    use tokio::sync::RwLock;

    /// Records every event it receives.
    struct RecordingProjection {
        name: &'static str,
        tenant: TenantId,
        event_types: Option<Vec<String>>,
        seen: Arc<RwLock<Vec<EventEnvelope>>>,
        fail: bool,
    }

    impl RecordingProjection {
        fn new(name: &'static str, tenant: &str) -> Self {
            Self {
                name,
                tenant: TenantId::new(tenant),
                event_types: None,
                seen: Arc::new(RwLock::new(Vec::new())),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl EventProjection for RecordingProjection {
        fn name(&self) -> &str {
            self.name
        }

        fn tenant(&self) -> &TenantId {
            &self.tenant
        }

        fn event_types(&self) -> Option<Vec<String>> {
            self.event_types.clone()
        }

        async fn apply(&self, events: &[EventEnvelope]) -> Result<()> {
            if self.fail {
                return Err(ProjectionError::projection(self.name, "read model unavailable"));
            }
            self.seen.write().await.extend_from_slice(events);
            Ok(())
        }

        async fn reset(&self) -> Result<()> {
            self.seen.write().await.clear();
            Ok(())
        }
    }

    async fn seed(store: &InMemoryEventStore, tenant: &str, id: &str, types: &[&str]) {
        let key = InstanceKey::new("Data", AggregateId::new(id), TenantId::new(tenant));
        let events = types
            .iter()
            .enumerate()
            .map(|(i, event_type)| {
                EventEnvelope::builder()
                    .instance(key.clone())
                    .event_type(*event_type)
                    .version(Version::new(i as i64 + 1))
                    .payload_raw(serde_json::json!({"n": i}))
                    .build()
            })
            .collect();
        store.append(events, AppendOptions::new()).await.unwrap();
    }

    fn poller(store: &InMemoryEventStore) -> ProjectionPoller<InMemoryEventStore, InMemoryEventStore> {
        ProjectionPoller::new(store.clone(), store.clone())
    }

    #[tokio::test]
    async fn test_poll_applies_and_advances_offset() {
        let store = InMemoryEventStore::new();
        seed(&store, "T1", "A1", &["Created", "Changed", "Changed"]).await;

        let projection = RecordingProjection::new("recorder", "T1");
        let seen = Arc::clone(&projection.seen);
        let mut poller = poller(&store);
        poller.register(Box::new(projection));

        assert_eq!(poller.poll_once().await.unwrap(), 3);
        assert_eq!(seen.read().await.len(), 3);

        let offset = OffsetStore::get(&store, "recorder", &TenantId::new("T1"))
            .await
            .unwrap();
        assert_eq!(offset.offset, 3);

        // Nothing new, nothing delivered twice
        assert_eq!(poller.poll_once().await.unwrap(), 0);
        assert_eq!(seen.read().await.len(), 3);
    }

    #[tokio::test]
    async fn test_poll_respects_tenant_and_filters() {
        let store = InMemoryEventStore::new();
        seed(&store, "T1", "A1", &["Created", "Changed"]).await;
        seed(&store, "T2", "A1", &["Created"]).await;
        seed(&store, "T1", "A2", &["Created"]).await;

        let mut created_only = RecordingProjection::new("created", "T1");
        created_only.event_types = Some(vec!["Created".to_string()]);
        let seen = Arc::clone(&created_only.seen);

        let mut poller = poller(&store);
        poller.register(Box::new(created_only));
        poller.poll_once().await.unwrap();

        let seen = seen.read().await;
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|e| e.event_type == "Created"));
        assert!(seen.iter().all(|e| e.tenant_id == TenantId::new("T1")));
        assert!(seen.windows(2).all(|w| w[0].journal_offset < w[1].journal_offset));
    }

    #[tokio::test]
    async fn test_batches_are_bounded() {
        let store = InMemoryEventStore::new();
        seed(&store, "T1", "A1", &["Changed"; 5]).await;

        let projection = RecordingProjection::new("recorder", "T1");
        let seen = Arc::clone(&projection.seen);
        let mut poller = poller(&store).with_batch_size(2);
        poller.register(Box::new(projection));

        assert_eq!(poller.poll_once().await.unwrap(), 2);
        assert_eq!(poller.poll_once().await.unwrap(), 2);
        assert_eq!(poller.poll_once().await.unwrap(), 1);
        assert_eq!(seen.read().await.len(), 5);
    }

    #[tokio::test]
    async fn test_failed_apply_keeps_offset() {
        let store = InMemoryEventStore::new();
        seed(&store, "T1", "A1", &["Created"]).await;

        let mut failing = RecordingProjection::new("failing", "T1");
        failing.fail = true;
        let mut poller = poller(&store);
        poller.register(Box::new(failing));

        assert!(poller.poll_once().await.is_err());
        let offset = OffsetStore::get(&store, "failing", &TenantId::new("T1"))
            .await
            .unwrap();
        assert_eq!(offset.offset, 0);
    }

    #[tokio::test]
    async fn test_rebuild_resets_and_replays() {
        let store = InMemoryEventStore::new();
        seed(&store, "T1", "A1", &["Created", "Changed", "Changed"]).await;

        let projection = RecordingProjection::new("recorder", "T1");
        let seen = Arc::clone(&projection.seen);
        let mut poller = poller(&store).with_batch_size(2);
        poller.register(Box::new(projection));

        poller.poll_once().await.unwrap();
        assert_eq!(seen.read().await.len(), 2);

        assert_eq!(poller.rebuild().await.unwrap(), 3);
        assert_eq!(seen.read().await.len(), 3);
    }

    #[tokio::test]
    async fn test_multiple_projections_have_own_cursors() {
        let store = InMemoryEventStore::new();
        seed(&store, "T1", "A1", &["Created", "Changed"]).await;

        let first = RecordingProjection::new("first", "T1");
        let second = RecordingProjection::new("second", "T1");
        let seen_first = Arc::clone(&first.seen);
        let seen_second = Arc::clone(&second.seen);

        let mut poller = poller(&store);
        poller.register(Box::new(first));
        poller.register(Box::new(second));
        assert_eq!(poller.projection_count(), 2);

        assert_eq!(poller.poll_once().await.unwrap(), 4);
        assert_eq!(seen_first.read().await.len(), 2);
        assert_eq!(seen_second.read().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let store = InMemoryEventStore::new();
        seed(&store, "T1", "A1", &["Created"]).await;

        let projection = RecordingProjection::new("recorder", "T1");
        let seen = Arc::clone(&projection.seen);
        let mut poller = poller(&store);
        poller.register(Box::new(projection));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let shutdown = async {
            let _ = rx.await;
        };

        let run = poller.run(Duration::from_millis(100), shutdown);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let _ = tx.send(());
        };
        tokio::join!(run, stop);

        assert_eq!(seen.read().await.len(), 1);
    }
}
