//! The aggregate command-processing engine.
//!
//! For each command the engine loads the instance state (cache, snapshot,
//! journal), runs the behaviour, appends the resulting events with an
//! expected version, folds them and writes the new state through the cache.
//! A version conflict triggers a consistency repair and a bounded retry.

use std::sync::Arc;

use chrono::Utc;
use event_store::{
    AppendOptions, CommandId, EventEnvelope, EventJournal, EventStoreError, FailedCommand,
    FailureSink, InstanceKey, Snapshot, SnapshotStore, Version,
};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::cache::{AggregateCache, InMemoryAggregateCache};
use crate::config::{AggregateConfiguration, EngineConfig};
use crate::error::{EngineError, ErrorResponse, Rejection, Result};
use crate::gateway::CommandRequest;
use crate::registry::AggregateRegistry;
use crate::state::AggregateInstanceState;

/// Read guarantee of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    /// A cached state is returned as is.
    #[default]
    Eventual,
    /// A cached state is caught up with the journal first.
    Strong,
}

/// The stores an engine talks to.
pub struct Infrastructure<A: Aggregate> {
    pub journal: Arc<dyn EventJournal>,
    pub snapshots: Option<Arc<dyn SnapshotStore>>,
    pub cache: Arc<dyn AggregateCache<A>>,
    pub failures: Option<Arc<dyn FailureSink>>,
}

impl<A: Aggregate> Infrastructure<A> {
    /// Journal and cache only; snapshots and failure records are disabled.
    pub fn new(journal: Arc<dyn EventJournal>, cache: Arc<dyn AggregateCache<A>>) -> Self {
        Self {
            journal,
            snapshots: None,
            cache,
            failures: None,
        }
    }

    /// Uses one store for the journal, snapshots and failure records, with an
    /// in-memory cache sized from `config`.
    pub fn from_store<S>(store: S, config: &AggregateConfiguration) -> Self
    where
        S: EventJournal + SnapshotStore + FailureSink + 'static,
    {
        let store = Arc::new(store);
        Self {
            journal: store.clone(),
            snapshots: Some(store.clone()),
            cache: Arc::new(InMemoryAggregateCache::<A>::new(
                config.cache_capacity,
                config.cache_ttl(),
            )),
            failures: Some(store),
        }
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn with_failure_sink(mut self, failures: Arc<dyn FailureSink>) -> Self {
        self.failures = Some(failures);
        self
    }
}

impl<A: Aggregate> Clone for Infrastructure<A> {
    fn clone(&self) -> Self {
        Self {
            journal: self.journal.clone(),
            snapshots: self.snapshots.clone(),
            cache: self.cache.clone(),
            failures: self.failures.clone(),
        }
    }
}

/// Processes commands for every instance of aggregate type `A`.
pub struct AggregateEngine<A: Aggregate> {
    registry: Arc<AggregateRegistry<A>>,
    infra: Infrastructure<A>,
    config: Arc<EngineConfig>,
    background: Arc<Mutex<JoinSet<()>>>,
}

impl<A: Aggregate> Clone for AggregateEngine<A> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            infra: self.infra.clone(),
            config: self.config.clone(),
            background: self.background.clone(),
        }
    }
}

impl<A: Aggregate> AggregateEngine<A> {
    pub fn new(
        registry: AggregateRegistry<A>,
        infra: Infrastructure<A>,
        config: impl Into<EngineConfig>,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            infra,
            config: Arc::new(config.into()),
            background: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    pub fn registry(&self) -> &AggregateRegistry<A> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the state of an instance with the requested guarantee.
    ///
    /// An instance without history yields an empty state, not an error.
    #[tracing::instrument(skip(self), fields(aggregate_type = A::aggregate_type()))]
    pub async fn fetch(
        &self,
        key: &InstanceKey,
        consistency: Consistency,
    ) -> Result<AggregateInstanceState<A>> {
        let config = self.config.for_tenant(&key.tenant_id);
        self.fetch_with(key, consistency, config).await
    }

    /// Processes one command and returns the resulting domain state.
    #[tracing::instrument(
        skip_all,
        fields(
            aggregate_type = A::aggregate_type(),
            command_type = %request.command_type,
            tenant = %request.tenant_id,
        )
    )]
    pub async fn process(&self, request: CommandRequest) -> Result<A> {
        let Some(aggregate_id) = request.aggregate_id() else {
            metrics::counter!("engine_commands_rejected_total", "aggregate_type" => A::aggregate_type())
                .increment(1);
            tracing::warn!("command without aggregateId");
            return Err(EngineError::CommandRejected(Rejection::malformed(
                "payload must carry a non-empty aggregateId",
            )));
        };
        let command_id = request.command_id().unwrap_or_else(CommandId::generate);
        let key = InstanceKey::new(A::aggregate_type(), aggregate_id, request.tenant_id.clone());

        match self.process_command(&request, &key, &command_id).await {
            Ok(state) => {
                metrics::counter!("engine_commands_processed_total", "aggregate_type" => A::aggregate_type())
                    .increment(1);
                tracing::info!(
                    aggregate_id = %key.aggregate_id,
                    version = %state.current_version(),
                    "command processed"
                );
                Ok(state.into_domain_state())
            }
            Err(err) => {
                metrics::counter!("engine_commands_rejected_total", "aggregate_type" => A::aggregate_type())
                    .increment(1);
                if err.is_rejection() {
                    tracing::info!(aggregate_id = %key.aggregate_id, error = %err, "command rejected");
                } else {
                    tracing::warn!(aggregate_id = %key.aggregate_id, error = %err, "command failed");
                }
                self.record_failure(&request, &key, &command_id, &err).await;
                Err(err)
            }
        }
    }

    /// Rebuilds the state as of `version_to` from the journal alone.
    ///
    /// Neither the cache nor snapshots are consulted, and the result is not cached.
    #[tracing::instrument(skip(self), fields(aggregate_type = A::aggregate_type()))]
    pub async fn load_at(&self, key: &InstanceKey, version_to: Version) -> Result<A> {
        let config = self.config.for_tenant(&key.tenant_id);
        if config.is_ephemeral() {
            return Err(EngineError::Configuration(
                "point-in-time load needs a persistent journal".to_string(),
            ));
        }

        let events: Vec<EventEnvelope> = self
            .events_after(key, Version::initial())
            .await?
            .into_iter()
            .filter(|e| e.version <= version_to)
            .collect();

        let state = AggregateInstanceState::new(key.clone(), config.idempotency_window)
            .fold(events, &self.registry)?;
        Ok(state.into_domain_state())
    }

    /// Waits for every scheduled snapshot task to finish.
    pub async fn drain_background_tasks(&self) {
        let mut tasks = std::mem::take(&mut *self.background.lock().await);
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                tracing::error!(error = %err, "background task failed");
            }
        }
    }

    async fn process_command(
        &self,
        request: &CommandRequest,
        key: &InstanceKey,
        command_id: &CommandId,
    ) -> Result<AggregateInstanceState<A>> {
        let command_type = self.registry.resolve_command(&request.command_type)?;
        let config = self.config.for_tenant(&key.tenant_id);

        let original = self.fetch_with(key, Consistency::Eventual, config).await?;
        let mut state = original.clone();
        let mut attempt: u32 = 0;

        loop {
            if state.has_processed(command_id) {
                return Err(EngineError::CommandRejected(Rejection::duplicate_command(
                    command_id.as_str(),
                )));
            }

            let pending =
                self.registry
                    .handle(state.domain_state(), command_type, &key.tenant_id, &request.payload)?;
            if pending.is_empty() {
                tracing::debug!(aggregate_id = %key.aggregate_id, "behaviour produced no events");
                return Ok(state);
            }

            let expected = state.current_version();
            let (stamped, events) = state.stamp(pending, command_id);

            // Events the aggregate cannot fold must never reach the journal
            let next = stamped.fold(events.clone(), &self.registry)?;

            if config.is_ephemeral() {
                self.infra.cache.put(next.clone()).await;
                return Ok(next);
            }

            match self
                .infra
                .journal
                .append(events, AppendOptions::expect_version(expected))
                .await
            {
                Ok(_) => {
                    self.infra.cache.put(next.clone()).await;
                    self.schedule_snapshot(next.clone(), config).await;
                    return Ok(next);
                }
                Err(err) if err.is_conflict() && attempt < config.conflict_retries => {
                    attempt += 1;
                    metrics::counter!("engine_conflict_retries_total", "aggregate_type" => A::aggregate_type())
                        .increment(1);
                    tracing::warn!(
                        aggregate_id = %key.aggregate_id,
                        expected = %expected,
                        attempt,
                        "version conflict, repairing state and retrying"
                    );
                    state = self.repair(original.clone(), config).await?;
                }
                Err(err) if err.is_conflict() => {
                    return Err(EngineError::Conflict {
                        instance: key.clone(),
                        attempts: attempt + 1,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn fetch_with(
        &self,
        key: &InstanceKey,
        consistency: Consistency,
        config: &AggregateConfiguration,
    ) -> Result<AggregateInstanceState<A>> {
        if let Some(cached) = self.infra.cache.get(key).await {
            metrics::counter!("engine_cache_hits_total", "aggregate_type" => A::aggregate_type())
                .increment(1);
            return match consistency {
                Consistency::Eventual => Ok(cached),
                Consistency::Strong => self.repair(cached, config).await,
            };
        }
        metrics::counter!("engine_cache_misses_total", "aggregate_type" => A::aggregate_type())
            .increment(1);

        if config.is_ephemeral() {
            return Ok(AggregateInstanceState::new(
                key.clone(),
                config.idempotency_window,
            ));
        }

        let state = self.load(key, config).await?;
        self.infra.cache.put(state.clone()).await;
        Ok(state)
    }

    /// Snapshot, then replay of the journal after the snapshot's version.
    async fn load(
        &self,
        key: &InstanceKey,
        config: &AggregateConfiguration,
    ) -> Result<AggregateInstanceState<A>> {
        let mut state = AggregateInstanceState::new(key.clone(), config.idempotency_window);

        if let Some(snapshots) = &self.infra.snapshots
            && let Some(snapshot) = snapshots.get(key).await?
            && let Some((domain_state, version, command_ids)) = self.restore_snapshot(snapshot)
        {
            state = state.with_snapshot(domain_state, version, command_ids);
        }

        let events = self.events_after(key, state.current_version()).await?;
        tracing::debug!(
            aggregate_id = %key.aggregate_id,
            baseline = %state.current_version(),
            events = events.len(),
            "loading instance"
        );
        state.fold(events, &self.registry)
    }

    /// Decodes a snapshot, upcasting it when written with an older schema.
    ///
    /// `None` means the snapshot is unusable and the full journal is replayed.
    fn restore_snapshot(&self, snapshot: Snapshot) -> Option<(A, Version, Vec<CommandId>)> {
        let current = A::schema_version();
        let version = snapshot.version;
        let command_ids = snapshot.command_ids;

        let state = if snapshot.schema_version == current {
            snapshot.state
        } else if snapshot.schema_version < current {
            match A::upcast_snapshot(snapshot.schema_version, snapshot.state) {
                Some(state) => state,
                None => {
                    tracing::warn!(
                        instance = %snapshot.key,
                        schema = snapshot.schema_version,
                        current,
                        "snapshot cannot be upcast, replaying full history"
                    );
                    return None;
                }
            }
        } else {
            tracing::warn!(
                instance = %snapshot.key,
                schema = snapshot.schema_version,
                current,
                "snapshot schema is newer than supported, replaying full history"
            );
            return None;
        };

        match serde_json::from_value(state) {
            Ok(domain_state) => Some((domain_state, version, command_ids)),
            Err(err) => {
                tracing::warn!(
                    instance = %snapshot.key,
                    error = %err,
                    "snapshot could not be decoded, replaying full history"
                );
                None
            }
        }
    }

    /// Folds whatever the journal holds beyond the state's version.
    async fn repair(
        &self,
        state: AggregateInstanceState<A>,
        config: &AggregateConfiguration,
    ) -> Result<AggregateInstanceState<A>> {
        if config.is_ephemeral() {
            return Ok(state);
        }

        let events = self.events_after(state.key(), state.current_version()).await?;
        if !events.is_empty() {
            tracing::warn!(
                aggregate_id = %state.key().aggregate_id,
                from = %state.current_version(),
                missing = events.len(),
                "state behind journal, repairing"
            );
        }

        let repaired = state.fold(events, &self.registry)?;
        self.infra.cache.put(repaired.clone()).await;
        Ok(repaired)
    }

    async fn events_after(&self, key: &InstanceKey, after: Version) -> Result<Vec<EventEnvelope>> {
        match self.infra.journal.stream_since(key, after).await {
            Ok(events) => Ok(events),
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Spawns a snapshot write if the threshold is reached.
    async fn schedule_snapshot(
        &self,
        state: AggregateInstanceState<A>,
        config: &AggregateConfiguration,
    ) {
        if config.is_ephemeral() || !state.needs_snapshot(config.snapshot_threshold) {
            return;
        }
        let Some(snapshots) = self.infra.snapshots.clone() else {
            return;
        };
        let cache = self.infra.cache.clone();

        let mut tasks = self.background.lock().await;
        while let Some(finished) = tasks.try_join_next() {
            if let Err(err) = finished {
                tracing::error!(error = %err, "background task failed");
            }
        }

        tasks.spawn(async move {
            let key = state.key().clone();
            let version = state.current_version();

            let written = match write_snapshot(snapshots.as_ref(), &state).await {
                Ok(()) => {
                    metrics::counter!("engine_snapshots_written_total", "aggregate_type" => A::aggregate_type())
                        .increment(1);
                    tracing::info!(instance = %key, version = %version, "snapshot written");
                    true
                }
                Err(err) => {
                    metrics::counter!("engine_snapshot_failures_total", "aggregate_type" => A::aggregate_type())
                        .increment(1);
                    tracing::error!(instance = %key, version = %version, error = %err, "snapshot failed");
                    false
                }
            };

            let settled = state.snapshot_settled(written);
            match cache.get(&key).await {
                Some(cached) if cached.current_version() > version => {
                    tracing::debug!(instance = %key, "newer state cached, skipping refresh");
                }
                _ => cache.put(settled).await,
            }
        });
    }

    /// Best-effort audit of a failed command.
    async fn record_failure(
        &self,
        request: &CommandRequest,
        key: &InstanceKey,
        command_id: &CommandId,
        err: &EngineError,
    ) {
        if self.config.for_tenant(&key.tenant_id).is_ephemeral() {
            return;
        }
        let Some(sink) = &self.infra.failures else {
            return;
        };

        let response = ErrorResponse::from(err);
        let failure = FailedCommand {
            id: Uuid::new_v4(),
            aggregate_type: key.aggregate_type.clone(),
            aggregate_id: key.aggregate_id.clone(),
            tenant_id: key.tenant_id.clone(),
            command_type: request.command_type.clone(),
            command_id: command_id.clone(),
            command: request.payload.clone(),
            source: response.source,
            message: response.message,
            hint: response.hint,
            code: response.code,
            recorded_at: Utc::now(),
        };

        if let Err(sink_err) = sink.record(failure).await {
            tracing::error!(instance = %key, error = %sink_err, "failed to record rejected command");
        }
    }
}

/// Inserts the first snapshot of an instance, otherwise replaces it.
///
/// A concurrent first insert by another writer turns into an update.
async fn write_snapshot<A: Aggregate>(
    store: &dyn SnapshotStore,
    state: &AggregateInstanceState<A>,
) -> event_store::Result<()> {
    let snapshot = Snapshot::from_state(
        state.key().clone(),
        state.current_version(),
        A::schema_version(),
        state.domain_state(),
    )?
    .with_command_ids(state.recent_command_ids().cloned().collect());

    if state.snapshot_present() {
        return match store.update(snapshot.clone()).await {
            Err(err) if err.is_not_found() => store.insert(snapshot).await,
            other => other,
        };
    }

    match store.insert(snapshot.clone()).await {
        Err(EventStoreError::DuplicateSnapshot(_)) => store.update(snapshot).await,
        other => other,
    }
}
