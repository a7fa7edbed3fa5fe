//! Per-instance state container.
//!
//! Every transition consumes the state and returns a new one, so a failed
//! command leaves the caller's copy untouched.

use std::collections::VecDeque;

use event_store::{CommandId, EventEnvelope, InstanceKey, Version};

use crate::aggregate::{Aggregate, PendingEvent};
use crate::error::Result;
use crate::registry::AggregateRegistry;

/// The folded state of one aggregate instance plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct AggregateInstanceState<A: Aggregate> {
    key: InstanceKey,
    domain_state: A,
    current_version: Version,
    provisional_version: Version,
    processed_since_snapshot: u64,
    events_since_snapshot: Vec<EventEnvelope>,
    recent_command_ids: VecDeque<CommandId>,
    idempotency_window: usize,
    snapshot_present: bool,
}

impl<A: Aggregate> AggregateInstanceState<A> {
    /// An instance with no history.
    pub fn new(key: InstanceKey, idempotency_window: usize) -> Self {
        Self {
            key,
            domain_state: A::default(),
            current_version: Version::initial(),
            provisional_version: Version::initial(),
            processed_since_snapshot: 0,
            events_since_snapshot: Vec::new(),
            recent_command_ids: VecDeque::with_capacity(idempotency_window),
            idempotency_window,
            snapshot_present: false,
        }
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    pub fn domain_state(&self) -> &A {
        &self.domain_state
    }

    pub fn into_domain_state(self) -> A {
        self.domain_state
    }

    /// Version of the last applied event, 0 for an instance without history.
    pub fn current_version(&self) -> Version {
        self.current_version
    }

    pub fn provisional_version(&self) -> Version {
        self.provisional_version
    }

    pub fn processed_since_snapshot(&self) -> u64 {
        self.processed_since_snapshot
    }

    pub fn events_since_snapshot(&self) -> &[EventEnvelope] {
        &self.events_since_snapshot
    }

    pub fn recent_command_ids(&self) -> impl Iterator<Item = &CommandId> {
        self.recent_command_ids.iter()
    }

    pub fn snapshot_present(&self) -> bool {
        self.snapshot_present
    }

    /// Returns true if the command id was applied within the idempotency window.
    pub fn has_processed(&self, command_id: &CommandId) -> bool {
        self.recent_command_ids.contains(command_id)
    }

    /// Adopts a snapshot as the replay baseline.
    ///
    /// `command_ids` are the idempotency keys applied up to `version`, oldest
    /// first; only the newest ones that fit the window are kept.
    pub fn with_snapshot(
        self,
        domain_state: A,
        version: Version,
        command_ids: Vec<CommandId>,
    ) -> Self {
        let skip = command_ids.len().saturating_sub(self.idempotency_window);
        Self {
            domain_state,
            current_version: version,
            provisional_version: version,
            snapshot_present: true,
            recent_command_ids: command_ids.into_iter().skip(skip).collect(),
            ..self
        }
    }

    /// Stamps the events of one command with consecutive versions after the
    /// current one.
    pub fn stamp(
        self,
        pending: Vec<PendingEvent>,
        command_id: &CommandId,
    ) -> (Self, Vec<EventEnvelope>) {
        let mut provisional = self.current_version;
        let envelopes = pending
            .into_iter()
            .map(|event| {
                provisional = provisional.next();
                EventEnvelope::builder()
                    .instance(self.key.clone())
                    .event_type(event.event_type)
                    .version(provisional)
                    .schema_version(event.schema_version)
                    .command_id(command_id.clone())
                    .payload_raw(event.payload)
                    .build()
            })
            .collect();

        (
            Self {
                provisional_version: provisional,
                ..self
            },
            envelopes,
        )
    }

    /// Applies events in version order.
    ///
    /// Events at or below the current version were already applied and are
    /// skipped. A gap in the sequence is logged but still applied.
    pub fn fold(
        mut self,
        mut events: Vec<EventEnvelope>,
        registry: &AggregateRegistry<A>,
    ) -> Result<Self> {
        events.sort_by_key(|e| e.version);

        for event in events {
            if event.version <= self.current_version {
                tracing::debug!(
                    instance = %self.key,
                    version = %event.version,
                    "skipping already applied event"
                );
                continue;
            }
            if event.version != self.current_version.next() {
                tracing::warn!(
                    instance = %self.key,
                    expected = %self.current_version.next(),
                    found = %event.version,
                    "gap in event versions"
                );
            }

            self.domain_state = registry.apply(&self.domain_state, &event)?;
            self.current_version = event.version;
            self.provisional_version = event.version;

            if let Some(ref command_id) = event.command_id
                && !self.recent_command_ids.contains(command_id)
            {
                self.recent_command_ids.push_back(command_id.clone());
                while self.recent_command_ids.len() > self.idempotency_window {
                    self.recent_command_ids.pop_front();
                }
            }

            self.events_since_snapshot.push(event);
            self.processed_since_snapshot += 1;
        }

        Ok(self)
    }

    /// Returns true once enough events accumulated since the last snapshot.
    ///
    /// `None` disables snapshotting.
    pub fn needs_snapshot(&self, threshold: Option<u64>) -> bool {
        threshold.is_some_and(|t| self.processed_since_snapshot >= t)
    }

    /// Resets snapshot bookkeeping after a snapshot attempt.
    pub fn snapshot_settled(self, written: bool) -> Self {
        Self {
            processed_since_snapshot: 0,
            events_since_snapshot: Vec::new(),
            snapshot_present: self.snapshot_present || written,
            ..self
        }
    }
}
