use async_trait::async_trait;

use crate::{EventEnvelope, EventStoreError, InstanceKey, JournalQuery, Result, Version};

/// Options for appending events to the journal.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Expected version of the instance for optimistic concurrency control.
    /// If None, no version check is performed (use with caution).
    pub expected_version: Option<Version>,
}

impl AppendOptions {
    /// Creates options with no version check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the instance to be at a specific version.
    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }

    /// Creates options expecting the instance to have no history yet.
    pub fn expect_new() -> Self {
        Self {
            expected_version: Some(Version::initial()),
        }
    }
}

/// Append-only, per-instance versioned event log.
///
/// Streams are keyed by (aggregate type, instance id, tenant). The
/// version-conditioned `append` is the only write that needs to be
/// transactional; everything else is a read.
#[async_trait]
pub trait EventJournal: Send + Sync {
    /// Appends events to one instance's stream.
    ///
    /// Events are appended atomically - either all succeed or none do.
    /// If `options.expected_version` is set, the operation fails with
    /// `ConcurrencyConflict` when the stream's current version differs.
    ///
    /// Returns the version of the last appended event.
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version>;

    /// Returns the events of an instance with a version strictly greater than
    /// `after`, ordered by version.
    ///
    /// An instance without history yields an empty list; implementations may
    /// also report `NotFound`, which callers treat the same way.
    async fn stream_since(&self, key: &InstanceKey, after: Version) -> Result<Vec<EventEnvelope>>;

    /// Gets the current version of an instance.
    ///
    /// Returns None if the instance has no events.
    async fn current_version(&self, key: &InstanceKey) -> Result<Option<Version>>;

    /// Retrieves events across instances in ascending journal offset order.
    ///
    /// This is what projection consumers use to resume from a cursor.
    async fn fetch(&self, query: JournalQuery) -> Result<Vec<EventEnvelope>>;
}

/// Extension trait providing convenience methods for journals.
#[async_trait]
pub trait EventJournalExt: EventJournal {
    /// Appends a single event.
    async fn append_event(&self, event: EventEnvelope, options: AppendOptions) -> Result<Version> {
        self.append(vec![event], options).await
    }

    /// Returns the full history of an instance.
    async fn stream_all(&self, key: &InstanceKey) -> Result<Vec<EventEnvelope>> {
        self.stream_since(key, Version::initial()).await
    }
}

// Blanket implementation for all journal implementations
impl<T: EventJournal + ?Sized> EventJournalExt for T {}

/// Validates a batch of events before appending.
///
/// A batch must be non-empty, target a single instance and carry
/// consecutive versions.
pub fn validate_events_for_append(events: &[EventEnvelope]) -> Result<()> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::InvalidAppend(
            "Cannot append empty event list".to_string(),
        ));
    };

    let key = first.instance_key();
    if events.iter().skip(1).any(|event| !event.belongs_to(&key)) {
        return Err(EventStoreError::InvalidAppend(
            "All events must belong to the same aggregate instance".to_string(),
        ));
    }

    let mut expected_version = first.version;
    for event in events.iter().skip(1) {
        expected_version = expected_version.next();
        if event.version != expected_version {
            return Err(EventStoreError::InvalidAppend(format!(
                "Event versions must be sequential. Expected {}, got {}",
                expected_version, event.version
            )));
        }
    }

    Ok(())
}
