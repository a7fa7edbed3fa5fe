//! Append-only event journal, snapshot store and the auxiliary stores the
//! aggregate engine and projections rely on.

pub mod error;
pub mod event;
pub mod failure;
pub mod memory;
pub mod offset;
pub mod postgres;
pub mod query;
pub mod snapshot;
pub mod store;

pub use common::{AggregateId, CommandId, InstanceKey, TenantId};
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, Version};
pub use failure::{ErrorSource, FailedCommand, FailureSink};
pub use memory::InMemoryEventStore;
pub use offset::{JournalOffset, OffsetStore};
pub use postgres::PostgresEventStore;
pub use query::{DEFAULT_BATCH_SIZE, JournalQuery};
pub use snapshot::{Snapshot, SnapshotStore};
pub use store::{AppendOptions, EventJournal, EventJournalExt, validate_events_for_append};
