//! Core projection trait.

use async_trait::async_trait;
use event_store::{EventEnvelope, JournalQuery, TenantId};

use crate::Result;

/// A consumer of the journal that maintains a read model for one tenant.
///
/// Events reach [`apply`](EventProjection::apply) in ascending journal offset
/// order, in batches. A batch is delivered again if the poller fails before
/// the offset is stored, so `apply` should tolerate redelivery.
#[async_trait]
pub trait EventProjection: Send + Sync {
    /// Consumer name under which the offset is stored.
    fn name(&self) -> &str;

    fn tenant(&self) -> &TenantId;

    /// Aggregate types to receive; `None` means all.
    fn aggregate_types(&self) -> Option<Vec<String>> {
        None
    }

    /// Event types to receive; `None` means all.
    fn event_types(&self) -> Option<Vec<String>> {
        None
    }

    async fn apply(&self, events: &[EventEnvelope]) -> Result<()>;

    /// Clears the read model before a rebuild.
    async fn reset(&self) -> Result<()> {
        Ok(())
    }

    /// The journal query for the next batch after `offset`.
    fn query(&self, offset: i64, batch_size: usize) -> JournalQuery {
        let mut query = JournalQuery::for_tenant(self.tenant().clone(), offset).limit(batch_size);
        if let Some(types) = self.aggregate_types() {
            query = query.aggregate_types(types);
        }
        if let Some(types) = self.event_types() {
            query = query.event_types(types);
        }
        query
    }
}
