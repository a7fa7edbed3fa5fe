use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EventEnvelope, Result, TenantId};

/// Cursor of one projection consumer into the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalOffset {
    /// Name of the consumer owning the cursor.
    pub consumer: String,

    pub tenant_id: TenantId,

    /// Largest journal offset the consumer has processed.
    pub offset: i64,

    pub updated_at: DateTime<Utc>,
}

impl JournalOffset {
    /// A cursor positioned before the first event.
    pub fn start(consumer: impl Into<String>, tenant_id: TenantId) -> Self {
        Self {
            consumer: consumer.into(),
            tenant_id,
            offset: 0,
            updated_at: Utc::now(),
        }
    }

    /// Moves the cursor to the largest offset in `events`.
    ///
    /// An empty batch leaves the cursor where it is.
    pub fn advance(&self, events: &[EventEnvelope]) -> Self {
        let offset = events
            .iter()
            .map(|e| e.journal_offset)
            .max()
            .map_or(self.offset, |max| max.max(self.offset));
        Self {
            consumer: self.consumer.clone(),
            tenant_id: self.tenant_id.clone(),
            offset,
            updated_at: Utc::now(),
        }
    }
}

/// Persistent cursors for projection consumers.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Returns the consumer's cursor, or a fresh one at offset 0.
    async fn get(&self, consumer: &str, tenant_id: &TenantId) -> Result<JournalOffset>;

    /// Inserts or replaces the consumer's cursor.
    async fn put(&self, offset: JournalOffset) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AggregateId, InstanceKey, Version};

    fn event_at(offset: i64) -> EventEnvelope {
        let mut event = EventEnvelope::builder()
            .instance(InstanceKey::new(
                "TestAggregate",
                AggregateId::new("A1"),
                TenantId::new("T1"),
            ))
            .event_type("TestEvent")
            .version(Version::first())
            .payload_raw(serde_json::json!({}))
            .build();
        event.journal_offset = offset;
        event
    }

    #[test]
    fn advance_takes_max_offset() {
        let cursor = JournalOffset::start("consumer", TenantId::new("T1"));
        let cursor = cursor.advance(&[event_at(3), event_at(7), event_at(5)]);
        assert_eq!(cursor.offset, 7);
    }

    #[test]
    fn advance_with_empty_batch_keeps_offset() {
        let cursor = JournalOffset::start("consumer", TenantId::new("T1")).advance(&[event_at(4)]);
        assert_eq!(cursor.advance(&[]).offset, 4);
    }
}
