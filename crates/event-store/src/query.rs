use crate::TenantId;

/// Default number of events returned per projection poll.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Builder for offset-based journal queries.
///
/// Results are always ordered by ascending journal offset, so a consumer can
/// resume from the largest offset it has seen.
#[derive(Debug, Clone, Default)]
pub struct JournalQuery {
    /// Only events of this tenant.
    pub tenant_id: Option<TenantId>,

    /// Filter by aggregate types (any of these types).
    pub aggregate_types: Option<Vec<String>>,

    /// Filter by event types (any of these types).
    pub event_types: Option<Vec<String>>,

    /// Only events with a journal offset strictly greater than this.
    pub after_offset: i64,

    /// Maximum number of events to return.
    pub limit: Option<usize>,
}

impl JournalQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for one tenant starting after `offset`.
    pub fn for_tenant(tenant_id: TenantId, offset: i64) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            after_offset: offset,
            ..Default::default()
        }
    }

    /// Filters by tenant.
    pub fn tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Filters by aggregate type.
    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_types = Some(vec![aggregate_type.into()]);
        self
    }

    /// Filters by multiple aggregate types (any of these).
    pub fn aggregate_types(mut self, aggregate_types: Vec<String>) -> Self {
        self.aggregate_types = Some(aggregate_types);
        self
    }

    /// Filters by event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types = Some(vec![event_type.into()]);
        self
    }

    /// Filters by multiple event types (any of these).
    pub fn event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// Resumes after the given journal offset.
    pub fn after_offset(mut self, offset: i64) -> Self {
        self.after_offset = offset;
        self
    }

    /// Limits the number of events returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if an event with these attributes passes the filters.
    pub fn matches(
        &self,
        tenant_id: &TenantId,
        aggregate_type: &str,
        event_type: &str,
        journal_offset: i64,
    ) -> bool {
        if journal_offset <= self.after_offset {
            return false;
        }
        if let Some(ref tenant) = self.tenant_id
            && tenant != tenant_id
        {
            return false;
        }
        if let Some(ref types) = self.aggregate_types
            && !types.iter().any(|t| t == aggregate_type)
        {
            return false;
        }
        if let Some(ref types) = self.event_types
            && !types.iter().any(|t| t == event_type)
        {
            return false;
        }
        true
    }
}
