use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, postgres::PgRow, types::Json};
use uuid::Uuid;

use crate::{
    AggregateId, CommandId, EventEnvelope, EventId, EventStoreError, FailedCommand, FailureSink,
    InstanceKey, JournalOffset, JournalQuery, OffsetStore, Result, Snapshot, SnapshotStore,
    TenantId, Version,
    store::{AppendOptions, EventJournal, validate_events_for_append},
};

/// Advisory lock key held for the duration of every append transaction.
const JOURNAL_APPEND_LOCK: i64 = 0x6a6f_7572_6e61_6c;

const EVENT_COLUMNS: &str = "journal_offset, event_id, event_type, aggregate_type, aggregate_id, \
     tenant_id, event_version, schema_version, command_id, timestamp, payload";

/// PostgreSQL-backed journal, snapshot, offset and failure store.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL event store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_event(row: PgRow) -> Result<EventEnvelope> {
        let command_id: Option<String> = row.try_get("command_id")?;
        let schema_version: i32 = row.try_get("schema_version")?;

        Ok(EventEnvelope {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            event_type: row.try_get("event_type")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: AggregateId::new(row.try_get::<String, _>("aggregate_id")?),
            tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id")?),
            version: Version::new(row.try_get("event_version")?),
            schema_version: schema_version as u32,
            command_id: command_id.map(CommandId::new),
            journal_offset: row.try_get("journal_offset")?,
            timestamp: row.try_get("timestamp")?,
            payload: row.try_get("payload")?,
        })
    }

    fn row_to_snapshot(row: PgRow) -> Result<Snapshot> {
        let schema_version: i32 = row.try_get("schema_version")?;
        Ok(Snapshot {
            key: InstanceKey::new(
                row.try_get::<String, _>("aggregate_type")?,
                AggregateId::new(row.try_get::<String, _>("aggregate_id")?),
                TenantId::new(row.try_get::<String, _>("tenant_id")?),
            ),
            version: Version::new(row.try_get("event_version")?),
            schema_version: schema_version as u32,
            timestamp: row.try_get("timestamp")?,
            state: row.try_get("state")?,
            command_ids: row
                .try_get::<Json<Vec<CommandId>>, _>("command_ids")?
                .0,
        })
    }
}

#[async_trait]
impl EventJournal for PostgresEventStore {
    #[tracing::instrument(skip(self, events, options), fields(count = events.len()))]
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version> {
        validate_events_for_append(&events)?;

        let key = events[0].instance_key();

        let mut tx = self.pool.begin().await?;

        // Offsets must become visible in the order they are assigned, or a
        // projection cursor could skip an event that commits late.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(JOURNAL_APPEND_LOCK)
            .execute(&mut *tx)
            .await?;

        if let Some(expected) = options.expected_version {
            let current_version: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT MAX(event_version) FROM event_journal
                WHERE aggregate_type = $1 AND aggregate_id = $2 AND tenant_id = $3
                "#,
            )
            .bind(&key.aggregate_type)
            .bind(key.aggregate_id.as_str())
            .bind(key.tenant_id.as_str())
            .fetch_one(&mut *tx)
            .await?;

            let actual = Version::new(current_version.unwrap_or(0));

            if actual != expected {
                metrics::counter!("event_store_append_conflicts_total").increment(1);
                return Err(EventStoreError::ConcurrencyConflict {
                    instance: key,
                    expected,
                    actual,
                });
            }
        }

        let mut last_version = Version::initial();
        for event in &events {
            sqlx::query(
                r#"
                INSERT INTO event_journal (event_id, event_type, aggregate_type, aggregate_id, tenant_id,
                                           event_version, schema_version, command_id, timestamp, payload)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(&event.event_type)
            .bind(&event.aggregate_type)
            .bind(event.aggregate_id.as_str())
            .bind(event.tenant_id.as_str())
            .bind(event.version.as_i64())
            .bind(event.schema_version as i32)
            .bind(event.command_id.as_ref().map(|id| id.as_str()))
            .bind(event.timestamp)
            .bind(&event.payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                // The unique (instance, version) constraint catches writers that raced past the check
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_instance_version")
                {
                    metrics::counter!("event_store_append_conflicts_total").increment(1);
                    return EventStoreError::ConcurrencyConflict {
                        instance: key.clone(),
                        expected: options.expected_version.unwrap_or(Version::initial()),
                        actual: event.version,
                    };
                }
                EventStoreError::Database(e)
            })?;

            last_version = event.version;
        }

        tx.commit().await?;
        tracing::debug!(instance = %key, version = %last_version, "events appended");
        Ok(last_version)
    }

    async fn stream_since(&self, key: &InstanceKey, after: Version) -> Result<Vec<EventEnvelope>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM event_journal \
             WHERE aggregate_type = $1 AND aggregate_id = $2 AND tenant_id = $3 AND event_version > $4 \
             ORDER BY event_version ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(&key.aggregate_type)
            .bind(key.aggregate_id.as_str())
            .bind(key.tenant_id.as_str())
            .bind(after.as_i64())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn current_version(&self, key: &InstanceKey) -> Result<Option<Version>> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(event_version) FROM event_journal
            WHERE aggregate_type = $1 AND aggregate_id = $2 AND tenant_id = $3
            "#,
        )
        .bind(&key.aggregate_type)
        .bind(key.aggregate_id.as_str())
        .bind(key.tenant_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(version.map(Version::new))
    }

    async fn fetch(&self, query: JournalQuery) -> Result<Vec<EventEnvelope>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {EVENT_COLUMNS} FROM event_journal WHERE journal_offset > "
        ));
        builder.push_bind(query.after_offset);

        if let Some(tenant) = query.tenant_id {
            builder.push(" AND tenant_id = ");
            builder.push_bind(tenant.as_str().to_string());
        }
        if let Some(aggregate_types) = query.aggregate_types {
            builder.push(" AND aggregate_type = ANY(");
            builder.push_bind(aggregate_types);
            builder.push(")");
        }
        if let Some(event_types) = query.event_types {
            builder.push(" AND event_type = ANY(");
            builder.push_bind(event_types);
            builder.push(")");
        }

        builder.push(" ORDER BY journal_offset ASC");

        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_event).collect()
    }
}

#[async_trait]
impl SnapshotStore for PostgresEventStore {
    async fn get(&self, key: &InstanceKey) -> Result<Option<Snapshot>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT aggregate_type, aggregate_id, tenant_id, event_version, schema_version, timestamp, state,
                   command_ids
            FROM snapshots
            WHERE aggregate_type = $1 AND aggregate_id = $2 AND tenant_id = $3
            "#,
        )
        .bind(&key.aggregate_type)
        .bind(key.aggregate_id.as_str())
        .bind(key.tenant_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_snapshot).transpose()
    }

    async fn insert(&self, snapshot: Snapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_type, aggregate_id, tenant_id, event_version, schema_version,
                                   timestamp, state, command_ids)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&snapshot.key.aggregate_type)
        .bind(snapshot.key.aggregate_id.as_str())
        .bind(snapshot.key.tenant_id.as_str())
        .bind(snapshot.version.as_i64())
        .bind(snapshot.schema_version as i32)
        .bind(snapshot.timestamp)
        .bind(&snapshot.state)
        .bind(Json(&snapshot.command_ids))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return EventStoreError::DuplicateSnapshot(snapshot.key.clone());
            }
            EventStoreError::Database(e)
        })?;

        Ok(())
    }

    async fn update(&self, snapshot: Snapshot) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE snapshots
            SET event_version = $4, schema_version = $5, timestamp = $6, state = $7, command_ids = $8
            WHERE aggregate_type = $1 AND aggregate_id = $2 AND tenant_id = $3
            "#,
        )
        .bind(&snapshot.key.aggregate_type)
        .bind(snapshot.key.aggregate_id.as_str())
        .bind(snapshot.key.tenant_id.as_str())
        .bind(snapshot.version.as_i64())
        .bind(snapshot.schema_version as i32)
        .bind(snapshot.timestamp)
        .bind(&snapshot.state)
        .bind(Json(&snapshot.command_ids))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EventStoreError::NotFound(format!(
                "snapshot for {}",
                snapshot.key
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl OffsetStore for PostgresEventStore {
    async fn get(&self, consumer: &str, tenant_id: &TenantId) -> Result<JournalOffset> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT consumer, tenant_id, journal_offset, updated_at
            FROM journal_offsets
            WHERE consumer = $1 AND tenant_id = $2
            "#,
        )
        .bind(consumer)
        .bind(tenant_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(JournalOffset {
                consumer: row.try_get("consumer")?,
                tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id")?),
                offset: row.try_get("journal_offset")?,
                updated_at: row.try_get("updated_at")?,
            }),
            None => Ok(JournalOffset::start(consumer, tenant_id.clone())),
        }
    }

    async fn put(&self, offset: JournalOffset) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO journal_offsets (consumer, tenant_id, journal_offset, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (consumer, tenant_id) DO UPDATE SET
                journal_offset = EXCLUDED.journal_offset,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&offset.consumer)
        .bind(offset.tenant_id.as_str())
        .bind(offset.offset)
        .bind(offset.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl FailureSink for PostgresEventStore {
    async fn record(&self, failure: FailedCommand) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rejected_commands (id, aggregate_type, aggregate_id, tenant_id, command_type,
                                           command_id, command, source, message, hint, code, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(failure.id)
        .bind(&failure.aggregate_type)
        .bind(failure.aggregate_id.as_str())
        .bind(failure.tenant_id.as_str())
        .bind(&failure.command_type)
        .bind(failure.command_id.as_str())
        .bind(&failure.command)
        .bind(failure.source.as_str())
        .bind(&failure.message)
        .bind(&failure.hint)
        .bind(failure.code)
        .bind(failure.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
