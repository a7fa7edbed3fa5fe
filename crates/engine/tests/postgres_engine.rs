//! End-to-end engine tests against PostgreSQL.
//!
//! ```bash
//! cargo test -p engine --test postgres_engine
//! ```

mod support;

use std::sync::Arc;

use engine::{AggregateConfiguration, AggregateEngine, Consistency, Infrastructure};
use event_store::{
    ErrorSource, EventJournal, EventJournalExt, PostgresEventStore, SnapshotStore, Version,
};
use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;
use support::{DataRecord, change_request, create_request, key, registry};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/001_create_journal.sql"))
                .execute(&pool)
                .await
                .unwrap();
            pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_store() -> PostgresEventStore {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE event_journal, snapshots, journal_offsets, rejected_commands \
         RESTART IDENTITY",
    )
    .execute(&pool)
    .await
    .unwrap();

    PostgresEventStore::new(pool)
}

fn engine(store: &PostgresEventStore, config: AggregateConfiguration) -> AggregateEngine<DataRecord> {
    let infra = Infrastructure::from_store(store.clone(), &config);
    AggregateEngine::new(registry(), infra, config)
}

#[tokio::test]
#[serial]
async fn commands_persist_and_replay() {
    let store = get_test_store().await;
    let writer = engine(&store, AggregateConfiguration::default());
    let a1 = key("A1", "T1");

    writer
        .process(create_request("A1", "T1", "c1", json!({"x": 1})))
        .await
        .unwrap();
    writer
        .process(change_request("A1", "T1", "c2", json!({"x": 2})))
        .await
        .unwrap();

    let events = store.stream_all(&a1).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].version, Version::new(2));

    let reader = engine(&store, AggregateConfiguration::default());
    let state = reader.fetch(&a1, Consistency::Eventual).await.unwrap();
    assert_eq!(state.domain_state().data, Some(json!({"x": 2})));
    assert_eq!(state.current_version(), Version::new(2));

    let err = reader
        .process(change_request("A1", "T1", "c2", json!({"x": 2})))
        .await
        .unwrap_err();
    assert!(err.is_rejection());
}

#[tokio::test]
#[serial]
async fn stale_writer_retries_through_unique_constraint() {
    let store = get_test_store().await;
    let writer_a = engine(&store, AggregateConfiguration::default());
    let writer_b = engine(&store, AggregateConfiguration::default());
    let a1 = key("A1", "T1");

    writer_a
        .process(create_request("A1", "T1", "c1", json!({"x": 1})))
        .await
        .unwrap();
    writer_b.fetch(&a1, Consistency::Eventual).await.unwrap();
    writer_a
        .process(change_request("A1", "T1", "c2", json!({"x": 2})))
        .await
        .unwrap();

    let state = writer_b
        .process(change_request("A1", "T1", "c3", json!({"x": 3})))
        .await
        .unwrap();

    assert_eq!(state.changes, 2);
    assert_eq!(store.current_version(&a1).await.unwrap(), Some(Version::new(3)));
}

#[tokio::test]
#[serial]
async fn snapshot_written_and_failures_recorded() {
    let store = get_test_store().await;
    let config = AggregateConfiguration {
        snapshot_threshold: Some(2),
        ..Default::default()
    };
    let writer = engine(&store, config.clone());
    let a1 = key("A1", "T1");

    writer
        .process(create_request("A1", "T1", "c1", json!({"x": 1})))
        .await
        .unwrap();
    writer
        .process(change_request("A1", "T1", "c2", json!({"x": 2})))
        .await
        .unwrap();
    writer.drain_background_tasks().await;

    let snapshot = SnapshotStore::get(&store, &a1).await.unwrap().unwrap();
    assert_eq!(snapshot.version, Version::new(2));
    assert_eq!(snapshot.command_ids.len(), 2);

    let restarted = engine(&store, config.clone());
    let err = restarted
        .process(change_request("A1", "T1", "c2", json!({"x": 2})))
        .await
        .unwrap_err();
    assert!(err.is_rejection());
    assert_eq!(store.current_version(&a1).await.unwrap(), Some(Version::new(2)));

    writer
        .process(change_request("A2", "T1", "c1", json!({"x": 1})))
        .await
        .unwrap_err();

    let (source, code): (String, i32) = sqlx::query_as(
        "SELECT source, code FROM rejected_commands WHERE aggregate_id = 'A2'",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(source, ErrorSource::Logic.as_str());
    assert_eq!(code, 404);
}
