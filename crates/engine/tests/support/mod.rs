//! Test domain: a record whose data is created once and then replaced.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use engine::{
    Aggregate, AggregateConfiguration, AggregateEngine, AggregateRegistry, CommandRequest,
    DomainEvent, InMemoryAggregateCache, Infrastructure, PendingEvent, Rejection,
};
use event_store::{AggregateId, InMemoryEventStore, InstanceKey, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub data: Option<Value>,
    pub changes: u32,
}

impl Aggregate for DataRecord {
    fn aggregate_type() -> &'static str {
        "Data"
    }
}

#[derive(Debug, Deserialize)]
pub struct Create {
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub new_data: Value,
}

/// Accepted but never changes anything.
#[derive(Debug, Deserialize)]
pub struct Touch {}

/// Emits an event the aggregate has no aggregator for.
#[derive(Debug, Deserialize)]
pub struct Forget {}

#[derive(Debug, Serialize, Deserialize)]
pub struct Created {
    pub data: Value,
}

impl DomainEvent for Created {}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Changed {
    pub new_data: Value,
}

impl DomainEvent for Changed {}

#[derive(Debug, Serialize, Deserialize)]
pub struct Forgotten {}

impl DomainEvent for Forgotten {}

fn create(state: &DataRecord, cmd: &Create) -> Result<Vec<PendingEvent>, Rejection> {
    if state.data.is_some() {
        return Err(Rejection::new("Data already exists", 409));
    }
    Ok(vec![PendingEvent::new(&Created {
        data: cmd.data.clone(),
    })?])
}

fn change(state: &DataRecord, cmd: &Change) -> Result<Vec<PendingEvent>, Rejection> {
    if state.data.is_none() {
        return Err(Rejection::new("Data does not exist", 404).with_hint("Send Create first"));
    }
    Ok(vec![PendingEvent::new(&Changed {
        new_data: cmd.new_data.clone(),
    })?])
}

pub fn registry() -> AggregateRegistry<DataRecord> {
    AggregateRegistry::builder()
        .default_behaviour::<Create, _>(create)
        .default_behaviour::<Change, _>(change)
        .default_behaviour::<Touch, _>(|_, _| Ok(vec![]))
        .default_behaviour::<Forget, _>(|_, _| Ok(vec![PendingEvent::new(&Forgotten {})?]))
        // Tenant T2 keeps the previous value next to the new one
        .behaviour::<Change, _>("T2", |state, cmd| {
            let merged = json!({ "previous": state.data, "current": cmd.new_data });
            Ok(vec![PendingEvent::new(&Changed { new_data: merged })?])
        })
        .default_aggregator::<Created, _>(|_, e| DataRecord {
            data: Some(e.data.clone()),
            changes: 0,
        })
        .default_aggregator::<Changed, _>(|s, e| DataRecord {
            data: Some(e.new_data.clone()),
            changes: s.changes + 1,
        })
        .build()
        .unwrap()
}

pub type TestCache = Arc<InMemoryAggregateCache<DataRecord>>;

/// An engine over a shared store with its own cache.
pub fn engine(
    store: &InMemoryEventStore,
    config: AggregateConfiguration,
) -> (AggregateEngine<DataRecord>, TestCache) {
    let cache: TestCache = Arc::new(InMemoryAggregateCache::new(100, Duration::from_secs(60)));
    let store = Arc::new(store.clone());
    let infra = Infrastructure::new(store.clone(), cache.clone())
        .with_snapshots(store.clone())
        .with_failure_sink(store);

    (AggregateEngine::new(registry(), infra, config), cache)
}

pub fn key(id: &str, tenant: &str) -> InstanceKey {
    InstanceKey::new("Data", AggregateId::new(id), TenantId::new(tenant))
}

pub fn create_request(id: &str, tenant: &str, command_id: &str, data: Value) -> CommandRequest {
    CommandRequest::new(
        "Create",
        tenant,
        json!({ "aggregateId": id, "commandId": command_id, "data": data }),
    )
}

pub fn change_request(id: &str, tenant: &str, command_id: &str, new_data: Value) -> CommandRequest {
    CommandRequest::new(
        "Change",
        tenant,
        json!({ "aggregateId": id, "commandId": command_id, "newData": new_data }),
    )
}
