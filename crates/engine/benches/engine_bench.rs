use std::sync::Arc;
use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use engine::{
    Aggregate, AggregateConfiguration, AggregateEngine, AggregateRegistry, CommandRequest,
    Consistency, DomainEvent, InMemoryAggregateCache, Infrastructure, PendingEvent,
};
use event_store::{
    AggregateId, AppendOptions, EventEnvelope, EventJournal, InMemoryEventStore, InstanceKey,
    TenantId, Version,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Counter {
    total: i64,
}

impl Aggregate for Counter {
    fn aggregate_type() -> &'static str {
        "Counter"
    }
}

#[derive(Deserialize)]
struct Add {
    amount: i64,
}

#[derive(Serialize, Deserialize)]
struct Added {
    amount: i64,
}

impl DomainEvent for Added {}

fn registry() -> AggregateRegistry<Counter> {
    AggregateRegistry::<Counter>::builder()
        .default_behaviour::<Add, _>(|_, cmd| Ok(vec![PendingEvent::new(&Added { amount: cmd.amount })?]))
        .default_aggregator::<Added, _>(|s, e| Counter {
            total: s.total + e.amount,
        })
        .build()
        .unwrap()
}

fn make_engine(store: &InMemoryEventStore, config: AggregateConfiguration) -> AggregateEngine<Counter> {
    let store = Arc::new(store.clone());
    let cache = Arc::new(InMemoryAggregateCache::<Counter>::new(10_000, Duration::from_secs(600)));
    let infra = Infrastructure::new(store.clone(), cache)
        .with_snapshots(store.clone())
        .with_failure_sink(store);
    AggregateEngine::new(registry(), infra, config)
}

fn add(id: &str, amount: i64) -> CommandRequest {
    CommandRequest::new("Add", "bench", json!({ "aggregateId": id, "amount": amount }))
}

fn bench_process_cached(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();
    let engine = make_engine(&store, AggregateConfiguration::default());
    rt.block_on(async { engine.process(add("hot", 1)).await.unwrap() });

    c.bench_function("engine/process_cached_instance", |b| {
        b.iter(|| {
            rt.block_on(async {
                engine.process(add("hot", 1)).await.unwrap();
            });
        });
    });
}

fn bench_process_new_instance(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("engine/process_new_instance", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let engine = make_engine(&store, AggregateConfiguration::default());
                engine.process(add("fresh", 1)).await.unwrap();
            });
        });
    });
}

fn bench_ephemeral(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();
    let engine = make_engine(
        &store,
        AggregateConfiguration {
            persistence_mode: engine::PersistenceMode::Ephemeral,
            ..Default::default()
        },
    );

    c.bench_function("engine/process_ephemeral", |b| {
        b.iter(|| {
            rt.block_on(async {
                engine.process(add("ephemeral", 1)).await.unwrap();
            });
        });
    });
}

fn bench_cold_load(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();
    let key = InstanceKey::new("Counter", AggregateId::new("cold"), TenantId::new("bench"));

    // Pre-populate 100 events with no snapshot
    rt.block_on(async {
        let events: Vec<EventEnvelope> = (1..=100)
            .map(|v| {
                EventEnvelope::builder()
                    .instance(key.clone())
                    .event_type("Added")
                    .version(Version::new(v))
                    .payload(&Added { amount: v })
                    .unwrap()
                    .build()
            })
            .collect();
        store.append(events, AppendOptions::new()).await.unwrap();
    });

    c.bench_function("engine/cold_load_100_events", |b| {
        b.iter(|| {
            rt.block_on(async {
                let engine = make_engine(&store, AggregateConfiguration::default());
                engine.fetch(&key, Consistency::Strong).await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_process_cached,
    bench_process_new_instance,
    bench_ephemeral,
    bench_cold_load,
);
criterion_main!(benches);
