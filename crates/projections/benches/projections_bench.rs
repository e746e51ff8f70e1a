use async_trait::async_trait;
use common::AggregateId;
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use event_store::{EventStore, InMemoryEventStore, Interest, NewEvent};
use projections::{
    EventBus, EventEnvelope, InMemoryReadModelStore, InMemoryUnitOfWork, Projector,
    ReadModelCatchup, Result,
};

/// Counts events per aggregate.
struct Counter(&'static str);

#[async_trait]
impl Projector<InMemoryUnitOfWork> for Counter {
    fn name(&self) -> Option<String> {
        Some(self.0.to_string())
    }

    fn interests(&self) -> Vec<Interest> {
        vec![Interest::stream("Order")]
    }

    async fn handle(&self, event: &EventEnvelope, uow: &mut InMemoryUnitOfWork) -> Result<()> {
        let key = event.aggregate_id.to_string();
        let count: u64 = uow.document(self.0, &key).await?.unwrap_or(0);
        uow.put_document(self.0, key, &(count + 1))
    }
}

/// Populates a store with `orders` aggregates of 10 events each, interleaved
/// with customer events no projector is interested in.
async fn populate_store(store: &InMemoryEventStore, orders: usize) {
    for _ in 0..orders {
        for stream in ["Order", "Customer"] {
            let id = AggregateId::new();
            let events: Vec<NewEvent> = (1..=10)
                .map(|seq| {
                    NewEvent::builder()
                        .stream_name(stream)
                        .event_type("ItemAdded")
                        .aggregate_id(id)
                        .sequence_number(seq)
                        .body_raw(r#"{"sku":"abc","quantity":1}"#)
                        .build()
                })
                .collect();
            store.append(events).await.unwrap();
        }
    }
}

fn bench_catchup_1000_events(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();
    rt.block_on(populate_store(&store, 100));

    c.bench_function("projections/catchup_1000_matching_events", |b| {
        b.iter_batched(
            || {
                ReadModelCatchup::builder(store.clone(), InMemoryReadModelStore::new())
                    .projector(Counter("orders"))
                    .build()
                    .unwrap()
            },
            |catchup| rt.block_on(catchup.run()).unwrap(),
            BatchSize::SmallInput,
        );
    });
}

fn bench_catchup_three_projectors(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();
    rt.block_on(populate_store(&store, 100));

    c.bench_function("projections/catchup_three_projectors", |b| {
        b.iter_batched(
            || {
                ReadModelCatchup::builder(store.clone(), InMemoryReadModelStore::new())
                    .projector(Counter("a"))
                    .projector(Counter("b"))
                    .projector(Counter("c"))
                    .build()
                    .unwrap()
            },
            |catchup| rt.block_on(catchup.run()).unwrap(),
            BatchSize::SmallInput,
        );
    });
}

fn bench_bus_routing(c: &mut Criterion) {
    let mut bus = EventBus::new();
    for i in 0..20 {
        bus.subscribe(
            i,
            &[
                Interest::event(format!("Stream{}", i % 4), format!("Event{i}")),
                Interest::prefix(format!("Stream{}", i % 4), "Scheduled:"),
            ],
        );
    }
    bus.subscribe(20, &[Interest::all()]);

    c.bench_function("projections/bus_route", |b| {
        b.iter(|| bus.route("Stream1", "Scheduled:Ship"));
    });
}

criterion_group!(
    benches,
    bench_catchup_1000_events,
    bench_catchup_three_projectors,
    bench_bus_routing
);
criterion_main!(benches);
