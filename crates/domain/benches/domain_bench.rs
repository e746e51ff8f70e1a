use criterion::{Criterion, criterion_group, criterion_main};
use domain::{
    AddItem, CommandHandler, CreateOrder, CustomerId, Money, Order, OrderItem, PlaceOrder,
};
use event_store::InMemoryEventStore;

fn bench_create_order(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("domain/create_order", |b| {
        b.iter(|| {
            rt.block_on(async {
                let handler: CommandHandler<_, Order> = CommandHandler::new(InMemoryEventStore::new());
                handler
                    .execute(&CreateOrder::for_customer(CustomerId::new()))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_replay_order_with_100_items(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let handler: CommandHandler<_, Order> = CommandHandler::new(InMemoryEventStore::new());
    let create = CreateOrder::for_customer(CustomerId::new());
    let order_id = create.order_id;

    rt.block_on(async {
        handler.execute(&create).await.unwrap();
        for i in 0..100 {
            handler
                .execute(&AddItem::new(
                    order_id,
                    OrderItem::new(format!("SKU-{i}").as_str(), 1, Money::from_cents(100)),
                ))
                .await
                .unwrap();
        }
    });

    c.bench_function("domain/replay_101_events", |b| {
        b.iter(|| {
            rt.block_on(async {
                handler.load(order_id).await.unwrap();
            });
        });
    });
}

fn bench_place_order_with_scheduling(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("domain/place_order_schedules_two_commands", |b| {
        b.iter(|| {
            rt.block_on(async {
                let handler: CommandHandler<_, Order> = CommandHandler::new(InMemoryEventStore::new());
                let create = CreateOrder::for_customer(CustomerId::new());
                let order_id = create.order_id;
                handler.execute(&create).await.unwrap();
                handler
                    .execute(&AddItem::new(
                        order_id,
                        OrderItem::new("SKU", 1, Money::from_cents(100)),
                    ))
                    .await
                    .unwrap();
                handler.execute(&PlaceOrder::new(order_id, 1)).await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_create_order,
    bench_replay_order_with_100_items,
    bench_place_order_with_scheduling,
);
criterion_main!(benches);
