//! Engine benchmarks: filter evaluation, subscription matching and dispatch.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use syncwire_core::filter::matches_all;
use syncwire_core::{Catalog, MemoryStore, SubscriptionRegistry};
use syncwire_protocol::{
    FilterOperator, FilterOption, Message, MessageCodec, Operation, QueryOptions,
};
use syncwire_server::{Config, Engine};
use tokio::runtime::Runtime;

// Unique request ids across iterations
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_id() -> String {
    format!("req-{}", REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed))
}

fn sample_record() -> serde_json::Value {
    serde_json::json!({
        "id": 17,
        "status": "open",
        "total": 120,
        "customer": "acme",
        "region": "eu-west",
    })
}

fn bench_filter_eval(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_eval");
    let record = sample_record();

    let cases = vec![
        ("empty", vec![]),
        ("eq", vec![FilterOption::eq("status", "open")]),
        (
            "range",
            vec![
                FilterOption::new("total", FilterOperator::Gte, 100),
                FilterOption::new("total", FilterOperator::Lt, 500),
            ],
        ),
        (
            "in_like",
            vec![
                FilterOption::new(
                    "status",
                    FilterOperator::In,
                    serde_json::json!(["open", "pending"]),
                ),
                FilterOption::new("region", FilterOperator::Like, "eu-%"),
            ],
        ),
    ];

    for (name, filters) in cases {
        group.bench_with_input(BenchmarkId::from_parameter(name), &filters, |b, filters| {
            b.iter(|| black_box(matches_all(filters, &record)));
        });
    }

    group.finish();
}

fn bench_subscription_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("subscription_matching");
    let record = sample_record();

    for count in [10, 100, 1000] {
        let registry = SubscriptionRegistry::new();
        for i in 0..count {
            let filters = if i % 2 == 0 {
                vec![FilterOption::eq("status", "open")]
            } else {
                vec![FilterOption::eq("status", "closed")]
            };
            registry.subscribe(
                registry.next_id(),
                format!("conn-{}", i % 16),
                "public",
                "orders",
                filters,
            );
            // Subscriptions on another entity must not be scanned.
            registry.subscribe(registry.next_id(), "conn-x", "public", "invoices", vec![]);
        }

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &registry, |b, registry| {
            b.iter(|| black_box(registry.matching("public", "orders", &record)));
        });
    }

    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let _guard = rt.enter();
    let engine = Engine::new(
        &Config::default(),
        Arc::new(MemoryStore::new()),
        Catalog::permissive(),
    )
    .unwrap();
    let mut channel = engine.open_channel("bench-conn", "bench");

    // Seed a table for reads.
    rt.block_on(async {
        for i in 0..100 {
            let msg = Message::request(next_id(), Operation::Create, "public", "orders")
                .with_data(serde_json::json!({
                    "status": if i % 2 == 0 { "open" } else { "closed" },
                    "total": i,
                }));
            channel.send(MessageCodec::encode(&msg).unwrap()).await;
            channel.recv().await.unwrap();
        }
    });

    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ping", |b| {
        b.iter(|| {
            rt.block_on(async {
                let msg = Message::ping(next_id());
                channel.send(MessageCodec::encode(&msg).unwrap()).await;
                black_box(channel.recv().await.unwrap())
            })
        });
    });

    group.bench_function("create", |b| {
        b.iter(|| {
            rt.block_on(async {
                let msg = Message::request(next_id(), Operation::Create, "public", "orders")
                    .with_data(serde_json::json!({"status": "open", "total": 1}));
                channel.send(MessageCodec::encode(&msg).unwrap()).await;
                black_box(channel.recv().await.unwrap())
            })
        });
    });

    group.bench_function("read_filtered", |b| {
        b.iter(|| {
            rt.block_on(async {
                let msg = Message::request(next_id(), Operation::Read, "public", "orders")
                    .with_options(
                        QueryOptions::default()
                            .with_filter(FilterOption::eq("status", "closed"))
                            .with_limit(20),
                    );
                channel.send(MessageCodec::encode(&msg).unwrap()).await;
                black_box(channel.recv().await.unwrap())
            })
        });
    });

    group.finish();
    rt.block_on(engine.shutdown());
}

criterion_group!(
    benches,
    bench_filter_eval,
    bench_subscription_matching,
    bench_dispatch,
);

criterion_main!(benches);
