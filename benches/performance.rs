//! Performance benchmarks for the messaging client.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use courier::{BrokerConfig, Connection, ConnectionOptions, MemoryBroker, SubscriptionOptions};
use crossbeam_channel::{bounded, unbounded};
use std::time::Duration;

fn connect(broker: &MemoryBroker, client_id: &str) -> Connection {
    Connection::connect(
        broker.clone(),
        "test-cluster",
        client_id,
        ConnectionOptions::default(),
    )
    .unwrap()
}

/// Benchmark a blocking publish round trip
fn bench_publish_sync(c: &mut Criterion) {
    let broker = MemoryBroker::new(BrokerConfig::default());
    let conn = connect(&broker, "bench-sync");
    let publisher = conn.publisher();
    let payload = vec![7u8; 128];

    c.bench_function("publish_sync_128b", |b| {
        b.iter(|| {
            black_box(
                publisher
                    .publish_sync("bench.sync", payload.clone(), Duration::from_secs(2))
                    .unwrap(),
            );
        });
    });
}

/// Benchmark async publishes, waiting for the whole batch to be acked
fn bench_publish_async_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_async_batch");

    for batch in [10usize, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("messages", batch), &batch, |b, &batch| {
            let broker = MemoryBroker::new(BrokerConfig::default());
            let conn = connect(&broker, "bench-async");
            let publisher = conn.publisher();

            b.iter(|| {
                let (tx, rx) = bounded(batch);
                for i in 0..batch {
                    let tx = tx.clone();
                    publisher
                        .publish_async("bench.async", i.to_string(), move |result| {
                            let _ = tx.send(result);
                        })
                        .unwrap();
                }
                for _ in 0..batch {
                    black_box(rx.recv().unwrap().unwrap());
                }
            });
        });
    }

    group.finish();
}

/// Benchmark one publish fanned out to several subscriptions
fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for subscribers in [1usize, 4, 16] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &subscribers| {
                let broker = MemoryBroker::new(BrokerConfig::default());
                let conn = connect(&broker, "bench-fan-out");
                let (tx, rx) = unbounded();

                let _subs: Vec<_> = (0..subscribers)
                    .map(|_| {
                        let tx = tx.clone();
                        conn.subscribe("bench.fan", SubscriptionOptions::default(), move |msg| {
                            let _ = tx.send(msg.sequence);
                            Ok(())
                        })
                        .unwrap()
                    })
                    .collect();

                b.iter(|| {
                    conn.publish("bench.fan", "tick").unwrap();
                    for _ in 0..subscribers {
                        black_box(rx.recv().unwrap());
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_publish_sync,
    bench_publish_async_batch,
    bench_fan_out,
);

criterion_main!(benches);
