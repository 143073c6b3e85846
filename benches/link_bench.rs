//! Benchmarks for the wirelink connection core
//!
//! Run with: cargo bench

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use wirelink::connection::SubscriptionRegistry;
use wirelink::transport::codec::Decoder;
use wirelink::transport::matches;
use wirelink::*;

fn bench_topics(c: &mut Criterion) {
    let mut group = c.benchmark_group("topics");

    let cases = [
        ("literal", "metrics.host1.cpu", "metrics.host1.cpu"),
        ("single_wildcard", "metrics.*.cpu", "metrics.host1.cpu"),
        ("tail_wildcard", "metrics.>", "metrics.host1.cpu.core0"),
        ("miss", "orders.*", "metrics.host1.cpu"),
    ];

    for (name, pattern, subject) in cases {
        group.bench_function(name, |b| {
            b.iter(|| matches(black_box(pattern), black_box(subject)))
        });
    }

    group.finish();
}

fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    let topics: Vec<String> = (0..1000).map(|i| format!("metrics.host{}.cpu", i)).collect();
    group.throughput(Throughput::Elements(topics.len() as u64));

    group.bench_function("insert_remove_1000", |b| {
        b.iter(|| {
            let mut registry = SubscriptionRegistry::new();
            let subs: Vec<_> = topics
                .iter()
                .enumerate()
                .map(|(sid, topic)| registry.insert(topic, sid as u64))
                .collect();
            for sub in subs {
                registry.remove(black_box(sub.id));
            }
        })
    });

    group.bench_function("lookup_by_topic", |b| {
        let mut registry = SubscriptionRegistry::new();
        for (sid, topic) in topics.iter().enumerate() {
            registry.insert(topic, sid as u64);
        }
        b.iter(|| registry.by_topic(black_box("metrics.host500.cpu")).is_some())
    });

    group.finish();
}

fn bench_decoder(c: &mut Criterion) {
    let mut group = c.benchmark_group("decoder");

    let frame: Vec<u8> = (0..100)
        .flat_map(|i| format!("MSG metrics.host{}.cpu 1 13\r\n{{\"load\":0.42}}\r\n", i).into_bytes())
        .collect();
    group.throughput(Throughput::Bytes(frame.len() as u64));

    group.bench_function("msg_batch_100", |b| {
        b.iter(|| {
            let mut decoder = Decoder::new();
            decoder.push(black_box(&frame));
            let mut ops = 0;
            while let Ok(Some(_)) = decoder.next_op() {
                ops += 1;
            }
            ops
        })
    });

    group.finish();
}

fn bench_loopback(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("loopback");

    group.bench_function("publish", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let broker = MemoryBroker::new();
                let connection = Connection::new(Arc::new(broker));
                let config = ConnectionConfig::new("ws://localhost:8080").user_pass("a", "b");
                connection.connect(&config).await;

                let payload = Bytes::from_static(b"{\"load\":0.42}");
                let start = std::time::Instant::now();

                for _ in 0..iters {
                    connection
                        .publish_bytes(black_box("metrics.host1.cpu"), payload.clone())
                        .await;
                }

                start.elapsed()
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_topics, bench_registry, bench_decoder, bench_loopback);
criterion_main!(benches);
