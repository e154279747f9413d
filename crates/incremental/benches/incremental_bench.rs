//! Benchmarks for ripple-incremental.
//!
//! Target: one source edit propagated through a short pipeline < 100μs

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ripple_incremental::{shared, ChangeEvent, ChangeStream, Filter, ReplayBuffer, Sort, Take, VersionedCollection};
use tokio::runtime::Runtime;

fn inserted(version: u64, value: i64) -> Arc<ChangeEvent<i64>> {
    Arc::new(ChangeEvent::Inserted {
        version,
        start: 0,
        items: vec![value],
    })
}

fn bench_replay_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");

    for size in [10, 100, 1000] {
        // a fresh buffer expects version 0 first
        let in_order: Vec<_> = (0..size).map(|v| inserted(v, v as i64)).collect();
        group.bench_with_input(BenchmarkId::new("in_order", size), &in_order, |b, events| {
            b.iter(|| {
                let mut buffer = ReplayBuffer::new();
                for event in events {
                    buffer.offer(Arc::clone(event));
                }
                let mut drained = 0;
                while let Some(event) = buffer.pop_ready() {
                    black_box(event);
                    drained += 1;
                }
                assert_eq!(drained, events.len());
            })
        });

        let reversed: Vec<_> = in_order.iter().rev().cloned().collect();
        group.bench_with_input(BenchmarkId::new("reversed", size), &reversed, |b, events| {
            b.iter(|| {
                let mut buffer = ReplayBuffer::new();
                for event in events {
                    buffer.offer(Arc::clone(event));
                }
                let mut drained = 0;
                while let Some(event) = buffer.pop_ready() {
                    black_box(event);
                    drained += 1;
                }
                assert_eq!(drained, events.len());
            })
        });
    }

    group.finish();
}

async fn wait_for_len<S: ChangeStream<i64> + ?Sized>(stream: &S, len: usize) {
    while stream.snapshot().await.len() != len {
        tokio::task::yield_now().await;
    }
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    let runtime = Runtime::new().unwrap();

    for size in [100, 1000] {
        group.bench_function(BenchmarkId::new("filter_sort_take_push", size), |b| {
            let (source, head) = runtime.block_on(async {
                let source = Arc::new(VersionedCollection::from_items((0..size as i64).collect()));
                let filtered = Filter::new(shared(&source), |n: &i64| n % 2 == 0).await;
                let sorted = Sort::new(shared(&filtered), |a: &i64, b: &i64| b.cmp(a)).await;
                let head = Take::first(shared(&sorted), 10).await;
                wait_for_len(&*head, 10).await;
                (source, head)
            });
            let mut next = size as i64;
            b.iter(|| {
                runtime.block_on(async {
                    next += 2;
                    let version = source.push_range(vec![next]).await;
                    black_box(version);
                    while head.snapshot().await.items().first() != Some(&next) {
                        tokio::task::yield_now().await;
                    }
                })
            })
        });
    }

    group.bench_function("filter_predicate_swap_1000", |b| {
        let (source, filtered) = runtime.block_on(async {
            let source = Arc::new(VersionedCollection::from_items((0..1000i64).collect()));
            let filtered = Filter::new(shared(&source), |n: &i64| n % 2 == 0).await;
            wait_for_len(&*filtered, 500).await;
            (source, filtered)
        });
        let mut divisor = 2i64;
        b.iter(|| {
            runtime.block_on(async {
                divisor = if divisor == 2 { 4 } else { 2 };
                let d = divisor;
                filtered.set_predicate(move |n: &i64| n % d == 0);
                wait_for_len(&*filtered, (1000 / divisor) as usize).await;
            })
        });
        black_box(source);
    });

    group.finish();
}

criterion_group!(benches, bench_replay_buffer, bench_pipeline);
criterion_main!(benches);
