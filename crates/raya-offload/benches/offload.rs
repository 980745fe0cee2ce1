use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use raya_offload::{
    promise, yield_now, InlineQueue, OffloadExecutor, PoolConfig, Runtime, RuntimeConfig,
    SchedulerConfig,
};
use std::sync::Arc;

fn bench_promise(c: &mut Criterion) {
    c.bench_function("promise_fulfil_then_take", |b| {
        b.iter(|| {
            let (promise, future) = promise::<u64>();
            promise.resolve(black_box(7));
            future.wait().unwrap()
        });
    });

    let executor = OffloadExecutor::new(Arc::new(InlineQueue::new()));
    c.bench_function("submit_inline", |b| {
        b.iter(|| executor.submit(|| black_box(1u64) + 1).unwrap().wait().unwrap());
    });
}

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");

    for io_threads in [1usize, 4] {
        let runtime = Runtime::new(RuntimeConfig {
            scheduler: SchedulerConfig::with_workers(2),
            io_pool: PoolConfig::with_threads(io_threads),
        })
        .unwrap();

        group.throughput(Throughput::Elements(64));
        group.bench_with_input(
            BenchmarkId::new("light_task_submit_await", io_threads),
            &io_threads,
            |b, _| {
                b.iter(|| {
                    let executor = runtime.executor();
                    runtime
                        .block_on(async move {
                            let mut total = 0u64;
                            for i in 0..64u64 {
                                total += executor.submit(move || i).unwrap().await.unwrap();
                            }
                            total
                        })
                        .unwrap()
                });
            },
        );
    }

    group.finish();
}

fn bench_scheduler(c: &mut Criterion) {
    let runtime = Runtime::new(RuntimeConfig {
        scheduler: SchedulerConfig::with_workers(2),
        io_pool: PoolConfig::with_threads(1),
    })
    .unwrap();

    c.bench_function("spawn_yield_join", |b| {
        b.iter(|| {
            let joins: Vec<_> = (0..32)
                .map(|_| runtime.spawn(async { yield_now().await }).unwrap())
                .collect();
            for join in joins {
                join.wait().unwrap();
            }
        });
    });
}

criterion_group!(benches, bench_promise, bench_round_trip, bench_scheduler);
criterion_main!(benches);
