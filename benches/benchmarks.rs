use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use async_wait::*;

/// Completes every attempt before returning, so the benchmark
/// measures the stage's own bookkeeping.
struct Immediate;

impl AsyncFunction<u64, u64> for Immediate {
    fn async_invoke(&self, input: &u64, result: ResultFuture<u64>) {
        result.complete(vec![input * 2]);
    }
}

fn run(mode: OutputMode, capacity: usize, records: u64) -> usize {
    let config = AsyncWaitConfig::new("bench", mode).with_capacity(capacity);
    let mut op = AsyncWaitBuilder::new(config)
        .build(Immediate, CollectingOutput::new())
        .unwrap();
    for n in 0..records {
        op.process_element(StreamRecord::new(n)).unwrap();
    }
    op.finish().unwrap();
    op.output().len()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    const RECORDS: u64 = 10_000;

    let mut group = c.benchmark_group("async_wait");
    group.throughput(Throughput::Elements(RECORDS));
    for capacity in [1, 100] {
        group.bench_with_input(BenchmarkId::new("ordered", capacity), &capacity, |b, &cap| {
            b.iter(|| run(OutputMode::Ordered, cap, RECORDS));
        });
        group.bench_with_input(BenchmarkId::new("unordered", capacity), &capacity, |b, &cap| {
            b.iter(|| run(OutputMode::Unordered, cap, RECORDS));
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
