//! 🏎️ Accumulator benchmarks: how expensive is it to keep a batch and turn it into a payload?
//!
//! Run with `cargo bench -p bulkx`. The processor bench pushes ops through a real processor
//! backed by the in-memory transport, so it measures hand-off and commit overhead, not HTTP.

use std::hint::black_box;
use std::sync::Arc;

use bulkx::{
    BatchAccumulator, BulkOperation, BulkProcessorBuilder, BulkTarget, InMemoryTransport, SharedRequest,
};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

fn ops(count: usize) -> Vec<SharedRequest> {
    (0..count)
        .map(|n| {
            Arc::new(
                BulkOperation::index(format!(
                    r#"{{"n":{n},"message":"the quick brown fox jumps over the lazy dog","level":"info"}}"#
                ))
                .id(n.to_string()),
            ) as SharedRequest
        })
        .collect()
}

fn bench_estimated_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("estimated_size");
    for count in [100, 1_000, 10_000] {
        let batch = ops(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &batch, |b, batch| {
            b.iter(|| {
                // 📏 the worker asks after every append; memoization keeps this linear
                let mut accumulator = BatchAccumulator::new(Arc::new(BulkTarget::default()));
                for request in batch {
                    accumulator.append(Arc::clone(request));
                    black_box(accumulator.estimated_size());
                }
            })
        });
    }
    group.finish();
}

fn bench_payload(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload");
    for count in [100, 1_000, 10_000] {
        let mut accumulator = BatchAccumulator::new(Arc::new(BulkTarget::default()));
        for request in ops(count) {
            accumulator.append(request);
        }
        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(BenchmarkId::from_parameter(count), |b| {
            b.iter(|| black_box(accumulator.payload()))
        });
    }
    group.finish();
}

fn bench_processor(c: &mut Criterion) {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => panic!("💀 no tokio runtime, no benchmark: {err}"),
    };
    let mut group = c.benchmark_group("processor");
    let count = 10_000;
    group.throughput(Throughput::Elements(count as u64));
    for workers in [1, 4] {
        group.bench_function(BenchmarkId::new("add_then_stop", workers), |b| {
            b.to_async(&runtime).iter(|| async move {
                let processor = BulkProcessorBuilder::new(Arc::new(InMemoryTransport::new()))
                    .workers(workers)
                    .bulk_actions(1_000)
                    .start()
                    .await?;
                for request in ops(count) {
                    processor.add_shared(request).await?;
                }
                processor.stop().await
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_estimated_size, bench_payload, bench_processor);
criterion_main!(benches);
