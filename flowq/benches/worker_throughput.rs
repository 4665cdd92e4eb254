//! Worker throughput benchmarks.
//!
//! Drains a pre-filled queue with a [`Worker`] at different concurrency
//! levels and measures jobs per second end to end.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use flowq::*;
use serde_json::{Value, json};
use tokio::runtime::Runtime;

const JOBS: usize = 200;

async fn drain_with_worker(concurrency: usize) {
    let queue = Queue::new("throughput", Arc::new(MemoryStore::new()), QueueConfig::default());
    let jobs = (0..JOBS)
        .map(|i| ("bench".to_string(), json!({ "n": i }), JobOptions::new()))
        .collect();
    queue.add_bulk(jobs).await.expect("bulk add should succeed");

    let worker = Worker::new(
        queue.clone(),
        |_ctx: JobContext<MemoryStore>| async move {
            tokio::task::yield_now().await;
            Ok::<Value, anyhow::Error>(Value::Null)
        },
        WorkerConfig::new("bench")
            .with_concurrency(concurrency)
            .with_drain_delay(10)
            .with_skip_stalled_check(true),
    )
    .expect("worker config should be valid");
    worker.start().await.expect("worker should start");

    loop {
        let counts = queue.get_job_counts().await.expect("counts");
        if counts.completed >= JOBS {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    worker.close(false).await.expect("worker should close");
}

fn bench_worker_drain(c: &mut Criterion) {
    let rt = Runtime::new().expect("Failed to create tokio runtime");

    let mut group = c.benchmark_group("worker_drain");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(20));
    group.throughput(Throughput::Elements(JOBS as u64));

    for concurrency in [1, 4, 16] {
        group.bench_with_input(
            BenchmarkId::new("concurrency", concurrency),
            &concurrency,
            |b, &concurrency| {
                b.to_async(&rt).iter(|| drain_with_worker(concurrency));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_worker_drain);
criterion_main!(benches);
