#![allow(clippy::all)]

//! Guarded Invocation Benchmarks
//!
//! Per-call overhead of the engine for growing policy chains, all on the
//! success path.

use criterion::{Criterion, criterion_group, criterion_main};
use rampart::*;
use std::convert::Infallible;
use std::hint::black_box;
use std::time::Duration;

fn definitions() -> Vec<(&'static str, MethodDefinition<u64>)> {
    vec![
        ("bare", MethodDefinition::builder("Bench.bare").build()),
        (
            "retry",
            MethodDefinition::builder("Bench.retry")
                .retry(RetryConfig::new(3))
                .build(),
        ),
        (
            "timeout_retry_fallback",
            MethodDefinition::builder("Bench.trf")
                .timeout(TimeoutConfig::new(Duration::from_secs(5)))
                .retry(RetryConfig::new(3))
                .fallback(fallback_value(0))
                .build(),
        ),
        (
            "all_policies",
            MethodDefinition::builder("Bench.all")
                .timeout(TimeoutConfig::new(Duration::from_secs(5)))
                .retry(RetryConfig::new(3))
                .circuit_breaker(CircuitBreakerConfig::default())
                .bulkhead(BulkheadConfig::new(64))
                .fallback(fallback_value(0))
                .build(),
        ),
    ]
}

fn bench_invoke(c: &mut Criterion) {
    let mut group = c.benchmark_group("invoke");
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let engine = Engine::new();

    for (label, definition) in definitions() {
        // Build the descriptor outside the measured loop
        engine.descriptor(&definition).unwrap();

        group.bench_function(label, |b| {
            b.to_async(&runtime).iter(|| async {
                let value = engine
                    .invoke(&definition, |_| async { Ok::<_, Infallible>(42) })
                    .await;
                black_box(value)
            })
        });
    }

    group.finish();
}

fn bench_invoke_async(c: &mut Criterion) {
    let mut group = c.benchmark_group("invoke_async");
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let engine = Engine::new();
    let definition = MethodDefinition::<u64>::builder("Bench.async")
        .bulkhead(BulkheadConfig::new(64))
        .build();

    group.bench_function("spawn_and_await", |b| {
        b.to_async(&runtime).iter(|| async {
            let handle = engine.invoke_async(&definition, |_| async { Ok::<_, Infallible>(42) });
            black_box(handle.await)
        })
    });

    group.finish();
}

fn bench_descriptor_lookup(c: &mut Criterion) {
    let engine = Engine::new();
    let definition = MethodDefinition::<u64>::builder("Bench.lookup")
        .retry(RetryConfig::new(1))
        .build();
    engine.descriptor(&definition).unwrap();

    c.bench_function("descriptor_cached", |b| {
        b.iter(|| black_box(engine.descriptor(&definition).is_ok()))
    });
}

criterion_group!(
    pipeline_benches,
    bench_invoke,
    bench_invoke_async,
    bench_descriptor_lookup,
);

criterion_main!(pipeline_benches);
