#![allow(clippy::all)]

//! Resilience Policy Benchmarks
//!
//! Hot paths of the stateful policies: circuit admission and recording,
//! bulkhead admission, backoff computation.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rampart::*;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Circuit Breaker Benchmarks
// =============================================================================

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());

    group.bench_function("create_default", |b| {
        b.iter(|| CircuitBreaker::new("bench", CircuitBreakerConfig::default(), clock.clone()))
    });

    let cb = CircuitBreaker::new("bench", CircuitBreakerConfig::default(), clock.clone());

    group.bench_function("state_check", |b| b.iter(|| black_box(cb.state())));

    group.bench_function("acquire_record_success", |b| {
        b.iter(|| {
            if let Some((permit, _)) = cb.try_acquire() {
                black_box(permit.record(false));
            }
        })
    });

    group.bench_function("acquire_record_failure", |b| {
        b.iter_batched(
            || {
                CircuitBreaker::new(
                    "bench",
                    CircuitBreakerConfig::new().request_volume_threshold(1_000),
                    clock.clone(),
                )
            },
            |cb| {
                if let Some((permit, _)) = cb.try_acquire() {
                    black_box(permit.record(true));
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });

    let open = CircuitBreaker::new("bench", CircuitBreakerConfig::default(), clock);
    open.force_open();
    group.bench_function("reject_while_open", |b| {
        b.iter(|| black_box(open.try_acquire().is_none()))
    });

    group.finish();
}

// =============================================================================
// Retry Benchmarks
// =============================================================================

fn bench_retry(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry");

    group.bench_function("config_default", |b| b.iter(RetryConfig::default));

    let backoff = BackoffStrategy::exponential(Duration::from_millis(10))
        .with_max(Duration::from_secs(5));
    for retry in [1, 3, 5, 10] {
        group.bench_with_input(
            BenchmarkId::new("delay_for_retry", retry),
            &retry,
            |b, &retry| b.iter(|| backoff.delay_for_retry(black_box(retry))),
        );
    }

    group.finish();
}

// =============================================================================
// Bulkhead Benchmarks
// =============================================================================

fn bench_bulkhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulkhead");

    group.bench_function("create", |b| {
        b.iter(|| Bulkhead::new("bench", BulkheadConfig::new(10)))
    });

    let bulkhead = Bulkhead::new("bench", BulkheadConfig::new(100));
    group.bench_function("stats", |b| b.iter(|| black_box(bulkhead.stats())));

    for concurrency in [1, 10, 100] {
        let bulkhead = Bulkhead::new("bench", BulkheadConfig::new(concurrency));
        group.bench_with_input(
            BenchmarkId::new("try_admit_release", concurrency),
            &concurrency,
            |b, _| b.iter(|| black_box(bulkhead.try_admit())),
        );
    }

    let full = Bulkhead::new("bench", BulkheadConfig::new(1).queue_capacity(0));
    let _held = full.try_admit();
    group.bench_function("reject_when_full", |b| {
        b.iter(|| black_box(full.try_admit().is_none()))
    });

    group.finish();
}

criterion_group!(
    resilience_benches,
    bench_circuit_breaker,
    bench_retry,
    bench_bulkhead,
);

criterion_main!(resilience_benches);
