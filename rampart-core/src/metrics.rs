//! Metrics sink consumed by the engine and policies.
//!
//! The engine records one invocation and exactly one terminal kind
//! (success, failure, timeout, circuit rejection or bulkhead rejection) per
//! call, plus `FallbackCalled` when a fallback handler ran. Retry and
//! circuit breaker policies report their own events through the optional
//! hooks.

use crate::descriptor::MethodId;
use crate::outcome::OutcomeKind;
use crate::resilience::CircuitState;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counted outcome categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Success,
    Failure,
    Timeout,
    CircuitRejected,
    BulkheadRejected,
    FallbackCalled,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::CircuitRejected => "circuit_rejected",
            Self::BulkheadRejected => "bulkhead_rejected",
            Self::FallbackCalled => "fallback_called",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<OutcomeKind> for MetricKind {
    fn from(kind: OutcomeKind) -> Self {
        match kind {
            OutcomeKind::Success => Self::Success,
            OutcomeKind::Failure => Self::Failure,
            OutcomeKind::TimedOut => Self::Timeout,
            OutcomeKind::CircuitOpenRejected => Self::CircuitRejected,
            OutcomeKind::BulkheadRejected => Self::BulkheadRejected,
        }
    }
}

/// Receiver of per-method fault tolerance events.
///
/// Shared by every guarded method of an engine, so implementations must be
/// safe to call concurrently.
pub trait MetricsSink: Send + Sync {
    fn record_invocation(&self, method: &MethodId);

    fn record_outcome(&self, method: &MethodId, kind: MetricKind);

    /// A retry policy is about to re-run the inner stages.
    fn record_retry(&self, _method: &MethodId) {}

    /// A circuit breaker changed phase.
    fn record_circuit_transition(&self, _method: &MethodId, _state: CircuitState) {}
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_invocation(&self, _method: &MethodId) {}

    fn record_outcome(&self, _method: &MethodId, _kind: MetricKind) {}
}

#[derive(Debug, Default)]
struct MethodCounters {
    invocations: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    circuit_rejections: AtomicU64,
    bulkhead_rejections: AtomicU64,
    fallback_calls: AtomicU64,
    retries: AtomicU64,
    circuit_opened: AtomicU64,
}

impl MethodCounters {
    fn counter(&self, kind: MetricKind) -> &AtomicU64 {
        match kind {
            MetricKind::Success => &self.successes,
            MetricKind::Failure => &self.failures,
            MetricKind::Timeout => &self.timeouts,
            MetricKind::CircuitRejected => &self.circuit_rejections,
            MetricKind::BulkheadRejected => &self.bulkhead_rejections,
            MetricKind::FallbackCalled => &self.fallback_calls,
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            invocations: self.invocations.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            bulkhead_rejections: self.bulkhead_rejections.load(Ordering::Relaxed),
            fallback_calls: self.fallback_calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            circuit_opened: self.circuit_opened.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters of one guarded method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub circuit_rejections: u64,
    pub bulkhead_rejections: u64,
    pub fallback_calls: u64,
    pub retries: u64,
    pub circuit_opened: u64,
}

impl MetricsSnapshot {
    /// Sum of the terminal outcome counters.
    pub fn terminal_outcomes(&self) -> u64 {
        self.successes
            + self.failures
            + self.timeouts
            + self.circuit_rejections
            + self.bulkhead_rejections
    }
}

/// Atomic in-process counters, queryable per method.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    methods: RwLock<HashMap<MethodId, Arc<MethodCounters>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, method: &MethodId) -> Arc<MethodCounters> {
        if let Some(counters) = self.methods.read().get(method) {
            return counters.clone();
        }
        self.methods
            .write()
            .entry(method.clone())
            .or_default()
            .clone()
    }

    pub fn snapshot(&self, method: &MethodId) -> MetricsSnapshot {
        self.methods
            .read()
            .get(method)
            .map(|counters| counters.snapshot())
            .unwrap_or_default()
    }

    /// Snapshots of every method seen so far.
    pub fn snapshots(&self) -> HashMap<MethodId, MetricsSnapshot> {
        self.methods
            .read()
            .iter()
            .map(|(id, counters)| (id.clone(), counters.snapshot()))
            .collect()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_invocation(&self, method: &MethodId) {
        self.counters(method)
            .invocations
            .fetch_add(1, Ordering::Relaxed);
    }

    fn record_outcome(&self, method: &MethodId, kind: MetricKind) {
        self.counters(method)
            .counter(kind)
            .fetch_add(1, Ordering::Relaxed);
    }

    fn record_retry(&self, method: &MethodId) {
        self.counters(method).retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_circuit_transition(&self, method: &MethodId, state: CircuitState) {
        if state == CircuitState::Open {
            self.counters(method)
                .circuit_opened
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}
