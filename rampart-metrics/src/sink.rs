//! Prometheus-backed [`MetricsSink`].

use crate::registry::{register_counter_vec, register_gauge_vec};
use prometheus::{IntCounterVec, IntGaugeVec, Registry};
use rampart_core::{CircuitState, GuardedMethodDescriptor, MethodId, MetricKind, MetricsSink};

/// Numeric encoding of [`CircuitState`] for the `ft_circuit_state` gauge.
pub fn circuit_state_value(state: CircuitState) -> i64 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::Open => 1,
        CircuitState::HalfOpen => 2,
    }
}

/// Fault tolerance counters and gauges, labelled by method.
///
/// | metric | labels |
/// |---|---|
/// | `ft_invocations_total` | `method` |
/// | `ft_outcomes_total` | `method`, `outcome` |
/// | `ft_retries_total` | `method` |
/// | `ft_circuit_transitions_total` | `method`, `state` |
/// | `ft_circuit_state` | `method` |
/// | `ft_bulkhead_active` / `ft_bulkhead_queued` | `method` |
///
/// The `method` label is the [`MethodId`] display form, `application/name`.
#[derive(Clone)]
pub struct PrometheusMetrics {
    invocations: IntCounterVec,
    outcomes: IntCounterVec,
    retries: IntCounterVec,
    transitions: IntCounterVec,
    circuit_state: IntGaugeVec,
    bulkhead_active: IntGaugeVec,
    bulkhead_queued: IntGaugeVec,
}

impl PrometheusMetrics {
    /// Register the metric families with `registry`.
    ///
    /// Fails with `AlreadyReg` when the registry already holds them, so
    /// register once per registry and share the sink.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let sink = Self {
            invocations: register_counter_vec(
                registry,
                "invocations_total",
                "Guarded method invocations",
                &["method"],
            )?,
            outcomes: register_counter_vec(
                registry,
                "outcomes_total",
                "Guarded method outcomes by kind",
                &["method", "outcome"],
            )?,
            retries: register_counter_vec(
                registry,
                "retries_total",
                "Retry attempts beyond the first execution",
                &["method"],
            )?,
            transitions: register_counter_vec(
                registry,
                "circuit_transitions_total",
                "Circuit breaker state transitions by target state",
                &["method", "state"],
            )?,
            circuit_state: register_gauge_vec(
                registry,
                "circuit_state",
                "Current circuit state (0 closed, 1 open, 2 half-open)",
                &["method"],
            )?,
            bulkhead_active: register_gauge_vec(
                registry,
                "bulkhead_active",
                "Executions currently holding a bulkhead permit",
                &["method"],
            )?,
            bulkhead_queued: register_gauge_vec(
                registry,
                "bulkhead_queued",
                "Executions waiting in the bulkhead queue",
                &["method"],
            )?,
        };
        tracing::debug!("Registered fault tolerance metrics");
        Ok(sink)
    }

    /// Register with the crate's [default registry](crate::default_registry).
    pub fn register_default() -> Result<Self, prometheus::Error> {
        Self::register(crate::default_registry())
    }

    /// Copy the live state of a descriptor's stateful policies into gauges.
    ///
    /// Call before scraping; counters are updated on every event but bulkhead
    /// occupancy is only sampled here.
    pub fn observe<T: Send + 'static>(&self, descriptor: &GuardedMethodDescriptor<T>) {
        let method = descriptor.id().to_string();
        if let Some(breaker) = descriptor.circuit_breaker() {
            self.circuit_state
                .with_label_values(&[method.as_str()])
                .set(circuit_state_value(breaker.state()));
        }
        if let Some(bulkhead) = descriptor.bulkhead() {
            self.bulkhead_active
                .with_label_values(&[method.as_str()])
                .set(i64::from(bulkhead.active_count()));
            self.bulkhead_queued
                .with_label_values(&[method.as_str()])
                .set(i64::from(bulkhead.queued_count()));
        }
    }

    pub fn invocations(&self, method: &MethodId) -> u64 {
        self.invocations
            .with_label_values(&[method.to_string().as_str()])
            .get()
    }

    pub fn outcomes(&self, method: &MethodId, kind: MetricKind) -> u64 {
        self.outcomes
            .with_label_values(&[method.to_string().as_str(), kind.as_str()])
            .get()
    }

    pub fn retries(&self, method: &MethodId) -> u64 {
        self.retries
            .with_label_values(&[method.to_string().as_str()])
            .get()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_invocation(&self, method: &MethodId) {
        self.invocations
            .with_label_values(&[method.to_string().as_str()])
            .inc();
    }

    fn record_outcome(&self, method: &MethodId, kind: MetricKind) {
        self.outcomes
            .with_label_values(&[method.to_string().as_str(), kind.as_str()])
            .inc();
    }

    fn record_retry(&self, method: &MethodId) {
        self.retries
            .with_label_values(&[method.to_string().as_str()])
            .inc();
    }

    fn record_circuit_transition(&self, method: &MethodId, state: CircuitState) {
        let method = method.to_string();
        let label = match state {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        self.transitions
            .with_label_values(&[method.as_str(), label])
            .inc();
        self.circuit_state
            .with_label_values(&[method.as_str()])
            .set(circuit_state_value(state));
    }
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}
