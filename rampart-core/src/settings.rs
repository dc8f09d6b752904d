//! Process-wide fault tolerance settings.
//!
//! Settings override what a [`MethodDefinition`](crate::MethodDefinition)
//! declares in code. They are applied once, when a method's descriptor is
//! built, never per call. For every parameter the most specific value wins:
//! the method's own entry, then the global defaults, then the declaration.
//!
//! `rampart-config` fills this structure from property files, JSON/TOML files
//! and the environment.

use crate::chain::PriorityOverrides;
use crate::policy::PolicyKind;
use crate::resilience::{
    BackoffStrategy, BulkheadConfig, CircuitBreakerConfig, MaxRetries, RetryConfig, TimeoutConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Timeout overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutParameters {
    pub enabled: Option<bool>,
    pub value_ms: Option<u64>,
}

impl TimeoutParameters {
    fn apply(&self, config: &mut TimeoutConfig) {
        if let Some(ms) = self.value_ms {
            config.duration = Duration::from_millis(ms);
        }
    }
}

/// Retry overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryParameters {
    pub enabled: Option<bool>,
    /// Negative means unlimited.
    pub max_retries: Option<i32>,
    pub delay_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
}

impl RetryParameters {
    fn apply(&self, config: &mut RetryConfig) {
        if let Some(max) = self.max_retries {
            config.max_retries = MaxRetries::from(max);
        }
        if let Some(ms) = self.delay_ms {
            config.backoff = BackoffStrategy::Constant(Duration::from_millis(ms));
        }
        if let Some(ms) = self.max_duration_ms {
            config.max_duration = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = self.jitter_ms {
            config.jitter = Duration::from_millis(ms);
        }
    }
}

/// Circuit breaker overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerParameters {
    pub enabled: Option<bool>,
    pub request_volume_threshold: Option<u32>,
    pub failure_ratio: Option<f64>,
    pub delay_ms: Option<u64>,
    pub success_threshold: Option<u32>,
}

impl CircuitBreakerParameters {
    fn apply(&self, config: &mut CircuitBreakerConfig) {
        if let Some(threshold) = self.request_volume_threshold {
            config.request_volume_threshold = threshold;
        }
        if let Some(ratio) = self.failure_ratio {
            config.failure_ratio = ratio;
        }
        if let Some(ms) = self.delay_ms {
            config.delay = Duration::from_millis(ms);
        }
        if let Some(threshold) = self.success_threshold {
            config.success_threshold = threshold;
        }
    }
}

/// Bulkhead overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadParameters {
    pub enabled: Option<bool>,
    /// Maximum concurrent executions.
    pub value: Option<u32>,
    pub waiting_task_queue: Option<u32>,
}

impl BulkheadParameters {
    fn apply(&self, config: &mut BulkheadConfig) {
        if let Some(value) = self.value {
            config.max_concurrent = value;
        }
        if let Some(queue) = self.waiting_task_queue {
            config.queue_capacity = queue;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackParameters {
    pub enabled: Option<bool>,
}

/// Overrides for every policy kind, either global or for one method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyParameters {
    pub timeout: TimeoutParameters,
    pub retry: RetryParameters,
    pub circuit_breaker: CircuitBreakerParameters,
    pub bulkhead: BulkheadParameters,
    pub fallback: FallbackParameters,
}

impl PolicyParameters {
    pub fn enabled(&self, kind: PolicyKind) -> Option<bool> {
        match kind {
            PolicyKind::Timeout => self.timeout.enabled,
            PolicyKind::Retry => self.retry.enabled,
            PolicyKind::CircuitBreaker => self.circuit_breaker.enabled,
            PolicyKind::Bulkhead => self.bulkhead.enabled,
            PolicyKind::Fallback => self.fallback.enabled,
        }
    }

    pub fn set_enabled(&mut self, kind: PolicyKind, enabled: bool) {
        let slot = match kind {
            PolicyKind::Timeout => &mut self.timeout.enabled,
            PolicyKind::Retry => &mut self.retry.enabled,
            PolicyKind::CircuitBreaker => &mut self.circuit_breaker.enabled,
            PolicyKind::Bulkhead => &mut self.bulkhead.enabled,
            PolicyKind::Fallback => &mut self.fallback.enabled,
        };
        *slot = Some(enabled);
    }
}

/// Overrides applied when descriptors are built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultToleranceSettings {
    /// Priority of the built-in policy block.
    pub interceptor_priority: Option<i32>,
    /// Per-kind priorities.
    pub priorities: BTreeMap<PolicyKind, i32>,
    /// When false, every policy except Fallback is left out of pipelines
    /// unless re-enabled explicitly.
    pub non_fallback_enabled: bool,
    pub defaults: PolicyParameters,
    /// Keyed by method name.
    pub methods: BTreeMap<String, PolicyParameters>,
}

impl Default for FaultToleranceSettings {
    fn default() -> Self {
        Self {
            interceptor_priority: None,
            priorities: BTreeMap::new(),
            non_fallback_enabled: true,
            defaults: PolicyParameters::default(),
            methods: BTreeMap::new(),
        }
    }
}

impl FaultToleranceSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority_overrides(&self) -> PriorityOverrides {
        PriorityOverrides {
            fault_tolerance: self.interceptor_priority,
            per_kind: self.priorities.clone(),
        }
    }

    /// Parameters for `method`, created on first access.
    pub fn method_mut(&mut self, method: impl Into<String>) -> &mut PolicyParameters {
        self.methods.entry(method.into()).or_default()
    }

    /// Whether a declared policy of `kind` on `method` takes part in its
    /// pipeline.
    pub fn is_enabled(&self, method: &str, kind: PolicyKind) -> bool {
        self.methods
            .get(method)
            .and_then(|params| params.enabled(kind))
            .or_else(|| self.defaults.enabled(kind))
            .unwrap_or(kind == PolicyKind::Fallback || self.non_fallback_enabled)
    }

    fn layers<'a>(&'a self, method: &str) -> impl Iterator<Item = &'a PolicyParameters> {
        std::iter::once(&self.defaults).chain(self.methods.get(method))
    }

    pub fn timeout(&self, method: &str, mut config: TimeoutConfig) -> TimeoutConfig {
        self.layers(method).for_each(|p| p.timeout.apply(&mut config));
        config
    }

    pub fn retry(&self, method: &str, mut config: RetryConfig) -> RetryConfig {
        self.layers(method).for_each(|p| p.retry.apply(&mut config));
        config
    }

    pub fn circuit_breaker(
        &self,
        method: &str,
        mut config: CircuitBreakerConfig,
    ) -> CircuitBreakerConfig {
        self.layers(method)
            .for_each(|p| p.circuit_breaker.apply(&mut config));
        config
    }

    pub fn bulkhead(&self, method: &str, mut config: BulkheadConfig) -> BulkheadConfig {
        self.layers(method).for_each(|p| p.bulkhead.apply(&mut config));
        config
    }
}
