// Rampart - fault tolerance policies for async Rust
//
// Guarded methods are wrapped in a priority-ordered chain of interceptors and
// built-in policies (fallback, retry, circuit breaker, timeout, bulkhead)
// and executed by an `Engine`, synchronously or on a spawned task.

// Re-export core functionality
pub use rampart_core::*;

// Re-export optional crates
#[cfg(feature = "config")]
pub use rampart_config;

#[cfg(feature = "metrics")]
pub use rampart_metrics;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        BoxError,
        BulkheadConfig,
        CircuitBreakerConfig,
        Engine,
        Fallback,
        FallbackContext,
        FaultToleranceError,
        FaultToleranceSettings,
        InvocationContext,
        InvocationHandle,
        MethodDefinition,
        RetryConfig,
        TimeoutConfig,
        fallback_default,
        fallback_value,
    };

    pub use crate::{Interceptor, MetricsSink, Policy, StateSharing};
}
