//! Prometheus metrics for the rampart fault tolerance engine
//!
//! [`PrometheusMetrics`] implements [`rampart_core::MetricsSink`] on top of a
//! set of labelled counters, so every guarded call an [`Engine`] runs shows
//! up in the Prometheus text exposition.
//!
//! # Quick Start
//!
//! ```no_run
//! use rampart_core::Engine;
//! use rampart_metrics::*;
//! use std::sync::Arc;
//!
//! let sink = PrometheusMetrics::register(default_registry()).unwrap();
//! let engine = Engine::builder().metrics(Arc::new(sink)).build();
//!
//! // Serve this from a /metrics endpoint
//! let metrics_text = export_metrics();
//! ```
//!
//! [`Engine`]: rampart_core::Engine

pub mod registry;
pub mod sink;

pub use prometheus;
pub use registry::*;
pub use sink::*;

use once_cell::sync::Lazy;
use prometheus::{Encoder, Registry, TextEncoder};

/// Global default registry
static DEFAULT_REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();

    // process_collector reads procfs
    #[cfg(target_os = "linux")]
    {
        if let Err(e) = registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        )) {
            tracing::warn!("Failed to register process collector: {}", e);
        }
    }

    registry
});

/// Get the default metrics registry
pub fn default_registry() -> &'static Registry {
    &DEFAULT_REGISTRY
}

/// Export everything in the default registry as Prometheus text format
pub fn export_metrics() -> String {
    export_metrics_from_registry(&DEFAULT_REGISTRY)
}

/// Export metrics from a specific registry
///
/// # Examples
///
/// ```
/// use rampart_metrics::*;
/// use prometheus::Registry;
///
/// let registry = Registry::new();
/// let text = export_metrics_from_registry(&registry);
/// assert!(text.is_empty());
/// ```
pub fn export_metrics_from_registry(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|_| String::from("# Error converting metrics to UTF-8\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_is_shared() {
        assert!(std::ptr::eq(default_registry(), default_registry()));
        let _ = default_registry().gather();
    }

    #[test]
    fn test_export_empty_registry() {
        let registry = Registry::new();
        assert_eq!(export_metrics_from_registry(&registry), "");
    }
}
