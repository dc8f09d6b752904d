//! Registration helpers
//!
//! Every helper takes the target registry explicitly. Pass
//! [`default_registry`](crate::default_registry) for process-wide metrics,
//! or a fresh [`Registry`] to keep a set of metrics isolated (tests, or
//! several engines in one process).

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

/// Metric name prefix shared by everything this crate registers.
pub const NAMESPACE: &str = "ft";

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

/// Register a labelled integer counter, prefixed with [`NAMESPACE`].
///
/// # Examples
///
/// ```
/// use rampart_metrics::*;
/// use prometheus::Registry;
///
/// let registry = Registry::new();
/// let counter = register_counter_vec(&registry, "calls_total", "Calls", &["method"]).unwrap();
/// counter.with_label_values(&["app/Service.call"]).inc();
/// ```
pub fn register_counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    label_names: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(opts(name, help), label_names)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Register a labelled integer gauge, prefixed with [`NAMESPACE`].
pub fn register_gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    label_names: &[&str],
) -> Result<IntGaugeVec, prometheus::Error> {
    let gauge = IntGaugeVec::new(opts(name, help), label_names)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}
