//! # Fault Tolerance Policies
//!
//! The built-in pipeline stages.
//!
//! ## Policies Included
//!
//! - **Fallback**: Substitute a result when the guarded call does not succeed
//! - **Retry**: Re-run the inner stages with delays and backoff
//! - **Circuit Breaker**: Fail fast after a high failure ratio, probe for recovery
//! - **Timeout**: Bound each attempt, abandoning slow work
//! - **Bulkhead**: Limit concurrent executions, queueing asynchronous calls
//!
//! Circuit breakers and bulkheads keep state shared by every caller of the
//! same guarded method; the other policies are stateless between calls.

mod bulkhead;
mod circuit_breaker;
mod fallback;
mod retry;
mod timeout;

pub use bulkhead::*;
pub use circuit_breaker::*;
pub use fallback::*;
pub use retry::*;
pub use timeout::*;

use crate::clock::Clock;
use crate::descriptor::MethodId;
use crate::metrics::MetricsSink;
use std::fmt;
use std::sync::Arc;

/// Collaborators a policy needs: the method it guards, the time source and
/// the metrics sink.
#[derive(Clone)]
pub struct PolicyEnv {
    pub method: MethodId,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl fmt::Debug for PolicyEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyEnv")
            .field("method", &self.method)
            .field("clock", &self.clock)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::arguments::Arguments;
    use crate::chain::{ChainBuilder, PriorityOverrides};
    use crate::clock::TokioClock;
    use crate::error::BoxError;
    use crate::invocation::{ExecutionMode, InvocationContext};
    use crate::metrics::NoopMetrics;
    use crate::outcome::Outcome;
    use crate::policy::{Next, Policy, work_fn};
    use std::future::Future;

    pub(crate) fn env() -> PolicyEnv {
        PolicyEnv {
            method: MethodId::new("tests", "Service.call"),
            clock: Arc::new(TokioClock),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub(crate) fn context(mode: ExecutionMode) -> InvocationContext {
        InvocationContext::new(MethodId::new("tests", "Service.call"), mode, Arguments::new())
    }

    /// Run `work` behind a single policy, synchronously.
    pub(crate) async fn run_single<T, P, F, Fut, E>(
        policy: P,
        work: F,
    ) -> (Outcome<T>, InvocationContext)
    where
        T: Send + 'static,
        P: Policy<T> + 'static,
        F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let policy: Arc<dyn Policy<T>> = Arc::new(policy);
        run_chain(vec![policy], context(ExecutionMode::Synchronous), work).await
    }

    /// Run `work` behind policies given outermost first.
    pub(crate) async fn run_chain<T, F, Fut, E>(
        policies: Vec<Arc<dyn Policy<T>>>,
        ctx: InvocationContext,
        work: F,
    ) -> (Outcome<T>, InvocationContext)
    where
        T: Send + 'static,
        F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let mut builder = ChainBuilder::new(PriorityOverrides::default());
        for (i, policy) in policies.into_iter().enumerate() {
            builder = builder.custom(format!("stage-{}", i), 0, policy);
        }
        let pipeline = Arc::new(builder.build().expect("valid test pipeline"));
        let outcome = Next::new(pipeline, work_fn(work)).run(ctx.clone()).await;
        (outcome, ctx)
    }
}
