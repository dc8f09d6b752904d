//! The capability every pipeline stage implements.

use crate::chain::Pipeline;
use crate::error::{BoxError, WorkPanicked};
use crate::invocation::InvocationContext;
use crate::outcome::Outcome;
use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use tracing::error;

/// Built-in fault tolerance policy kinds.
///
/// Declaration order is outermost first, which is also the fixed order the
/// chain builder enforces between built-ins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum PolicyKind {
    Fallback,
    Retry,
    CircuitBreaker,
    Timeout,
    Bulkhead,
}

impl PolicyKind {
    /// All kinds, outermost first.
    pub const ALL: [PolicyKind; 5] = [
        PolicyKind::Fallback,
        PolicyKind::Retry,
        PolicyKind::CircuitBreaker,
        PolicyKind::Timeout,
        PolicyKind::Bulkhead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fallback => "Fallback",
            Self::Retry => "Retry",
            Self::CircuitBreaker => "CircuitBreaker",
            Self::Timeout => "Timeout",
            Self::Bulkhead => "Bulkhead",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PolicyKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown policy kind: {}", s))
    }
}

/// The guarded unit of work, type-erased.
pub type Work<T> =
    Arc<dyn Fn(InvocationContext) -> BoxFuture<'static, Result<T, BoxError>> + Send + Sync>;

/// Erase a work closure into a [`Work`].
pub fn work_fn<T, F, Fut, E>(f: F) -> Work<T>
where
    T: Send + 'static,
    F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<BoxError>,
{
    Arc::new(move |ctx: InvocationContext| -> BoxFuture<'static, Result<T, BoxError>> {
        let fut = f(ctx);
        Box::pin(async move { fut.await.map_err(Into::into) })
    })
}

/// A resilience rule wrapped around the rest of the pipeline.
///
/// Each stage receives the call context and a [`Next`] for everything
/// inside it. A stage decides whether to run `next` (zero, one or many
/// times) and what outcome to hand back outward.
#[async_trait]
pub trait Policy<T>: Send + Sync {
    /// Name used in logs and pipeline listings.
    fn name(&self) -> &str;

    async fn guard(&self, ctx: InvocationContext, next: Next<T>) -> Outcome<T>;
}

/// The inner part of a pipeline, starting at one stage.
///
/// Cheap to clone; running it twice re-runs every inner stage, which is how
/// retries re-drive admission and timeouts.
pub struct Next<T> {
    pipeline: Arc<Pipeline<T>>,
    position: usize,
    work: Work<T>,
}

impl<T> Clone for Next<T> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            position: self.position,
            work: self.work.clone(),
        }
    }
}

impl<T: Send + 'static> Next<T> {
    pub(crate) fn new(pipeline: Arc<Pipeline<T>>, work: Work<T>) -> Self {
        Self {
            pipeline,
            position: 0,
            work,
        }
    }

    /// Run the remaining stages and finally the work.
    pub fn run(&self, ctx: InvocationContext) -> BoxFuture<'static, Outcome<T>> {
        match self.pipeline.policy_at(self.position) {
            Some(policy) => {
                let next = Self {
                    pipeline: self.pipeline.clone(),
                    position: self.position + 1,
                    work: self.work.clone(),
                };
                Box::pin(async move { policy.guard(ctx, next).await })
            }
            None => {
                let work = self.work.clone();
                Box::pin(async move {
                    let execution = ctx.record_execution();
                    let method = ctx.method().clone();
                    match AssertUnwindSafe(work(ctx)).catch_unwind().await {
                        Ok(Ok(value)) => Outcome::Success(value),
                        Ok(Err(e)) => Outcome::Failure(e),
                        Err(payload) => {
                            let panicked = WorkPanicked::from_payload(payload);
                            error!(method = %method, execution, error = %panicked, "Guarded work panicked");
                            Outcome::Failure(Box::new(panicked))
                        }
                    }
                })
            }
        }
    }

    /// Stages still ahead, for diagnostics.
    pub fn remaining(&self) -> usize {
        self.pipeline.len().saturating_sub(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_kind_order_is_canonical() {
        let mut kinds = vec![
            PolicyKind::Bulkhead,
            PolicyKind::Fallback,
            PolicyKind::Timeout,
            PolicyKind::CircuitBreaker,
            PolicyKind::Retry,
        ];
        kinds.sort();
        assert_eq!(kinds, PolicyKind::ALL.to_vec());
    }

    #[test]
    fn test_policy_kind_from_str() {
        assert_eq!("circuitbreaker".parse::<PolicyKind>(), Ok(PolicyKind::CircuitBreaker));
        assert_eq!("Timeout".parse::<PolicyKind>(), Ok(PolicyKind::Timeout));
        assert!("Cache".parse::<PolicyKind>().is_err());
    }
}
