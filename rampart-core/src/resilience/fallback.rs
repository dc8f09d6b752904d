//! Fallback for graceful degradation.
//!
//! The outermost built-in stage. When the rest of the pipeline does not
//! succeed, the handler is called once with the invocation (arguments
//! included) and the error the caller would otherwise have seen. Its `Ok`
//! becomes the call's result; its `Err` surfaces as a fallback failure.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rampart::{Fallback, FaultToleranceError};
//!
//! let fallback = Fallback::new(|ctx| async move {
//!     match ctx.cause {
//!         FaultToleranceError::TimeoutExceeded(_) => Ok("cached".to_string()),
//!         _ => Ok("default".to_string()),
//!     }
//! });
//! ```

use crate::error::{BoxError, FaultToleranceError, WorkPanicked};
use crate::invocation::InvocationContext;
use crate::outcome::{FailureMatcher, Outcome, OutcomeKind};
use crate::policy::{Next, Policy, PolicyKind};
use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{Instrument, debug, error, warn};

/// What the fallback handler gets to see.
#[derive(Debug)]
pub struct FallbackContext {
    /// The guarded invocation, including its arguments.
    pub invocation: InvocationContext,
    /// The error the call would have failed with.
    pub cause: FaultToleranceError,
}

/// Type alias for an async fallback handler.
pub type FallbackFn<T> =
    Arc<dyn Fn(FallbackContext) -> BoxFuture<'static, Result<T, BoxError>> + Send + Sync>;

/// Fallback handler plus the rules deciding when it applies.
pub struct Fallback<T> {
    handler: FallbackFn<T>,
    apply_on: FailureMatcher,
    skip_on: FailureMatcher,
}

impl<T: Send + 'static> Fallback<T> {
    /// Create a fallback from an async handler.
    pub fn new<F, Fut, E>(handler: F) -> Self
    where
        F: Fn(FallbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let handler: FallbackFn<T> =
            Arc::new(move |ctx: FallbackContext| -> BoxFuture<'static, Result<T, BoxError>> {
                let fut = handler(ctx);
                Box::pin(async move { fut.await.map_err(Into::into) })
            });
        Self {
            handler,
            apply_on: FailureMatcher::any(),
            skip_on: FailureMatcher::never(),
        }
    }

    /// Outcomes the handler applies to. Defaults to any non-success.
    pub fn apply_on(mut self, matcher: FailureMatcher) -> Self {
        self.apply_on = matcher;
        self
    }

    /// Outcomes that pass through even when `apply_on` matches.
    pub fn skip_on(mut self, matcher: FailureMatcher) -> Self {
        self.skip_on = matcher;
        self
    }

    pub fn applies_to(&self, outcome: &Outcome<T>) -> bool {
        self.apply_on.matches(outcome) && !self.skip_on.matches(outcome)
    }

    pub(crate) fn call(&self, ctx: FallbackContext) -> BoxFuture<'static, Result<T, BoxError>> {
        (self.handler)(ctx)
    }
}

impl<T> Clone for Fallback<T> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            apply_on: self.apply_on.clone(),
            skip_on: self.skip_on.clone(),
        }
    }
}

impl<T> fmt::Debug for Fallback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fallback")
            .field("apply_on", &self.apply_on)
            .field("skip_on", &self.skip_on)
            .finish()
    }
}

/// Create a fallback that returns a constant value.
pub fn fallback_value<T>(value: T) -> Fallback<T>
where
    T: Clone + Send + Sync + 'static,
{
    Fallback::new(move |_| {
        let v = value.clone();
        async move { Ok::<_, BoxError>(v) }
    })
}

/// Create a fallback that returns a default value.
pub fn fallback_default<T>() -> Fallback<T>
where
    T: Default + Send + 'static,
{
    Fallback::new(|_| async { Ok::<_, BoxError>(T::default()) })
}

/// Stage substituting the fallback result.
pub struct FallbackPolicy<T> {
    fallback: Fallback<T>,
}

impl<T: Send + 'static> FallbackPolicy<T> {
    pub fn new(fallback: Fallback<T>) -> Self {
        Self { fallback }
    }
}

#[async_trait]
impl<T: Send + 'static> Policy<T> for FallbackPolicy<T> {
    fn name(&self) -> &str {
        PolicyKind::Fallback.as_str()
    }

    async fn guard(&self, ctx: InvocationContext, next: Next<T>) -> Outcome<T> {
        let outcome = next.run(ctx.clone()).await;
        let observed = outcome.kind();

        if outcome.is_success() || !self.fallback.applies_to(&outcome) {
            ctx.mark_guarded_outcome(observed);
            return outcome;
        }

        let cause = match outcome.into_result(&ctx) {
            Err(cause) => cause,
            Ok(value) => return Outcome::Success(value),
        };
        ctx.mark_fallback_invoked(observed);
        debug!(method = %ctx.method(), cause = %cause, "Guarded call did not succeed, using fallback");

        let span = tracing::info_span!("fallback", method = %ctx.method(), observed = %observed);
        let handled = AssertUnwindSafe(self.fallback.call(FallbackContext {
            invocation: ctx.clone(),
            cause,
        }))
        .catch_unwind()
        .instrument(span)
        .await;

        match handled {
            Ok(Ok(value)) => Outcome::Success(value),
            Ok(Err(e)) => {
                warn!(method = %ctx.method(), error = %e, "Fallback handler failed");
                ctx.mark_fallback_failed();
                Outcome::Failure(e)
            }
            Err(payload) => {
                let e = WorkPanicked::from_payload(payload);
                error!(method = %ctx.method(), error = %e, "Fallback handler panicked");
                ctx.mark_fallback_failed();
                Outcome::Failure(Box::new(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::tests::run_single;
    use std::io;

    #[tokio::test]
    async fn test_fallback_not_called_on_success() {
        let (outcome, ctx) = run_single(
            FallbackPolicy::new(fallback_value("fallback")),
            |_| async { Ok::<_, io::Error>("primary") },
        )
        .await;

        assert!(matches!(outcome, Outcome::Success("primary")));
        assert!(!ctx.fallback_invoked());
        assert_eq!(ctx.guarded_outcome(), Some(OutcomeKind::Success));
    }

    #[tokio::test]
    async fn test_fallback_substitutes_failure() {
        let (outcome, ctx) = run_single(
            FallbackPolicy::new(fallback_value("fallback")),
            |_| async { Err::<&str, _>(io::Error::other("boom")) },
        )
        .await;

        assert!(matches!(outcome, Outcome::Success("fallback")));
        assert!(ctx.fallback_invoked());
        assert_eq!(ctx.guarded_outcome(), Some(OutcomeKind::Failure));
    }

    #[tokio::test]
    async fn test_handler_sees_cause_and_arguments() {
        let fallback = Fallback::new(|ctx: FallbackContext| async move {
            let name = ctx.invocation.method().name.clone();
            match ctx.cause {
                FaultToleranceError::WorkFailure(e) => Ok::<_, BoxError>(format!("{}: {}", name, e)),
                other => Err(other.into()),
            }
        });

        let (outcome, _) = run_single(FallbackPolicy::new(fallback), |_| async {
            Err::<String, _>(io::Error::other("boom"))
        })
        .await;

        assert!(matches!(outcome, Outcome::Success(ref s) if s == "Service.call: boom"));
    }

    #[tokio::test]
    async fn test_handler_error_marks_fallback_failed() {
        let fallback = Fallback::new(|_| async { Err::<u32, _>(io::Error::other("fallback down")) });

        let (outcome, ctx) = run_single(FallbackPolicy::new(fallback), |_| async {
            Err::<u32, _>(io::Error::other("boom"))
        })
        .await;

        assert!(ctx.fallback_failed());
        let err = outcome.into_result(&ctx).unwrap_err();
        assert!(matches!(err, FaultToleranceError::FallbackFailure(_)));
        assert_eq!(err.to_string(), "Fallback handler failed: fallback down");
    }

    #[tokio::test]
    async fn test_skip_on_passes_outcome_through() {
        let fallback = fallback_value(0u32).skip_on(FailureMatcher::error::<io::Error>());

        let (outcome, ctx) = run_single(FallbackPolicy::new(fallback), |_| async {
            Err::<u32, _>(io::Error::other("boom"))
        })
        .await;

        assert_eq!(outcome.kind(), OutcomeKind::Failure);
        assert!(!ctx.fallback_invoked());
        assert_eq!(ctx.guarded_outcome(), Some(OutcomeKind::Failure));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_a_fallback_failure() {
        let fallback = Fallback::new(|_| async {
            if true {
                panic!("handler exploded");
            }
            Ok::<u32, BoxError>(1)
        });

        let (outcome, ctx) = run_single(FallbackPolicy::new(fallback), |_| async {
            Err::<u32, _>(io::Error::other("boom"))
        })
        .await;

        assert_eq!(outcome.kind(), OutcomeKind::Failure);
        assert!(ctx.fallback_failed());
    }

    #[tokio::test]
    async fn test_fallback_default() {
        let (outcome, _) = run_single(
            FallbackPolicy::new(fallback_default::<Vec<u8>>()),
            |_| async { Err::<Vec<u8>, _>(io::Error::other("boom")) },
        )
        .await;

        assert!(matches!(outcome, Outcome::Success(ref v) if v.is_empty()));
    }
}
