//! Tagged results flowing through a pipeline.

use crate::error::{BoxError, FaultToleranceError};
use crate::invocation::InvocationContext;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Result of one pass through a pipeline stage.
///
/// Exactly one variant describes how the guarded call ended. Policies
/// consume and produce outcomes, the engine turns the final one into a
/// `Result` for the caller.
pub enum Outcome<T> {
    /// The work produced a value.
    Success(T),
    /// The work returned an error (or panicked).
    Failure(BoxError),
    /// A timeout policy gave up waiting after the given duration.
    TimedOut(Duration),
    /// An open circuit rejected the call.
    CircuitOpenRejected,
    /// The bulkhead had no free slot and no queue room.
    BulkheadRejected,
}

/// Payload-free tag of an [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Failure,
    TimedOut,
    CircuitOpenRejected,
    BulkheadRejected,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::TimedOut => "timed_out",
            Self::CircuitOpenRejected => "circuit_open_rejected",
            Self::BulkheadRejected => "bulkhead_rejected",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<T> Outcome<T> {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Success(_) => OutcomeKind::Success,
            Self::Failure(_) => OutcomeKind::Failure,
            Self::TimedOut(_) => OutcomeKind::TimedOut,
            Self::CircuitOpenRejected => OutcomeKind::CircuitOpenRejected,
            Self::BulkheadRejected => OutcomeKind::BulkheadRejected,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The work error carried by a `Failure`.
    pub fn error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Failure(e) => Some(e.as_ref()),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Success(value) => Outcome::Success(f(value)),
            Self::Failure(e) => Outcome::Failure(e),
            Self::TimedOut(d) => Outcome::TimedOut(d),
            Self::CircuitOpenRejected => Outcome::CircuitOpenRejected,
            Self::BulkheadRejected => Outcome::BulkheadRejected,
        }
    }

    /// Convert into the caller-facing result, using the per-call record in
    /// `ctx` to tell exhausted retries and fallback failures apart.
    pub fn into_result(self, ctx: &InvocationContext) -> Result<T, FaultToleranceError> {
        let error = match self {
            Self::Success(value) => return Ok(value),
            Self::Failure(e) if ctx.fallback_failed() => {
                return Err(FaultToleranceError::FallbackFailure(e));
            }
            Self::Failure(e) => FaultToleranceError::WorkFailure(e),
            Self::TimedOut(d) => FaultToleranceError::TimeoutExceeded(d),
            Self::CircuitOpenRejected => FaultToleranceError::CircuitOpen(ctx.method().clone()),
            Self::BulkheadRejected => FaultToleranceError::BulkheadFull(ctx.method().clone()),
        };

        match ctx.retries_exhausted() {
            Some(attempts) => Err(FaultToleranceError::RetriesExhausted {
                attempts,
                last: Box::new(error),
            }),
            None => Err(error),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(value) => f.debug_tuple("Success").field(value).finish(),
            Self::Failure(e) => f.debug_tuple("Failure").field(&e.to_string()).finish(),
            Self::TimedOut(d) => f.debug_tuple("TimedOut").field(d).finish(),
            Self::CircuitOpenRejected => f.write_str("CircuitOpenRejected"),
            Self::BulkheadRejected => f.write_str("BulkheadRejected"),
        }
    }
}

type MatchFn = dyn Fn(OutcomeKind, Option<&(dyn StdError + Send + Sync + 'static)>) -> bool
    + Send
    + Sync;

/// Selects which non-success outcomes a policy reacts to.
///
/// Used for retry `retry_on`/`abort_on`, circuit breaker `fail_on`/`skip_on`
/// and fallback `apply_on`/`skip_on`. A matcher never matches `Success`.
#[derive(Clone)]
pub struct FailureMatcher {
    inner: Arc<MatchFn>,
    label: &'static str,
}

impl FailureMatcher {
    /// Build a matcher from a predicate over the outcome tag and work error.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(OutcomeKind, Option<&(dyn StdError + Send + Sync + 'static)>) -> bool
            + Send
            + Sync
            + 'static,
    {
        Self::labelled("custom", f)
    }

    fn labelled<F>(label: &'static str, f: F) -> Self
    where
        F: Fn(OutcomeKind, Option<&(dyn StdError + Send + Sync + 'static)>) -> bool
            + Send
            + Sync
            + 'static,
    {
        Self {
            inner: Arc::new(f),
            label,
        }
    }

    /// Matches every non-success outcome.
    pub fn any() -> Self {
        Self::labelled("any", |_, _| true)
    }

    /// Matches nothing.
    pub fn never() -> Self {
        Self::labelled("never", |_, _| false)
    }

    /// Matches work failures and timeouts.
    pub fn failures_and_timeouts() -> Self {
        Self::labelled("failures_and_timeouts", |kind, _| {
            matches!(kind, OutcomeKind::Failure | OutcomeKind::TimedOut)
        })
    }

    /// Matches the listed outcome kinds.
    pub fn kinds(kinds: &[OutcomeKind]) -> Self {
        let kinds = kinds.to_vec();
        Self::labelled("kinds", move |kind, _| kinds.contains(&kind))
    }

    /// Matches failures whose error, or any error in its source chain, is an `E`.
    pub fn error<E: StdError + 'static>() -> Self {
        Self::labelled("error", |_, error| error.is_some_and(error_chain_contains::<E>))
    }

    /// Matches when either matcher does.
    pub fn or(self, other: FailureMatcher) -> Self {
        Self::labelled("or", move |kind, error| {
            (self.inner)(kind, error) || (other.inner)(kind, error)
        })
    }

    /// Matches when `self` does and `other` does not.
    pub fn unless(self, other: FailureMatcher) -> Self {
        Self::labelled("unless", move |kind, error| {
            (self.inner)(kind, error) && !(other.inner)(kind, error)
        })
    }

    pub fn matches<T>(&self, outcome: &Outcome<T>) -> bool {
        if outcome.is_success() {
            return false;
        }
        (self.inner)(outcome.kind(), outcome.error())
    }
}

impl fmt::Debug for FailureMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FailureMatcher").field(&self.label).finish()
    }
}

fn error_chain_contains<E: StdError + 'static>(
    error: &(dyn StdError + Send + Sync + 'static),
) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(e) = current {
        if e.is::<E>() {
            return true;
        }
        current = e.source();
    }
    false
}
