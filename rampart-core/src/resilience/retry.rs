//! Retry policy with configurable backoff.
//!
//! Every retry re-runs all stages inside the retry stage, so circuit
//! breaker admission, timeouts and bulkhead admission apply to each attempt.
//! With `max_retries = N` a permanently failing call executes `N + 1`
//! times; [`MaxRetries::Unlimited`] keeps going until the work succeeds or
//! fails in a way the policy does not retry.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rampart::{BackoffStrategy, FailureMatcher, RetryConfig};
//! use std::time::{Duration, Instant};
//!
//! let retry = RetryConfig::new(10)
//!     .backoff(BackoffStrategy::constant(Duration::from_millis(200)))
//!     .abort_on(FailureMatcher::error::<std::io::Error>());
//! ```

use super::PolicyEnv;
use crate::error::DefinitionError;
use crate::invocation::InvocationContext;
use crate::outcome::{FailureMatcher, Outcome};
use crate::policy::{Next, Policy, PolicyKind};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, debug_span, warn};

/// Upper bound on retries after the first execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxRetries {
    Limited(u32),
    Unlimited,
}

impl MaxRetries {
    /// Whether another retry is allowed after `performed` retries.
    pub fn allows(&self, performed: u32) -> bool {
        match self {
            Self::Limited(max) => performed < *max,
            Self::Unlimited => true,
        }
    }
}

impl From<i32> for MaxRetries {
    /// Negative values mean unlimited.
    fn from(value: i32) -> Self {
        u32::try_from(value)
            .map(Self::Limited)
            .unwrap_or(Self::Unlimited)
    }
}

/// Delay between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// No delay between retries.
    None,
    /// Constant delay between retries.
    Constant(Duration),
    /// Linear backoff: delay increases by a fixed amount.
    Linear {
        initial: Duration,
        increment: Duration,
        max: Duration,
    },
    /// Exponential backoff: delay multiplies each retry.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl BackoffStrategy {
    pub fn constant(delay: Duration) -> Self {
        Self::Constant(delay)
    }

    pub fn linear(initial: Duration, increment: Duration) -> Self {
        Self::Linear {
            initial,
            increment,
            max: Duration::from_secs(60),
        }
    }

    pub fn exponential(initial: Duration) -> Self {
        Self::Exponential {
            initial,
            multiplier: 2.0,
            max: Duration::from_secs(60),
        }
    }

    /// Set maximum delay.
    pub fn with_max(self, max: Duration) -> Self {
        match self {
            Self::Linear {
                initial, increment, ..
            } => Self::Linear {
                initial,
                increment,
                max,
            },
            Self::Exponential {
                initial,
                multiplier,
                ..
            } => Self::Exponential {
                initial,
                multiplier,
                max,
            },
            other => other,
        }
    }

    /// Delay before retry number `retry` (0-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Constant(d) => *d,
            Self::Linear {
                initial,
                increment,
                max,
            } => (*initial + increment.saturating_mul(retry)).min(*max),
            Self::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let factor = multiplier.powi(retry.min(i32::MAX as u32) as i32);
                let millis = initial.as_millis() as f64 * factor;
                if millis >= max.as_millis() as f64 {
                    *max
                } else {
                    Duration::from_millis(millis as u64)
                }
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::None
    }
}

/// Retry configuration.
///
/// An attempt abandoned by an inner timeout keeps running until its work
/// returns, and keeps its bulkhead slot until then. With a bulkhead of one
/// slot the next attempt is rejected, so the call ends as `BulkheadFull`
/// rather than `RetriesExhausted` unless `retry_on` covers bulkhead rejections
/// and the delay outlasts the abandoned work.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: MaxRetries,
    pub backoff: BackoffStrategy,
    /// Random variation added to each delay, in `[-jitter, +jitter]`.
    pub jitter: Duration,
    /// Stop retrying once this much time has passed since the first attempt.
    /// Checked after each failed attempt and again after the delay, so no
    /// attempt starts past the limit.
    pub max_duration: Option<Duration>,
    /// Outcomes that are retried.
    pub retry_on: FailureMatcher,
    /// Outcomes that stop the retry loop immediately, even if retryable.
    pub abort_on: FailureMatcher,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: MaxRetries::Limited(3),
            backoff: BackoffStrategy::None,
            jitter: Duration::ZERO,
            max_duration: None,
            retry_on: FailureMatcher::failures_and_timeouts(),
            abort_on: FailureMatcher::never(),
        }
    }
}

impl RetryConfig {
    /// Retry up to `max_retries` times; negative means unlimited.
    pub fn new(max_retries: i32) -> Self {
        Self {
            max_retries: MaxRetries::from(max_retries),
            ..Default::default()
        }
    }

    pub fn unlimited() -> Self {
        Self {
            max_retries: MaxRetries::Unlimited,
            ..Default::default()
        }
    }

    /// Constant delay between attempts.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.backoff = BackoffStrategy::Constant(delay);
        self
    }

    pub fn backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    pub fn retry_on(mut self, matcher: FailureMatcher) -> Self {
        self.retry_on = matcher;
        self
    }

    pub fn abort_on(mut self, matcher: FailureMatcher) -> Self {
        self.abort_on = matcher;
        self
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if let Some(max) = self.max_duration {
            let first_delay = self.backoff.delay_for_retry(0);
            if max.is_zero() || max <= first_delay {
                return Err(DefinitionError::invalid(
                    PolicyKind::Retry,
                    "maxDuration",
                    "must be greater than the delay",
                ));
            }
        }
        if let BackoffStrategy::Exponential { multiplier, .. } = self.backoff {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(DefinitionError::invalid(
                    PolicyKind::Retry,
                    "multiplier",
                    "must be a finite number >= 1",
                ));
            }
        }
        Ok(())
    }

    fn delay_with_jitter(&self, retry: u32) -> Duration {
        let base = self.backoff.delay_for_retry(retry);
        if self.jitter.is_zero() {
            return base;
        }
        let offset = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter.as_secs_f64();
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }
}

/// Stage re-running the inner pipeline on retryable outcomes.
pub struct RetryPolicy {
    config: RetryConfig,
    env: PolicyEnv,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig, env: PolicyEnv) -> Self {
        Self { config, env }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn out_of_time(&self, started: Instant) -> bool {
        self.config
            .max_duration
            .is_some_and(|max| self.env.clock.elapsed_since(started) >= max)
    }

    fn exhausted<T>(
        &self,
        ctx: &InvocationContext,
        retries: u32,
        outcome: Outcome<T>,
    ) -> Outcome<T> {
        warn!(
            method = %self.env.method,
            attempts = retries + 1,
            outcome = %outcome.kind(),
            "All retry attempts exhausted"
        );
        ctx.mark_retries_exhausted();
        outcome
    }
}

#[async_trait]
impl<T: Send + 'static> Policy<T> for RetryPolicy {
    fn name(&self) -> &str {
        PolicyKind::Retry.as_str()
    }

    async fn guard(&self, ctx: InvocationContext, next: Next<T>) -> Outcome<T> {
        let started = self.env.clock.now();
        let mut retries = 0u32;

        loop {
            let span = debug_span!("attempt", method = %self.env.method, attempt = retries + 1);
            let outcome = next.run(ctx.clone()).instrument(span).await;

            if outcome.is_success() || !self.config.retry_on.matches(&outcome) {
                return outcome;
            }

            if self.config.abort_on.matches(&outcome) {
                debug!(
                    method = %self.env.method,
                    attempt = retries + 1,
                    outcome = %outcome.kind(),
                    "Outcome aborts retries"
                );
                return outcome;
            }

            if !self.config.max_retries.allows(retries) || self.out_of_time(started) {
                return self.exhausted(&ctx, retries, outcome);
            }

            let delay = self.config.delay_with_jitter(retries);
            debug!(
                method = %self.env.method,
                attempt = retries + 1,
                outcome = %outcome.kind(),
                delay_ms = delay.as_millis() as u64,
                "Attempt failed, retrying"
            );

            if !delay.is_zero() {
                self.env.clock.sleep(delay).await;
                // No attempt may start past the limit.
                if self.out_of_time(started) {
                    return self.exhausted(&ctx, retries, outcome);
                }
            }
            drop(outcome);

            retries += 1;
            ctx.record_retry();
            self.env.metrics.record_retry(&self.env.method);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::tests::{env, run_single};
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_max_retries_from_i32() {
        assert_eq!(MaxRetries::from(3), MaxRetries::Limited(3));
        assert_eq!(MaxRetries::from(0), MaxRetries::Limited(0));
        assert_eq!(MaxRetries::from(-1), MaxRetries::Unlimited);
        assert!(!MaxRetries::Limited(0).allows(0));
        assert!(MaxRetries::Unlimited.allows(u32::MAX));
    }

    #[test]
    fn test_backoff_delays() {
        let constant = BackoffStrategy::constant(Duration::from_millis(200));
        assert_eq!(constant.delay_for_retry(5), Duration::from_millis(200));

        let linear = BackoffStrategy::linear(Duration::from_millis(100), Duration::from_millis(50));
        assert_eq!(linear.delay_for_retry(2), Duration::from_millis(200));

        let exponential =
            BackoffStrategy::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(1));
        assert_eq!(exponential.delay_for_retry(0), Duration::from_millis(100));
        assert_eq!(exponential.delay_for_retry(3), Duration::from_millis(800));
        assert_eq!(exponential.delay_for_retry(40), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = RetryConfig::new(1)
            .delay(Duration::from_millis(100))
            .jitter(Duration::from_millis(50));

        for retry in 0..20 {
            let delay = config.delay_with_jitter(retry);
            assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_validate_max_duration() {
        let config = RetryConfig::new(3)
            .delay(Duration::from_secs(1))
            .max_duration(Duration::from_millis(500));
        assert!(config.validate().is_err());
        assert!(RetryConfig::default().validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_runs_n_plus_one_times() {
        let policy = RetryPolicy::new(RetryConfig::new(3).delay(Duration::from_millis(10)), env());

        let (outcome, ctx) =
            run_single(policy, |_| async { Err::<(), _>(io::Error::other("down")) }).await;

        assert!(matches!(outcome, Outcome::Failure(_)));
        assert_eq!(ctx.executions(), 4);
        assert_eq!(ctx.retries_exhausted(), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(RetryConfig::new(5), env());

        let counter = calls.clone();
        let (outcome, ctx) = run_single(policy, move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient")
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert!(matches!(outcome, Outcome::Success("done")));
        assert_eq!(ctx.executions(), 3);
        assert_eq!(ctx.retries_exhausted(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_on_stops_immediately() {
        let config = RetryConfig::new(5).abort_on(FailureMatcher::error::<io::Error>());
        let policy = RetryPolicy::new(config, env());

        let (outcome, ctx) = run_single(policy, |_| async {
            Err::<(), _>(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
        })
        .await;

        assert!(matches!(outcome, Outcome::Failure(_)));
        assert_eq!(ctx.executions(), 1);
        assert_eq!(ctx.retries_exhausted(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_outcome_not_retried() {
        let config = RetryConfig::new(5).retry_on(FailureMatcher::error::<io::Error>());
        let policy = RetryPolicy::new(config, env());

        let (_, ctx) = run_single(policy, |_| async { Err::<(), _>("not io") }).await;

        assert_eq!(ctx.executions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_ends_retries() {
        let config = RetryConfig::unlimited()
            .delay(Duration::from_millis(100))
            .max_duration(Duration::from_millis(350));
        let policy = RetryPolicy::new(config, env());

        let (_, ctx) = run_single(policy, |_| async { Err::<(), _>("down") }).await;

        // Attempts at 0, 100, 200 and 300ms; the delay after the fourth ends at 400ms.
        assert_eq!(ctx.executions(), 4);
        assert!(ctx.retries_exhausted().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_attempt_starts_after_max_duration() {
        let config = RetryConfig::unlimited()
            .delay(Duration::from_millis(300))
            .max_duration(Duration::from_millis(500));
        let policy = RetryPolicy::new(config, env());
        let started = tokio::time::Instant::now();
        let starts = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let seen = starts.clone();
        let (outcome, ctx) = run_single(policy, move |_| {
            seen.lock().push(started.elapsed());
            async { Err::<(), _>("down") }
        })
        .await;

        assert!(matches!(outcome, Outcome::Failure(_)));
        assert_eq!(ctx.executions(), 2);
        let starts = starts.lock();
        assert!(starts.iter().all(|at| *at < Duration::from_millis(500)));
        assert_eq!(starts[1], Duration::from_millis(300));
    }
}
