//! Timeout policy.
//!
//! The inner stages run on their own task. When the deadline passes first,
//! the attempt's cancellation token is cancelled and the task is detached:
//! it keeps running to completion (holding any bulkhead slot it acquired),
//! its result is dropped, and the policy reports `TimedOut`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rampart::{MethodDefinition, TimeoutConfig};
//! use std::time::Duration;
//!
//! let definition = MethodDefinition::<String>::builder("LoadService.timeout")
//!     .timeout(TimeoutConfig::new(Duration::from_millis(5000)))
//!     .build();
//! ```

use super::PolicyEnv;
use crate::error::DefinitionError;
use crate::invocation::InvocationContext;
use crate::outcome::Outcome;
use crate::policy::{Next, Policy, PolicyKind};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{error, warn};

/// Timeout configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutConfig {
    /// How long an attempt may run.
    pub duration: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(1000),
        }
    }
}

impl TimeoutConfig {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.duration.is_zero() {
            return Err(DefinitionError::invalid(
                PolicyKind::Timeout,
                "value",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Stage enforcing a per-attempt deadline.
pub struct TimeoutPolicy {
    config: TimeoutConfig,
    env: PolicyEnv,
}

impl TimeoutPolicy {
    pub fn new(config: TimeoutConfig, env: PolicyEnv) -> Self {
        Self { config, env }
    }

    pub fn duration(&self) -> Duration {
        self.config.duration
    }
}

#[async_trait]
impl<T: Send + 'static> Policy<T> for TimeoutPolicy {
    fn name(&self) -> &str {
        PolicyKind::Timeout.as_str()
    }

    async fn guard(&self, ctx: InvocationContext, next: Next<T>) -> Outcome<T> {
        let duration = self.config.duration;
        let attempt = ctx.for_attempt(self.env.clock.now() + duration);
        let token = attempt.cancellation().clone();

        let mut running = tokio::spawn(next.run(attempt));
        let expired = self.env.clock.sleep(duration);

        // A finished attempt wins over a deadline that expired at the same poll.
        tokio::select! {
            biased;

            joined = &mut running => match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(method = %self.env.method, error = %e, "Guarded attempt task failed");
                    Outcome::Failure(Box::new(e))
                }
            },
            _ = expired => {
                token.cancel();
                warn!(
                    method = %self.env.method,
                    duration = ?duration,
                    "Operation timed out"
                );
                Outcome::TimedOut(duration)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::resilience::tests::{env, run_single};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_timeout_completes() {
        let policy = TimeoutPolicy::new(TimeoutConfig::new(Duration::from_secs(1)), env());

        let (outcome, _) = run_single(policy, |_| async { Ok::<_, &str>(42) }).await;

        assert!(matches!(outcome, Outcome::Success(42)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_expires_and_abandons_work() {
        let finished = Arc::new(AtomicBool::new(false));
        let policy = TimeoutPolicy::new(TimeoutConfig::new(Duration::from_millis(10)), env());

        let flag = finished.clone();
        let (outcome, ctx) = run_single(policy, move |_| {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, &str>(42)
            }
        })
        .await;

        assert!(matches!(outcome, Outcome::TimedOut(d) if d == Duration::from_millis(10)));
        assert_eq!(ctx.executions(), 1);
        assert!(!finished.load(Ordering::SeqCst));

        // The abandoned work still runs to completion.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_cancels_attempt_token() {
        let policy = TimeoutPolicy::new(TimeoutConfig::new(Duration::from_millis(50)), env());

        let (outcome, _) = run_single(policy, |ctx: InvocationContext| async move {
            ctx.cancellation().cancelled().await;
            Err::<(), _>("cancelled")
        })
        .await;

        assert!(matches!(outcome, Outcome::TimedOut(_)));
    }

    #[test]
    fn test_zero_duration_invalid() {
        let config = TimeoutConfig::new(Duration::ZERO);
        assert!(config.validate().is_err());
        assert!(TimeoutConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_manual_clock_expires_unfinished_work() {
        let clock = Arc::new(ManualClock::new());
        let start = clock.now();
        let policy = TimeoutPolicy::new(
            TimeoutConfig::new(Duration::from_secs(2)),
            PolicyEnv {
                clock: clock.clone(),
                ..env()
            },
        );

        let (outcome, _) = run_single(policy, |_| async {
            std::future::pending::<()>().await;
            Ok::<u32, &str>(1)
        })
        .await;

        assert!(matches!(outcome, Outcome::TimedOut(d) if d == Duration::from_secs(2)));
        assert_eq!(clock.elapsed_since(start), Duration::from_secs(2));
    }
}
