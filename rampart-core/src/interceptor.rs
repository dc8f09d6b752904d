// Interceptors observing guarded calls around the built-in policies

use crate::error::BoxError;
use crate::invocation::InvocationContext;
use crate::outcome::{Outcome, OutcomeKind};
use crate::policy::{Next, Policy};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// User interceptor spliced into a pipeline by priority.
///
/// An interceptor with a priority above the fault-tolerance priority sits
/// inside the retry loop and sees every attempt; a lower one sees the call
/// once.
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    /// Runs before the inner stages. An error short-circuits the call as a
    /// `Failure` and skips `after`.
    async fn before(&self, _ctx: &InvocationContext) -> Result<(), BoxError> {
        Ok(())
    }

    /// Runs once the inner stages produced an outcome.
    async fn after(&self, _ctx: &InvocationContext, _outcome: OutcomeKind) {}
}

/// Adapts an [`Interceptor`] into a pipeline stage.
pub struct InterceptorStage {
    interceptor: Arc<dyn Interceptor>,
}

impl InterceptorStage {
    pub fn new(interceptor: Arc<dyn Interceptor>) -> Self {
        Self { interceptor }
    }
}

#[async_trait]
impl<T: Send + 'static> Policy<T> for InterceptorStage {
    fn name(&self) -> &str {
        self.interceptor.name()
    }

    async fn guard(&self, ctx: InvocationContext, next: Next<T>) -> Outcome<T> {
        if let Err(e) = self.interceptor.before(&ctx).await {
            warn!(
                interceptor = self.interceptor.name(),
                method = %ctx.method(),
                error = %e,
                "Interceptor rejected call"
            );
            return Outcome::Failure(e);
        }

        let outcome = next.run(ctx.clone()).await;
        self.interceptor.after(&ctx, outcome.kind()).await;
        outcome
    }
}

/// Logging interceptor
pub struct LoggingInterceptor;

#[async_trait]
impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &str {
        "logging"
    }

    async fn before(&self, ctx: &InvocationContext) -> Result<(), BoxError> {
        info!(
            method = %ctx.method(),
            mode = ?ctx.mode(),
            executions = ctx.executions(),
            "→ guarded call"
        );
        Ok(())
    }

    async fn after(&self, ctx: &InvocationContext, outcome: OutcomeKind) {
        info!(
            method = %ctx.method(),
            outcome = %outcome,
            executions = ctx.executions(),
            "← guarded call"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::ExecutionMode;
    use crate::resilience::tests::{context, run_chain};
    use parking_lot::Mutex;
    use std::io;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        reject: bool,
    }

    #[async_trait]
    impl Interceptor for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn before(&self, _ctx: &InvocationContext) -> Result<(), BoxError> {
            self.log.lock().push(format!("{} before", self.name));
            if self.reject {
                return Err("not allowed".into());
            }
            Ok(())
        }

        async fn after(&self, _ctx: &InvocationContext, outcome: OutcomeKind) {
            self.log.lock().push(format!("{} after {}", self.name, outcome));
        }
    }

    fn stage(name: &'static str, log: &Arc<Mutex<Vec<String>>>, reject: bool) -> Arc<dyn Policy<u32>> {
        Arc::new(InterceptorStage::new(Arc::new(Recording {
            name,
            log: log.clone(),
            reject,
        })))
    }

    #[tokio::test]
    async fn test_hooks_wrap_inner_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let work_log = log.clone();

        let (outcome, _) = run_chain(
            vec![stage("outer", &log, false), stage("inner", &log, false)],
            context(ExecutionMode::Synchronous),
            move |_| {
                let log = work_log.clone();
                async move {
                    log.lock().push("work".to_string());
                    Err::<u32, _>(io::Error::other("boom"))
                }
            },
        )
        .await;

        assert_eq!(outcome.kind(), OutcomeKind::Failure);
        assert_eq!(
            *log.lock(),
            vec![
                "outer before",
                "inner before",
                "work",
                "inner after failure",
                "outer after failure",
            ]
        );
    }

    #[tokio::test]
    async fn test_before_error_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let (outcome, ctx) = run_chain(
            vec![stage("gate", &log, true)],
            context(ExecutionMode::Synchronous),
            |_| async { Ok::<_, io::Error>(1) },
        )
        .await;

        assert_eq!(outcome.kind(), OutcomeKind::Failure);
        assert_eq!(ctx.executions(), 0);
        assert_eq!(*log.lock(), vec!["gate before"]);
    }

    #[tokio::test]
    async fn test_logging_interceptor_passes_outcome_through() {
        let logging: Arc<dyn Policy<u32>> = Arc::new(InterceptorStage::new(Arc::new(LoggingInterceptor)));

        let (outcome, ctx) = run_chain(vec![logging], context(ExecutionMode::Asynchronous), |_| async {
            Ok::<_, io::Error>(7)
        })
        .await;

        assert!(matches!(outcome, Outcome::Success(7)));
        assert_eq!(ctx.executions(), 1);
    }
}
