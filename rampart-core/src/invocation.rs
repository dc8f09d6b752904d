//! Per-call state handed to every pipeline stage.

use crate::arguments::Arguments;
use crate::descriptor::MethodId;
use crate::outcome::OutcomeKind;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// How the call was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// The caller waits on its own task. Bulkheads never queue these calls.
    Synchronous,
    /// The call runs on a dedicated task behind an [`InvocationHandle`](crate::InvocationHandle).
    Asynchronous,
}

#[derive(Debug, Default)]
struct CallRecord {
    executions: AtomicU32,
    retry_attempts: AtomicU32,
    retries_exhausted: AtomicBool,
    fallback_invoked: AtomicBool,
    fallback_failed: AtomicBool,
    guarded_outcome: Mutex<Option<OutcomeKind>>,
}

/// Context of one guarded call.
///
/// Cloned into each stage. Clones share the call record (execution
/// counter and the flags set by retry and fallback), so what an inner stage
/// records is visible to the engine once the call completes. The deadline
/// and cancellation token are per attempt: a timeout stage derives a child
/// context for the attempt it guards.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    method: MethodId,
    mode: ExecutionMode,
    arguments: Arc<Arguments>,
    record: Arc<CallRecord>,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl InvocationContext {
    pub fn new(method: MethodId, mode: ExecutionMode, arguments: Arguments) -> Self {
        Self {
            method,
            mode,
            arguments: Arc::new(arguments),
            record: Arc::new(CallRecord::default()),
            cancellation: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn method(&self) -> &MethodId {
        &self.method
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    /// Cancelled when the attempt this context belongs to has been abandoned.
    ///
    /// Work that can stop early should watch it; nothing forces it to.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Deadline of the current attempt, if a timeout guards it.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Number of times the work has started so far.
    pub fn executions(&self) -> u32 {
        self.record.executions.load(Ordering::Acquire)
    }

    /// Number of retries performed so far.
    pub fn retry_attempts(&self) -> u32 {
        self.record.retry_attempts.load(Ordering::Acquire)
    }

    /// Probe that keeps reporting executions after the context is gone.
    pub fn probe(&self) -> ExecutionProbe {
        ExecutionProbe {
            record: self.record.clone(),
        }
    }

    /// Total attempts if the retry policy gave up, `None` otherwise.
    pub fn retries_exhausted(&self) -> Option<u32> {
        if self.record.retries_exhausted.load(Ordering::Acquire) {
            Some(self.retry_attempts() + 1)
        } else {
            None
        }
    }

    pub fn fallback_invoked(&self) -> bool {
        self.record.fallback_invoked.load(Ordering::Acquire)
    }

    pub fn fallback_failed(&self) -> bool {
        self.record.fallback_failed.load(Ordering::Acquire)
    }

    /// Outcome the fallback stage saw before it substituted anything.
    pub fn guarded_outcome(&self) -> Option<OutcomeKind> {
        *self.record.guarded_outcome.lock()
    }

    pub(crate) fn for_attempt(&self, deadline: Instant) -> Self {
        let mut ctx = self.clone();
        ctx.cancellation = self.cancellation.child_token();
        ctx.deadline = Some(match self.deadline {
            Some(outer) if outer < deadline => outer,
            _ => deadline,
        });
        ctx
    }

    pub(crate) fn record_execution(&self) -> u32 {
        self.record.executions.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn record_retry(&self) -> u32 {
        self.record.retry_attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn mark_retries_exhausted(&self) {
        self.record.retries_exhausted.store(true, Ordering::Release);
    }

    pub(crate) fn mark_fallback_invoked(&self, guarded: OutcomeKind) {
        *self.record.guarded_outcome.lock() = Some(guarded);
        self.record.fallback_invoked.store(true, Ordering::Release);
    }

    pub(crate) fn mark_guarded_outcome(&self, guarded: OutcomeKind) {
        *self.record.guarded_outcome.lock() = Some(guarded);
    }

    pub(crate) fn mark_fallback_failed(&self) {
        self.record.fallback_failed.store(true, Ordering::Release);
    }
}

/// Read-only view of a call's progress.
///
/// Can be polled from any task while the call is still running, e.g. to
/// watch an unlimited retry loop.
#[derive(Debug, Clone)]
pub struct ExecutionProbe {
    record: Arc<CallRecord>,
}

impl ExecutionProbe {
    pub fn executions(&self) -> u32 {
        self.record.executions.load(Ordering::Acquire)
    }

    pub fn retry_attempts(&self) -> u32 {
        self.record.retry_attempts.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn context() -> InvocationContext {
        InvocationContext::new(
            MethodId::new("app", "svc.call"),
            ExecutionMode::Synchronous,
            Arguments::new().with(5u8),
        )
    }

    #[test]
    fn test_clones_share_call_record() {
        let ctx = context();
        let clone = ctx.clone();
        let probe = ctx.probe();

        clone.record_execution();
        clone.record_execution();
        clone.record_retry();

        assert_eq!(ctx.executions(), 2);
        assert_eq!(probe.executions(), 2);
        assert_eq!(probe.retry_attempts(), 1);
        assert_eq!(ctx.retries_exhausted(), None);

        clone.mark_retries_exhausted();
        assert_eq!(ctx.retries_exhausted(), Some(2));
    }

    #[test]
    fn test_attempt_context_cancellation_is_scoped() {
        let ctx = context();
        let now = Instant::now();
        let attempt = ctx.for_attempt(now + Duration::from_secs(1));

        attempt.cancellation().cancel();
        assert!(attempt.is_cancelled());
        assert!(!ctx.is_cancelled());
        assert_eq!(attempt.arguments().get::<u8>(), Some(&5));
    }

    #[test]
    fn test_nested_attempt_keeps_earliest_deadline() {
        let ctx = context();
        let now = Instant::now();
        let outer = ctx.for_attempt(now + Duration::from_secs(1));
        let inner = outer.for_attempt(now + Duration::from_secs(10));

        assert_eq!(inner.deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_fallback_flags() {
        let ctx = context();
        assert!(!ctx.fallback_invoked());

        ctx.mark_fallback_invoked(OutcomeKind::TimedOut);
        ctx.mark_fallback_failed();

        assert!(ctx.fallback_invoked());
        assert!(ctx.fallback_failed());
        assert_eq!(ctx.guarded_outcome(), Some(OutcomeKind::TimedOut));
    }
}
