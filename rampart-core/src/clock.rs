//! Time source and delayed execution used by every policy.
//!
//! Policies never read the system time or sleep directly; they go through a
//! [`Clock`] so circuit breaker cooldowns, retry delays and timeouts can be
//! driven by tokio's virtual time in tests or by [`ManualClock`] without a
//! runtime at all.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

/// Source of time and sleeps.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Future resolving after `duration`.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;

    /// Time elapsed since `earlier`, saturating at zero.
    fn elapsed_since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}

/// Clock backed by tokio's timer.
///
/// Follows tokio's paused time (`start_paused`) so tests can advance time
/// deterministically.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually advanced clock.
///
/// `sleep` advances the clock by the requested duration and completes
/// immediately. Meant for circuit breaker cooldowns and retry delays; a
/// timeout stage driven by this clock expires as soon as it starts, so any
/// work that is not already finished reports `TimedOut`. Use [`TokioClock`]
/// with paused time to test timeouts.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        *self.now.lock() += duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.advance(duration);
        Box::pin(std::future::ready(()))
    }
}
