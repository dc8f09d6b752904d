//! Circuit breaker policy.
//!
//! ## States
//!
//! - **Closed**: Calls pass through; each completed outcome is recorded in a
//!   rolling window of the last `request_volume_threshold` calls. Once the
//!   window is full and its failure ratio reaches `failure_ratio`, the
//!   circuit opens.
//! - **Open**: Calls are rejected without running the inner stages. After
//!   `delay` the next call is let through as a trial.
//! - **Half-Open**: Up to `success_threshold` trial calls run. That many
//!   successes close the circuit (and clear the window); any failure opens
//!   it again.
//!
//! The window counts calls, not wall-clock time: nothing is evaluated
//! before `request_volume_threshold` calls have completed.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rampart::CircuitBreakerConfig;
//! use std::time::Duration;
//!
//! let circuit = CircuitBreakerConfig::new()
//!     .request_volume_threshold(20)
//!     .failure_ratio(0.5)
//!     .delay(Duration::from_secs(5));
//! ```

use super::PolicyEnv;
use crate::clock::Clock;
use crate::error::DefinitionError;
use crate::invocation::InvocationContext;
use crate::outcome::{FailureMatcher, Outcome};
use crate::policy::{Next, Policy, PolicyKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally.
    Closed,
    /// Circuit is open, requests are rejected.
    Open,
    /// Circuit is half-open, testing recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Size of the rolling window, and the number of calls needed before the
    /// failure ratio is evaluated.
    pub request_volume_threshold: u32,
    /// Failure ratio in the full window at which the circuit opens.
    pub failure_ratio: f64,
    /// How long the circuit stays open before a trial call.
    pub delay: Duration,
    /// Successful trials needed to close the circuit again.
    pub success_threshold: u32,
    /// Outcomes counted as failures.
    pub fail_on: FailureMatcher,
    /// Outcomes counted as successes even when `fail_on` matches.
    pub skip_on: FailureMatcher,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            request_volume_threshold: 20,
            failure_ratio: 0.5,
            delay: Duration::from_millis(5000),
            success_threshold: 1,
            fail_on: FailureMatcher::any(),
            skip_on: FailureMatcher::never(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_volume_threshold(mut self, threshold: u32) -> Self {
        self.request_volume_threshold = threshold;
        self
    }

    pub fn failure_ratio(mut self, ratio: f64) -> Self {
        self.failure_ratio = ratio;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn fail_on(mut self, matcher: FailureMatcher) -> Self {
        self.fail_on = matcher;
        self
    }

    pub fn skip_on(mut self, matcher: FailureMatcher) -> Self {
        self.skip_on = matcher;
        self
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        let kind = PolicyKind::CircuitBreaker;
        if self.request_volume_threshold == 0 {
            return Err(DefinitionError::invalid(
                kind,
                "requestVolumeThreshold",
                "must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_ratio) {
            return Err(DefinitionError::invalid(
                kind,
                "failureRatio",
                "must be between 0 and 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(DefinitionError::invalid(
                kind,
                "successThreshold",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Whether an outcome counts against the circuit.
    pub fn is_failure<T>(&self, outcome: &Outcome<T>) -> bool {
        self.fail_on.matches(outcome) && !self.skip_on.matches(outcome)
    }
}

/// Fixed-capacity record of the most recent call results.
#[derive(Debug)]
struct RollingWindow {
    capacity: usize,
    failed: VecDeque<bool>,
    failures: usize,
}

impl RollingWindow {
    fn new(capacity: u32) -> Self {
        let capacity = capacity as usize;
        Self {
            capacity,
            failed: VecDeque::with_capacity(capacity),
            failures: 0,
        }
    }

    fn record(&mut self, failed: bool) {
        if self.failed.len() == self.capacity && self.failed.pop_front() == Some(true) {
            self.failures -= 1;
        }
        self.failed.push_back(failed);
        if failed {
            self.failures += 1;
        }
    }

    fn is_full(&self) -> bool {
        self.failed.len() >= self.capacity
    }

    fn failure_ratio(&self) -> f64 {
        if self.failed.is_empty() {
            0.0
        } else {
            self.failures as f64 / self.failed.len() as f64
        }
    }

    fn clear(&mut self) {
        self.failed.clear();
        self.failures = 0;
    }
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    /// Bumped on every transition; results from older phases are ignored.
    generation: u64,
    opened_at: Option<Instant>,
    window: RollingWindow,
    trials_in_flight: u32,
    trial_successes: u32,
}

/// Circuit breaker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub window_size: usize,
    pub window_failures: usize,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub times_opened: u64,
}

impl CircuitBreakerStats {
    /// Failure rate over all recorded calls.
    pub fn failure_rate(&self) -> f64 {
        let recorded = self.total_successes + self.total_failures;
        if recorded == 0 {
            0.0
        } else {
            self.total_failures as f64 / recorded as f64
        }
    }
}

/// Shared circuit state of one guarded method.
///
/// Every transition happens under one mutex, so admissions and recorded
/// results are linearizable per breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<CircuitInner>,
    total_requests: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
    times_opened: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let name = name.into();
        info!(
            name = %name,
            request_volume_threshold = config.request_volume_threshold,
            failure_ratio = config.failure_ratio,
            delay = ?config.delay,
            "Circuit breaker initialized"
        );

        Arc::new(Self {
            name,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                generation: 0,
                opened_at: None,
                window: RollingWindow::new(config.request_volume_threshold),
                trials_in_flight: 0,
                trial_successes: 0,
            }),
            config,
            clock,
            total_requests: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current phase. An open circuit whose delay has passed still reports
    /// `Open` until the next call is admitted.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask to run a call. `None` means the call is rejected.
    ///
    /// The second element is set when this admission moved the circuit to
    /// half-open.
    pub fn try_acquire(&self) -> Option<(CircuitPermit<'_>, Option<CircuitState>)> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        let mut transition = None;

        if inner.state == CircuitState::Open {
            let cooled_down = inner
                .opened_at
                .is_none_or(|opened| self.clock.elapsed_since(opened) >= self.config.delay);
            if !cooled_down {
                drop(inner);
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
            transition = Some(CircuitState::HalfOpen);
        }

        let trial = inner.state == CircuitState::HalfOpen;
        if trial {
            if inner.trials_in_flight + inner.trial_successes >= self.config.success_threshold {
                drop(inner);
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            inner.trials_in_flight += 1;
        }

        let permit = CircuitPermit {
            breaker: self,
            generation: inner.generation,
            trial,
            recorded: false,
        };
        Some((permit, transition))
    }

    fn record(&self, generation: u64, trial: bool, failed: bool) -> Option<CircuitState> {
        if failed {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_successes.fetch_add(1, Ordering::Relaxed);
        }

        let mut inner = self.inner.lock();
        if inner.generation != generation {
            debug!(name = %self.name, "Ignoring result admitted under an earlier circuit phase");
            return None;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.window.record(failed);
                if inner.window.is_full()
                    && inner.window.failure_ratio() >= self.config.failure_ratio
                {
                    warn!(
                        name = %self.name,
                        failures = inner.window.failures,
                        window = inner.window.capacity,
                        "Circuit breaker OPENED"
                    );
                    self.transition(&mut inner, CircuitState::Open);
                    return Some(CircuitState::Open);
                }
                None
            }
            CircuitState::HalfOpen => {
                if trial {
                    inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
                }
                if failed {
                    warn!(name = %self.name, "Trial call failed, circuit breaker re-OPENED");
                    self.transition(&mut inner, CircuitState::Open);
                    return Some(CircuitState::Open);
                }
                inner.trial_successes += 1;
                if inner.trial_successes >= self.config.success_threshold {
                    info!(name = %self.name, "Circuit breaker CLOSED");
                    self.transition(&mut inner, CircuitState::Closed);
                    return Some(CircuitState::Closed);
                }
                None
            }
            CircuitState::Open => None,
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }

    fn transition(&self, inner: &mut CircuitInner, to: CircuitState) {
        inner.state = to;
        inner.generation += 1;
        inner.trials_in_flight = 0;
        inner.trial_successes = 0;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(self.clock.now());
                self.times_opened.fetch_add(1, Ordering::Relaxed);
            }
            CircuitState::HalfOpen => {
                debug!(name = %self.name, "Circuit breaker transitioning to HALF-OPEN");
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.window.clear();
            }
        }
    }

    /// Force the circuit open, e.g. for maintenance.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            warn!(name = %self.name, "Circuit breaker force-opened");
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    /// Close the circuit and clear its window.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        info!(name = %self.name, "Circuit breaker reset");
        self.transition(&mut inner, CircuitState::Closed);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            state: inner.state,
            window_size: inner.window.failed.len(),
            window_failures: inner.window.failures,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            times_opened: self.times_opened.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Admission of one call through the breaker.
///
/// Must be completed with [`record`](Self::record). Dropping it unrecorded
/// (the call was cancelled) frees its half-open trial slot without counting
/// a result.
#[must_use = "an admitted call must record its result"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    recorded: bool,
}

impl CircuitPermit<'_> {
    /// Record the call result; returns the new state on a transition.
    pub fn record(mut self, failed: bool) -> Option<CircuitState> {
        self.recorded = true;
        self.breaker.record(self.generation, self.trial, failed)
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.recorded && self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}

/// Stage guarding the inner pipeline with a shared [`CircuitBreaker`].
pub struct CircuitBreakerPolicy {
    breaker: Arc<CircuitBreaker>,
    env: PolicyEnv,
}

impl CircuitBreakerPolicy {
    pub fn new(breaker: Arc<CircuitBreaker>, env: PolicyEnv) -> Self {
        Self { breaker, env }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl<T: Send + 'static> Policy<T> for CircuitBreakerPolicy {
    fn name(&self) -> &str {
        PolicyKind::CircuitBreaker.as_str()
    }

    async fn guard(&self, ctx: InvocationContext, next: Next<T>) -> Outcome<T> {
        let Some((permit, transition)) = self.breaker.try_acquire() else {
            debug!(method = %self.env.method, "Circuit breaker rejected request");
            return Outcome::CircuitOpenRejected;
        };
        if let Some(state) = transition {
            self.env
                .metrics
                .record_circuit_transition(&self.env.method, state);
        }

        let outcome = next.run(ctx).await;

        let failed = self.breaker.config().is_failure(&outcome);
        if let Some(state) = permit.record(failed) {
            self.env
                .metrics
                .record_circuit_transition(&self.env.method, state);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(config: CircuitBreakerConfig) -> (Arc<CircuitBreaker>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (CircuitBreaker::new("test", config, clock.clone()), clock)
    }

    fn call(breaker: &CircuitBreaker, failed: bool) -> Result<Option<CircuitState>, ()> {
        match breaker.try_acquire() {
            Some((permit, _)) => Ok(permit.record(failed)),
            None => Err(()),
        }
    }

    #[test]
    fn test_circuit_starts_closed() {
        let (breaker, _) = breaker(CircuitBreakerConfig::default());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(call(&breaker, false).is_ok());
    }

    #[test]
    fn test_ratio_evaluated_only_when_window_full() {
        let (breaker, _) = breaker(CircuitBreakerConfig::new().request_volume_threshold(4));

        for _ in 0..3 {
            call(&breaker, true).unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        assert_eq!(call(&breaker, true).unwrap(), Some(CircuitState::Open));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_early_successes_do_not_prevent_sliding_evaluation() {
        let (breaker, _) = breaker(
            CircuitBreakerConfig::new()
                .request_volume_threshold(4)
                .failure_ratio(0.75),
        );

        for _ in 0..4 {
            call(&breaker, false).unwrap();
        }
        call(&breaker, true).unwrap();
        call(&breaker, true).unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Leaves [ok, fail, fail, fail] in the window.
        call(&breaker, true).unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_after_delay_and_close_on_success() {
        let (breaker, clock) = breaker(
            CircuitBreakerConfig::new()
                .request_volume_threshold(2)
                .delay(Duration::from_secs(5))
                .success_threshold(2),
        );
        call(&breaker, true).unwrap();
        call(&breaker, true).unwrap();
        assert!(call(&breaker, false).is_err());

        clock.advance(Duration::from_secs(5));

        let (first, transition) = breaker.try_acquire().unwrap();
        assert_eq!(transition, Some(CircuitState::HalfOpen));
        let (second, _) = breaker.try_acquire().unwrap();
        // Only success_threshold trials may run at once.
        assert!(breaker.try_acquire().is_none());

        assert_eq!(first.record(false), None);
        assert_eq!(second.record(false), Some(CircuitState::Closed));
        assert_eq!(breaker.stats().window_size, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (breaker, clock) = breaker(
            CircuitBreakerConfig::new()
                .request_volume_threshold(1)
                .delay(Duration::from_secs(1)),
        );
        call(&breaker, true).unwrap();
        clock.advance(Duration::from_secs(1));

        assert_eq!(call(&breaker, true).unwrap(), Some(CircuitState::Open));
        assert!(call(&breaker, false).is_err());
        assert_eq!(breaker.stats().times_opened, 2);
    }

    #[test]
    fn test_dropped_trial_frees_slot() {
        let (breaker, clock) = breaker(
            CircuitBreakerConfig::new()
                .request_volume_threshold(1)
                .delay(Duration::from_secs(1)),
        );
        call(&breaker, true).unwrap();
        clock.advance(Duration::from_secs(1));

        let (permit, _) = breaker.try_acquire().unwrap();
        assert!(breaker.try_acquire().is_none());
        drop(permit);

        assert_eq!(call(&breaker, false).unwrap(), Some(CircuitState::Closed));
    }

    #[test]
    fn test_stale_result_ignored() {
        let (breaker, _) = breaker(CircuitBreakerConfig::new().request_volume_threshold(1));

        let (slow, _) = breaker.try_acquire().unwrap();
        breaker.force_open();
        breaker.reset();

        assert_eq!(slow.record(true), None);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_skip_on_counts_as_success() {
        let config = CircuitBreakerConfig::new()
            .skip_on(FailureMatcher::kinds(&[crate::outcome::OutcomeKind::TimedOut]));

        assert!(!config.is_failure(&Outcome::<()>::TimedOut(Duration::from_secs(1))));
        assert!(config.is_failure(&Outcome::<()>::Failure("boom".into())));
        assert!(!config.is_failure(&Outcome::Success(())));
    }

    #[test]
    fn test_validate() {
        assert!(CircuitBreakerConfig::new().failure_ratio(1.5).validate().is_err());
        assert!(CircuitBreakerConfig::new().request_volume_threshold(0).validate().is_err());
        assert!(CircuitBreakerConfig::new().success_threshold(0).validate().is_err());
        assert!(CircuitBreakerConfig::default().validate().is_ok());
    }
}
