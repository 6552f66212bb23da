//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a service
//! is experiencing issues. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Service is unhealthy, requests fail immediately
//! - HalfOpen: Testing if service has recovered
//!
//! Both thresholds are ratios over a fixed number of executions:
//!
//! ```text
//! Closed   → Open:     failures/executions >= failure ratio, once the window is full
//! Open     → HalfOpen: first call after `delay` has elapsed
//! HalfOpen → Closed:   successes/executions >= success ratio over the trial window
//! HalfOpen → Open:     trial window falls short of the success ratio
//! ```
//!
//! While half-open, at most `success_threshold.denominator` trial calls are let
//! through concurrently; further calls are rejected as if the circuit were open.

use super::error::ResilienceError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing service recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// A `numerator` out of `denominator` threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ratio {
    pub numerator: u32,
    pub denominator: u32,
}

impl Ratio {
    /// Create a ratio. A zero denominator yields `0/1`.
    pub fn new(numerator: u32, denominator: u32) -> Self {
        if denominator == 0 {
            Self {
                numerator: 0,
                denominator: 1,
            }
        } else {
            Self {
                numerator,
                denominator,
            }
        }
    }

    /// `hits / total >= numerator / denominator`, compared without floats
    fn is_met_by(&self, hits: usize, total: usize) -> bool {
        (hits as u64) * (self.denominator as u64) >= (self.numerator as u64) * (total as u64)
    }

    fn is_whole(&self) -> bool {
        self.numerator >= self.denominator
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures out of executions that open the circuit
    pub failure_threshold: Ratio,
    /// Successes out of trial executions that close a half-open circuit
    pub success_threshold: Ratio,
    /// Dwell time in the open state before a trial call is allowed
    pub delay: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: Ratio::new(5, 5),
            success_threshold: Ratio::new(2, 2),
            delay: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Derive ratio thresholds from plain counts.
    ///
    /// A non-positive execution window falls back to the threshold itself, and a
    /// window smaller than its threshold is raised to match it.
    pub fn from_counts(
        failure_threshold: u32,
        failure_executions: u32,
        success_threshold: u32,
        success_executions: u32,
        delay: Duration,
    ) -> Self {
        let failure_window = effective_window(failure_threshold, failure_executions);
        let success_window = effective_window(success_threshold, success_executions);
        Self {
            failure_threshold: Ratio::new(failure_threshold, failure_window),
            success_threshold: Ratio::new(success_threshold, success_window),
            delay,
        }
    }
}

fn effective_window(threshold: u32, executions: u32) -> u32 {
    let window = if executions > 0 { executions } else { threshold };
    window.max(threshold)
}

/// Errors produced by a protected call
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, the call was not attempted
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// The call ran and failed
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

/// Fixed-size record of the most recent results
#[derive(Debug)]
struct Window {
    results: VecDeque<bool>,
    capacity: usize,
    failures: usize,
}

impl Window {
    fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1) as usize;
        Self {
            results: VecDeque::with_capacity(capacity),
            capacity,
            failures: 0,
        }
    }

    fn push(&mut self, success: bool) {
        if self.results.len() == self.capacity {
            if let Some(false) = self.results.pop_front() {
                self.failures -= 1;
            }
        }
        if !success {
            self.failures += 1;
        }
        self.results.push_back(success);
    }

    fn len(&self) -> usize {
        self.results.len()
    }

    fn successes(&self) -> usize {
        self.results.len() - self.failures
    }

    fn is_full(&self) -> bool {
        self.results.len() == self.capacity
    }
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    window: Window,
    opened_at: Option<Instant>,
    trial_calls: usize,
    generation: u64,
}

/// Circuit breaker for protecting against cascading failures
///
/// # Example
/// ```no_run
/// use kvconnect_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
///
/// #[tokio::main]
/// async fn main() {
///     let breaker = CircuitBreaker::new("cache", CircuitBreakerConfig::default());
///
///     let result = breaker
///         .call(|| async { Ok::<_, ResilienceError>(42) }, |_| true)
///         .await;
///     assert_eq!(result.unwrap(), 42);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            breaker = %name,
            failure_threshold = %config.failure_threshold,
            success_threshold = %config.success_threshold,
            delay_ms = config.delay.as_millis() as u64,
            "Circuit breaker initialized"
        );
        let window = Window::new(config.failure_threshold.denominator);
        Self {
            name,
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CircuitBreakerState {
                state: CircuitState::Closed,
                window,
                opened_at: None,
                trial_calls: 0,
                generation: 0,
            })),
        }
    }

    /// Name used in log records
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Failures recorded in the current window
    pub fn failure_count(&self) -> usize {
        self.state.lock().window.failures
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut state = self.state.lock();
        self.transition(&mut state, CircuitState::Closed);
    }

    /// Ask permission for one execution.
    ///
    /// The returned permit must be resolved with [`CallPermit::record_success`] or
    /// [`CallPermit::record_failure`]. A permit dropped during a panic counts as a
    /// failure; a permit dropped otherwise (cancelled call) records nothing.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, ResilienceError> {
        let mut state = self.state.lock();

        if state.state == CircuitState::Open {
            let elapsed = state
                .opened_at
                .map(|at| at.elapsed() >= self.config.delay)
                .unwrap_or(true);
            if !elapsed {
                return Err(ResilienceError::CircuitOpen);
            }
            self.transition(&mut state, CircuitState::HalfOpen);
        }

        let trial = state.state == CircuitState::HalfOpen;
        if trial {
            if state.trial_calls >= self.config.success_threshold.denominator as usize {
                return Err(ResilienceError::CircuitOpen);
            }
            state.trial_calls += 1;
        }

        Ok(CallPermit {
            breaker: self,
            generation: state.generation,
            trial,
            resolved: false,
        })
    }

    /// Execute an operation under circuit breaker protection.
    ///
    /// `is_failure` decides whether an error counts against the breaker; errors
    /// it rejects are recorded as successes and still returned to the caller.
    pub async fn call<F, Fut, T, E, P>(
        &self,
        op: F,
        is_failure: P,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let permit = self
            .try_acquire()
            .map_err(|_| CircuitBreakerError::CircuitOpen {
                component: self.name.to_string(),
            })?;

        match op().await {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(e) => {
                if is_failure(&e) {
                    permit.record_failure();
                } else {
                    permit.record_success();
                }
                Err(CircuitBreakerError::OperationFailed(e))
            }
        }
    }

    fn record(&self, generation: u64, trial: bool, success: bool) {
        let mut state = self.state.lock();
        if trial && state.generation == generation {
            state.trial_calls = state.trial_calls.saturating_sub(1);
        }

        match state.state {
            CircuitState::Closed => {
                state.window.push(success);
                if state.window.is_full()
                    && self
                        .config
                        .failure_threshold
                        .is_met_by(state.window.failures, state.window.len())
                {
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                state.window.push(success);
                let threshold = self.config.success_threshold;
                let decided = state.window.is_full()
                    || (threshold.is_whole() && state.window.failures > 0);
                if decided {
                    if threshold.is_met_by(state.window.successes(), state.window.len()) {
                        self.transition(&mut state, CircuitState::Closed);
                    } else {
                        self.transition(&mut state, CircuitState::Open);
                    }
                }
            }
            CircuitState::Open => {
                debug!(breaker = %self.name, success, "Result recorded while circuit is open");
            }
        }
    }

    fn release(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.trial_calls = state.trial_calls.saturating_sub(1);
        }
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: CircuitState) {
        state.state = to;
        state.generation += 1;
        state.trial_calls = 0;
        match to {
            CircuitState::Closed => {
                state.window = Window::new(self.config.failure_threshold.denominator);
                state.opened_at = None;
                info!(breaker = %self.name, "Circuit breaker closed");
            }
            CircuitState::Open => {
                state.opened_at = Some(Instant::now());
                warn!(
                    breaker = %self.name,
                    delay_ms = self.config.delay.as_millis() as u64,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                state.window = Window::new(self.config.success_threshold.denominator);
                info!(breaker = %self.name, "Circuit breaker half-opened");
            }
        }
    }
}

/// Permission for a single execution through the breaker
#[derive(Debug)]
#[must_use = "an unresolved permit records nothing"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    resolved: bool,
}

impl CallPermit<'_> {
    /// Record a successful (or breaker-irrelevant) outcome
    pub fn record_success(mut self) {
        self.resolved = true;
        self.breaker.record(self.generation, self.trial, true);
    }

    /// Record a breaker-relevant failure
    pub fn record_failure(mut self) {
        self.resolved = true;
        self.breaker.record(self.generation, self.trial, false);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        if std::thread::panicking() {
            self.breaker.record(self.generation, self.trial, false);
        } else if self.trial {
            self.breaker.release(self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failures: u32, window: u32, successes: u32, delay_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig::from_counts(
            failures,
            window,
            successes,
            successes,
            Duration::from_millis(delay_ms),
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        breaker.call(|| async { Err("boom") }, |_| true).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        breaker.call(|| async { Ok(()) }, |_| true).await
    }

    #[test]
    fn test_ratio_zero_denominator() {
        assert_eq!(Ratio::new(3, 0), Ratio::new(0, 1));
    }

    #[test]
    fn test_from_counts_derivation() {
        let cfg = CircuitBreakerConfig::from_counts(5, 0, 2, 1, Duration::from_secs(1));
        assert_eq!(cfg.failure_threshold, Ratio::new(5, 5));
        // Window smaller than the threshold is raised
        assert_eq!(cfg.success_threshold, Ratio::new(2, 2));

        let cfg = CircuitBreakerConfig::from_counts(3, 10, 1, 4, Duration::from_secs(1));
        assert_eq!(cfg.failure_threshold, Ratio::new(3, 10));
        assert_eq!(cfg.success_threshold, Ratio::new(1, 4));
    }

    #[tokio::test]
    async fn test_circuit_breaker_closed_to_open() {
        let breaker = CircuitBreaker::new("test", config(3, 3, 1, 100));

        for _ in 0..3 {
            assert!(fail(&breaker).await.is_err());
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        let result = succeed(&breaker).await;
        assert!(matches!(
            result,
            Err(CircuitBreakerError::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_window_must_fill_before_opening() {
        let breaker = CircuitBreaker::new("test", config(2, 4, 1, 100));

        assert!(fail(&breaker).await.is_err());
        assert!(fail(&breaker).await.is_err());
        // Two of two failed, but the window of four is not full yet
        assert_eq!(breaker.state(), CircuitState::Closed);

        succeed(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_rolling_window_forgets_old_failures() {
        let breaker = CircuitBreaker::new("test", config(3, 3, 1, 100));

        assert!(fail(&breaker).await.is_err());
        assert!(fail(&breaker).await.is_err());
        succeed(&breaker).await.unwrap();
        assert!(fail(&breaker).await.is_err());
        // Window holds [fail, ok, fail]
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 2);
    }

    #[tokio::test]
    async fn test_irrelevant_failures_do_not_open() {
        let breaker = CircuitBreaker::new("test", config(2, 2, 1, 100));

        for _ in 0..5 {
            let result: Result<(), _> = breaker.call(|| async { Err("bad input") }, |_| false).await;
            assert!(matches!(result, Err(CircuitBreakerError::OperationFailed("bad input"))));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_half_open_to_closed() {
        let breaker = CircuitBreaker::new("test", config(2, 2, 2, 50));

        for _ in 0..2 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", config(1, 1, 2, 50));

        let _ = fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_trial_calls() {
        let breaker = CircuitBreaker::new("test", config(1, 1, 1, 50));

        let _ = fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let first = breaker.try_acquire().expect("trial permit");
        assert!(matches!(
            breaker.try_acquire(),
            Err(ResilienceError::CircuitOpen)
        ));

        // A cancelled trial frees its slot without deciding anything
        drop(first);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let second = breaker.try_acquire().expect("slot freed");
        second.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_panic_counts_as_failure() {
        let breaker = CircuitBreaker::new("test", config(1, 1, 1, 1000));

        let b = breaker.clone();
        let handle = tokio::spawn(async move {
            let _: Result<(), CircuitBreakerError<()>> = b
                .call(
                    || async {
                        let fatal = true;
                        if fatal {
                            panic!("fatal");
                        }
                        Ok(())
                    },
                    |_| false,
                )
                .await;
        });
        assert!(handle.await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_reset() {
        let breaker = CircuitBreaker::new("test", config(1, 1, 1, 1000));

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }
}
