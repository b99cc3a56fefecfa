//! Circuit breaker for channel senders and other flaky dependencies
//!
//! Three states:
//! - Closed: normal operation, calls pass through
//! - Open: failures exceeded the threshold, calls are rejected
//! - HalfOpen: after the reset timeout, a limited number of trial calls
//!   probe whether the dependency recovered
//!
//! The open condition is evaluated two ways after every failure: a
//! consecutive-failure count, and a count of failures inside a sliding
//! window when one is configured. The Open → HalfOpen transition happens
//! lazily on the next call once the reset timeout has elapsed, so there is
//! no background reset task to cancel on teardown.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed,
    /// Failures exceeded threshold - calls are rejected
    Open,
    /// Testing recovery - limited trial calls pass through
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

/// Decides whether an error counts toward the failure threshold.
pub type FailurePredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Callback invoked on every breaker event.
pub type MonitorCallback = Arc<dyn Fn(&BreakerEvent) + Send + Sync>;

/// Type-erased value produced by a configured fallback.
pub type FallbackValue = Box<dyn Any + Send>;

/// Fallback invoked when the breaker rejects a call while open. The value
/// is type-erased so one config type serves every `execute` result type;
/// [`fallback_fn`] does the boxing.
pub type FallbackFn = Arc<dyn Fn() -> BoxFuture<'static, Result<FallbackValue>> + Send + Sync>;

/// Wrap an async closure as a [`FallbackFn`].
pub fn fallback_fn<T, F, Fut>(f: F) -> FallbackFn
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    Arc::new(move || {
        let fut = f();
        Box::pin(async move { fut.await.map(|value| Box::new(value) as FallbackValue) })
    })
}

/// Observable breaker events.
#[derive(Debug, Clone)]
pub enum BreakerEvent {
    /// State transition
    StateChanged {
        /// Breaker name
        name: String,
        /// Previous state
        from: CircuitState,
        /// New state
        to: CircuitState,
    },
    /// A call succeeded
    Success {
        /// Breaker name
        name: String,
    },
    /// A call failed (including timeouts)
    Failure {
        /// Breaker name
        name: String,
    },
    /// A call exceeded the request timeout
    Timeout {
        /// Breaker name
        name: String,
    },
    /// A call was rejected while open
    Rejected {
        /// Breaker name
        name: String,
    },
}

/// Configuration for a circuit breaker. Immutable after construction.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Failures (consecutive, or within the window) before opening
    pub failure_threshold: u32,
    /// Sliding window for counting failures; `None` disables the
    /// windowed check and leaves only the consecutive one
    pub failure_window: Option<Duration>,
    /// Fraction of half-open trial calls that must succeed to close (0..1)
    pub success_threshold: f64,
    /// How long to stay open before allowing trial calls
    pub reset_timeout: Duration,
    /// Number of trial calls evaluated in half-open
    pub test_requests: u32,
    /// Per-call timeout; a timeout counts as a failure
    pub request_timeout: Option<Duration>,
    /// Which errors count toward the threshold (default: all)
    pub is_failure: Option<FailurePredicate>,
    /// Invoked synchronously on every breaker event
    pub monitor: Option<MonitorCallback>,
    /// Answers rejected calls while open instead of [`Error::BreakerOpen`]
    pub fallback: Option<FallbackFn>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Some(Duration::from_secs(60)),
            success_threshold: 0.5,
            reset_timeout: Duration::from_secs(30),
            test_requests: 3,
            request_timeout: Some(Duration::from_secs(10)),
            is_failure: None,
            monitor: None,
            fallback: None,
        }
    }
}

impl std::fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("failure_window", &self.failure_window)
            .field("success_threshold", &self.success_threshold)
            .field("reset_timeout", &self.reset_timeout)
            .field("test_requests", &self.test_requests)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set failure threshold
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the sliding failure window
    #[must_use]
    pub fn with_failure_window(mut self, window: Option<Duration>) -> Self {
        self.failure_window = window;
        self
    }

    /// Set the half-open success fraction (clamped to 0..=1)
    #[must_use]
    pub fn with_success_threshold(mut self, fraction: f64) -> Self {
        self.success_threshold = fraction.clamp(0.0, 1.0);
        self
    }

    /// Set reset timeout
    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the number of half-open trial calls
    #[must_use]
    pub fn with_test_requests(mut self, count: u32) -> Self {
        self.test_requests = count.max(1);
        self
    }

    /// Set per-call timeout
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the failure predicate
    #[must_use]
    pub fn with_is_failure(mut self, predicate: FailurePredicate) -> Self {
        self.is_failure = Some(predicate);
        self
    }

    /// Set the monitor callback
    #[must_use]
    pub fn with_monitor(mut self, monitor: MonitorCallback) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Set the open-state fallback
    #[must_use]
    pub fn with_fallback(mut self, fallback: FallbackFn) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

/// Counter snapshot for observability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Total failures recorded
    pub failures: u64,
    /// Total successes recorded
    pub successes: u64,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Successes since the last failure
    pub consecutive_successes: u32,
    /// Total calls attempted (including rejected ones)
    pub total_requests: u64,
}

struct BreakerState {
    state: CircuitState,
    failures: u64,
    successes: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_requests: u64,
    failure_times: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_attempts: u32,
    half_open_successes: u32,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_requests: 0,
            failure_times: VecDeque::new(),
            opened_at: None,
            half_open_attempts: 0,
            half_open_successes: 0,
        }
    }
}

/// Circuit breaker wrapping a fallible async operation.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    events: broadcast::Sender<BreakerEvent>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
            events,
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Get the breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Get a counter snapshot
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        let state = self.lock();
        BreakerStats {
            state: state.state,
            failures: state.failures,
            successes: state.successes,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            total_requests: state.total_requests,
        }
    }

    /// Subscribe to breaker events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    /// Run `op` through the breaker.
    ///
    /// In Closed state the operation runs under the request timeout and its
    /// outcome is recorded. In Open state the call is rejected without
    /// invoking `op`: a configured fallback answers it, otherwise the caller
    /// gets [`Error::BreakerOpen`]. Once the reset timeout has elapsed the
    /// breaker moves to HalfOpen instead and lets the call through as a
    /// trial request.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        T: 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.admit() {
            self.emit(BreakerEvent::Rejected {
                name: self.name.clone(),
            });
            if let Some(fallback) = &self.config.fallback {
                debug!(name = %self.name, "breaker open, answering with configured fallback");
                match fallback().await?.downcast::<T>() {
                    Ok(value) => return Ok(*value),
                    Err(_) => {
                        warn!(name = %self.name, "configured fallback returned the wrong type");
                    }
                }
            }
            return Err(Error::BreakerOpen {
                name: self.name.clone(),
            });
        }

        let outcome = match self.config.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, op()).await {
                Ok(result) => result,
                Err(_) => {
                    self.emit(BreakerEvent::Timeout {
                        name: self.name.clone(),
                    });
                    self.record_failure();
                    return Err(Error::BreakerTimeout {
                        name: self.name.clone(),
                    });
                }
            },
            None => op().await,
        };

        match outcome {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                if self.counts_as_failure(&error) {
                    self.record_failure();
                } else {
                    debug!(name = %self.name, error = %error, "error excluded by failure predicate");
                }
                Err(error)
            }
        }
    }

    /// Like [`execute`](Self::execute), but a breaker-open rejection runs
    /// the per-call `fallback` and returns its result instead. A configured
    /// fallback takes precedence; this one only sees rejections the config
    /// left unanswered. Fallback errors propagate unmodified.
    pub async fn execute_or<T, F, Fut, FB, FBFut>(&self, op: F, fallback: FB) -> Result<T>
    where
        T: 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce() -> FBFut,
        FBFut: Future<Output = Result<T>>,
    {
        match self.execute(op).await {
            Err(Error::BreakerOpen { .. }) => fallback().await,
            other => other,
        }
    }

    /// Whether a call would currently be admitted.
    #[must_use]
    pub fn can_execute(&self) -> bool {
        let state = self.lock();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => state
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.config.reset_timeout),
        }
    }

    /// Record an out-of-band success (a call made outside `execute`).
    pub fn record_success(&self) {
        let mut state = self.lock();
        state.successes += 1;
        state.consecutive_successes += 1;
        state.consecutive_failures = 0;

        match state.state {
            CircuitState::Closed | CircuitState::Open => {}
            CircuitState::HalfOpen => {
                state.half_open_attempts += 1;
                state.half_open_successes += 1;
                let attempts = state.half_open_attempts;
                let rate = f64::from(state.half_open_successes) / f64::from(attempts);
                debug!(
                    name = %self.name,
                    attempts,
                    rate,
                    "trial success in half-open state"
                );
                if attempts >= self.config.test_requests && rate >= self.config.success_threshold {
                    self.transition(&mut state, CircuitState::Closed);
                }
            }
        }
        drop(state);
        self.emit(BreakerEvent::Success {
            name: self.name.clone(),
        });
    }

    /// Record an out-of-band failure.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        state.failures += 1;
        state.consecutive_failures += 1;
        state.consecutive_successes = 0;

        if let Some(window) = self.config.failure_window {
            state.failure_times.push_back(now);
            while state
                .failure_times
                .front()
                .is_some_and(|t| now.duration_since(*t) > window)
            {
                state.failure_times.pop_front();
            }
        }

        match state.state {
            CircuitState::Closed => {
                let windowed = state.failure_times.len() as u32;
                if state.consecutive_failures >= self.config.failure_threshold
                    || (self.config.failure_window.is_some()
                        && windowed >= self.config.failure_threshold)
                {
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // Any failing trial reopens immediately.
                state.half_open_attempts += 1;
                warn!(name = %self.name, "trial failure in half-open state, reopening");
                self.transition(&mut state, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
        drop(state);
        self.emit(BreakerEvent::Failure {
            name: self.name.clone(),
        });
    }

    /// Force the breaker back to Closed and reset all counters.
    pub fn reset(&self) {
        let mut state = self.lock();
        if state.state != CircuitState::Closed {
            self.transition(&mut state, CircuitState::Closed);
        }
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;
        state.failure_times.clear();
    }

    /// Admit a call, performing the lazy Open -> HalfOpen transition.
    fn admit(&self) -> bool {
        let mut state = self.lock();
        state.total_requests += 1;
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.reset_timeout);
                if elapsed {
                    self.transition(&mut state, CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn counts_as_failure(&self, error: &Error) -> bool {
        match &self.config.is_failure {
            Some(predicate) => predicate(error),
            None => true,
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        let from = state.state;
        if from == to {
            return;
        }
        state.state = to;
        match to {
            CircuitState::Open => {
                state.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                state.half_open_attempts = 0;
                state.half_open_successes = 0;
            }
            CircuitState::Closed => {
                state.opened_at = None;
                state.consecutive_failures = 0;
                state.failure_times.clear();
            }
        }
        info!(name = %self.name, %from, %to, "circuit breaker state change");
        self.emit(BreakerEvent::StateChanged {
            name: self.name.clone(),
            from,
            to,
        });
    }

    fn emit(&self, event: BreakerEvent) {
        if let Some(monitor) = &self.config.monitor {
            monitor(&event);
        }
        let _ = self.events.send(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Explicit registry of named breakers, owned by the composition root.
///
/// One breaker per name: repeated `get_or_create` calls with the same name
/// return the same instance so unrelated modules wrapping the same
/// dependency share its state.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the breaker for `name`, creating it with `config` if absent.
    pub fn get_or_create(
        &self,
        name: &str,
        config: impl FnOnce() -> CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        if let Some(existing) = self
            .breakers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
        {
            return Arc::clone(existing);
        }
        let mut breakers = self.breakers.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config()))),
        )
    }

    /// Look up a breaker without creating it.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    /// Detach a breaker. Existing holders keep their Arc; the registry will
    /// create a fresh instance on the next `get_or_create`.
    pub fn remove(&self, name: &str) -> bool {
        self.breakers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name)
            .is_some()
    }

    /// Names of all registered breakers.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.breakers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests;
