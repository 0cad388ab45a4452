//! Per-target circuit breaker.
//!
//! ```text
//! CLOSED ── failure_threshold failures ──▶ OPEN
//! OPEN ── timeout elapsed (timer or next call) ──▶ HALF_OPEN
//! HALF_OPEN ── success_threshold successes ──▶ CLOSED
//! HALF_OPEN ── any qualifying failure ──▶ OPEN
//! ```
//!
//! HALF_OPEN admits one trial call at a time; callers arriving while a trial
//! is running are rejected as if the circuit were open.
//!
//! The breaker is a cheap `Arc` handle. State lives behind a `std::sync::Mutex`
//! that is only held for the bookkeeping around a call, never across the
//! operation itself. The OPEN→HALF_OPEN timer is a tokio task holding a weak
//! reference; every transition bumps a generation counter so a timer that
//! fires late cannot override a newer state.
use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::AbortHandle;

use crate::config::models::CircuitBreakerConfig;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected without reaching the target
    Open,
    /// Trial calls are let through to probe recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Errors surfaced by [`CircuitBreaker::execute`]
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// Rejected before the operation ran
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    /// The operation ran and failed; the original error is kept intact
    #[error(transparent)]
    Operation(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open { .. })
    }

    /// The operation's own error, if the operation ran.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            CircuitBreakerError::Operation(e) => Some(e),
            CircuitBreakerError::Open { .. } => None,
        }
    }
}

/// Observer fired on every transition with `(new, old, breaker_name)`.
pub type StateChangeListener = Arc<dyn Fn(CircuitState, CircuitState, &str) + Send + Sync>;

/// Decides whether an operation error counts against the breaker.
pub type FailurePredicate = Arc<dyn Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync>;

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    timer: Option<AbortHandle>,
    generation: u64,
    trial_in_flight: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            last_failure_at: None,
            opened_at: None,
            timer: None,
            generation: 0,
            trial_in_flight: false,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Reference point for the OPEN hold: the later of the last failure and
    /// the moment the circuit opened.
    fn open_since(&self) -> Option<Instant> {
        match (self.last_failure, self.opened_at) {
            (Some(failure), Some(opened)) => Some(failure.max(opened)),
            (failure, opened) => failure.or(opened),
        }
    }
}

struct Inner {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    on_state_change: Option<StateChangeListener>,
    is_failure: Option<FailurePredicate>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            state.cancel_timer();
        }
    }
}

/// Builder for [`CircuitBreaker`]
pub struct CircuitBreakerBuilder {
    name: String,
    config: CircuitBreakerConfig,
    on_state_change: Option<StateChangeListener>,
    is_failure: Option<FailurePredicate>,
}

impl CircuitBreakerBuilder {
    pub fn config(mut self, config: CircuitBreakerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn on_state_change<F>(mut self, listener: F) -> Self
    where
        F: Fn(CircuitState, CircuitState, &str) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(listener));
        self
    }

    pub fn state_listener(mut self, listener: Option<StateChangeListener>) -> Self {
        self.on_state_change = listener;
        self
    }

    pub fn is_failure<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.is_failure = Some(Arc::new(predicate));
        self
    }

    pub fn build(self) -> CircuitBreaker {
        CircuitBreaker {
            inner: Arc::new(Inner {
                name: self.name,
                config: self.config,
                state: Mutex::new(BreakerState::new()),
                on_state_change: self.on_state_change,
                is_failure: self.is_failure,
            }),
        }
    }
}

type Transition = (CircuitState, CircuitState);

/// The HALF_OPEN trial slot, released when dropped. A permit taken in an
/// earlier generation leaves the current slot alone.
struct TrialPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
}

impl Drop for TrialPermit<'_> {
    fn drop(&mut self) {
        let mut st = self.breaker.lock();
        if st.generation == self.generation {
            st.trial_in_flight = false;
        }
    }
}

/// Failure-isolation state machine guarding calls to one target.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Breaker with the given tunables and no callbacks.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::builder(name).config(config).build()
    }

    pub fn builder(name: impl Into<String>) -> CircuitBreakerBuilder {
        CircuitBreakerBuilder {
            name: name.into(),
            config: CircuitBreakerConfig::default(),
            on_state_change: None,
            is_failure: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    /// Run `operation` under the breaker.
    ///
    /// Rejects with [`CircuitBreakerError::Open`] without invoking the
    /// operation while the circuit is open and its hold has not elapsed.
    /// Operation errors are always handed back after bookkeeping.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let _trial = self.acquire()?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                if self.counts_as_failure(&error) {
                    self.record_failure();
                } else {
                    tracing::debug!(
                        breaker = %self.inner.name,
                        error = %error,
                        "Error ignored by failure predicate"
                    );
                }
                Err(CircuitBreakerError::Operation(error))
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let st = self.lock();
        CircuitBreakerStats {
            name: self.inner.name.clone(),
            state: st.state,
            failure_count: st.failure_count,
            success_count: st.success_count,
            last_failure_at: st.last_failure_at,
        }
    }

    /// Force the circuit open and (re)start the hold timer.
    pub fn open(&self) {
        self.manual(CircuitState::Open);
    }

    /// Force the circuit closed, clearing counters.
    pub fn close(&self) {
        self.manual(CircuitState::Closed);
    }

    /// Force a trial phase.
    pub fn half_open(&self) {
        self.manual(CircuitState::HalfOpen);
    }

    /// Cancel any pending timer. Safe to call repeatedly.
    pub fn dispose(&self) {
        let mut st = self.lock();
        st.cancel_timer();
        // Invalidate a timer that already fired but has not taken the lock yet
        st.generation += 1;
    }

    fn manual(&self, to: CircuitState) {
        let transition = {
            let mut st = self.lock();
            self.enter(&mut st, to)
        };
        self.notify(transition);
    }

    fn acquire<E>(&self) -> Result<Option<TrialPermit<'_>>, CircuitBreakerError<E>> {
        let (transition, permit) = {
            let mut st = self.lock();
            let transition = match st.state {
                CircuitState::Closed => return Ok(None),
                CircuitState::HalfOpen => None,
                CircuitState::Open => {
                    let elapsed = st
                        .open_since()
                        .map(|since| since.elapsed() >= self.inner.config.timeout())
                        .unwrap_or(true);
                    if !elapsed {
                        tracing::debug!(breaker = %self.inner.name, "Circuit open, rejecting call");
                        return Err(self.rejected());
                    }
                    self.enter(&mut st, CircuitState::HalfOpen)
                }
            };
            if st.trial_in_flight {
                tracing::debug!(breaker = %self.inner.name, "Trial call in flight, rejecting call");
                return Err(self.rejected());
            }
            st.trial_in_flight = true;
            let permit = TrialPermit {
                breaker: self,
                generation: st.generation,
            };
            (transition, permit)
        };
        self.notify(transition);
        Ok(Some(permit))
    }

    fn rejected<E>(&self) -> CircuitBreakerError<E> {
        CircuitBreakerError::Open {
            name: self.inner.name.clone(),
        }
    }

    fn counts_as_failure<E>(&self, error: &E) -> bool
    where
        E: std::error::Error + 'static,
    {
        match &self.inner.is_failure {
            Some(predicate) => predicate(error),
            None => true,
        }
    }

    fn record_success(&self) {
        let transition = {
            let mut st = self.lock();
            match st.state {
                CircuitState::HalfOpen => {
                    st.success_count += 1;
                    tracing::debug!(
                        breaker = %self.inner.name,
                        successes = st.success_count,
                        threshold = self.inner.config.success_threshold,
                        "Trial call succeeded"
                    );
                    if st.success_count >= self.inner.config.success_threshold {
                        self.enter(&mut st, CircuitState::Closed)
                    } else {
                        None
                    }
                }
                CircuitState::Closed => {
                    st.failure_count = 0;
                    None
                }
                // A call admitted before the circuit opened finished late
                CircuitState::Open => None,
            }
        };
        self.notify(transition);
    }

    fn record_failure(&self) {
        let transition = {
            let mut st = self.lock();
            st.failure_count += 1;
            st.last_failure = Some(Instant::now());
            st.last_failure_at = Some(Utc::now());

            match st.state {
                CircuitState::HalfOpen => {
                    tracing::warn!(
                        breaker = %self.inner.name,
                        "Trial call failed, re-opening circuit"
                    );
                    self.enter(&mut st, CircuitState::Open)
                }
                CircuitState::Closed => {
                    tracing::debug!(
                        breaker = %self.inner.name,
                        failures = st.failure_count,
                        threshold = self.inner.config.failure_threshold,
                        "Call failed"
                    );
                    if st.failure_count >= self.inner.config.failure_threshold {
                        self.enter(&mut st, CircuitState::Open)
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            }
        };
        self.notify(transition);
    }

    /// Apply the side effects of entering `to`. Returns the transition to
    /// report once the lock is released, or `None` if the state did not change.
    fn enter(&self, st: &mut BreakerState, to: CircuitState) -> Option<Transition> {
        let from = st.state;
        st.generation += 1;
        st.trial_in_flight = false;
        st.cancel_timer();

        match to {
            CircuitState::Closed => {
                st.failure_count = 0;
                st.success_count = 0;
                st.opened_at = None;
            }
            CircuitState::HalfOpen => {
                st.success_count = 0;
            }
            CircuitState::Open => {
                st.opened_at = Some(Instant::now());
                self.schedule_half_open(st);
            }
        }
        st.state = to;

        if from == to {
            return None;
        }
        match to {
            CircuitState::Open => tracing::warn!(
                breaker = %self.inner.name,
                from = %from,
                failures = st.failure_count,
                "Circuit opened"
            ),
            _ => tracing::info!(
                breaker = %self.inner.name,
                from = %from,
                to = %to,
                "Circuit state changed"
            ),
        }
        Some((to, from))
    }

    fn schedule_half_open(&self, st: &mut BreakerState) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(
                breaker = %self.inner.name,
                "No async runtime; half-open transition will happen on the next call"
            );
            return;
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let generation = st.generation;
        let hold: Duration = self.inner.config.timeout();

        let task = runtime.spawn(async move {
            tokio::time::sleep(hold).await;
            if let Some(inner) = weak.upgrade() {
                CircuitBreaker { inner }.on_hold_elapsed(generation);
            }
        });
        st.timer = Some(task.abort_handle());
    }

    fn on_hold_elapsed(&self, generation: u64) {
        let transition = {
            let mut st = self.lock();
            if st.generation != generation || st.state != CircuitState::Open {
                return;
            }
            // This task is the timer being cleared; don't abort ourselves
            st.timer = None;
            self.enter(&mut st, CircuitState::HalfOpen)
        };
        self.notify(transition);
    }

    fn notify(&self, transition: Option<Transition>) {
        if let (Some((new, old)), Some(listener)) = (transition, &self.inner.on_state_change) {
            listener(new, old, &self.inner.name);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
