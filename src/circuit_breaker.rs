//! Per-operation circuit breaker.
//!
//! A breaker starts CLOSED and lives for the life of the process. Only the
//! bookkeeping around a call is serialized by the breaker's mutex; the
//! wrapped function always runs with the lock released.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{errors, SyncError, SyncResult};

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_SUCCESS_THRESHOLD: u32 = 3;
const DEFAULT_TIMEOUT_SECONDS: f64 = 60.0;
const DEFAULT_RESET_TIMEOUT_SECONDS: f64 = 300.0;
const DEFAULT_MAX_TIMEOUT_SECONDS: f64 = 3600.0;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Seconds as a [`Duration`], saturating at [`Duration::MAX`] for values
/// too large to represent. NaN and non-positive values are zero.
pub fn saturating_duration(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in CLOSED before opening
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive successes in HALF_OPEN before closing
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Time spent OPEN before a trial call is admitted
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    /// Informational only
    #[serde(default = "default_reset_timeout_seconds")]
    pub reset_timeout_seconds: f64,
    /// Ceiling for an escalated open timeout
    #[serde(default = "default_max_timeout_seconds")]
    pub max_timeout_seconds: f64,
    /// Reserved for escalating the open timeout; not applied between opens
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_success_threshold() -> u32 {
    DEFAULT_SUCCESS_THRESHOLD
}

fn default_timeout_seconds() -> f64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_reset_timeout_seconds() -> f64 {
    DEFAULT_RESET_TIMEOUT_SECONDS
}

fn default_max_timeout_seconds() -> f64 {
    DEFAULT_MAX_TIMEOUT_SECONDS
}

fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            reset_timeout_seconds: DEFAULT_RESET_TIMEOUT_SECONDS,
            max_timeout_seconds: DEFAULT_MAX_TIMEOUT_SECONDS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl CircuitBreakerConfig {
    /// Config with the given failure threshold and open timeout, defaults elsewhere
    pub fn new(failure_threshold: u32, timeout_seconds: f64) -> Self {
        Self {
            failure_threshold,
            timeout_seconds,
            ..Self::default()
        }
    }

    pub fn with_success_threshold(mut self, success_threshold: u32) -> Self {
        self.success_threshold = success_threshold;
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.failure_threshold == 0 {
            return Err(errors::invalid_input("failure_threshold must be at least 1"));
        }
        if self.success_threshold == 0 {
            return Err(errors::invalid_input("success_threshold must be at least 1"));
        }
        if !(self.timeout_seconds > 0.0) {
            return Err(errors::invalid_input("timeout_seconds must be positive"));
        }
        if self.max_timeout_seconds < self.timeout_seconds {
            return Err(errors::invalid_input(
                "max_timeout_seconds must not be below timeout_seconds",
            ));
        }
        Ok(())
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected without running
    Open,
    /// Trial calls pass through
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Counters and timings for one breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Every admission check, including rejected ones
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub state_changes: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub current_timeout_seconds: f64,
}

impl CircuitBreakerStats {
    fn new(timeout_seconds: f64) -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
            state_changes: 0,
            last_failure_time: None,
            last_success_time: None,
            current_timeout_seconds: timeout_seconds,
        }
    }

    /// Fraction of requests that succeeded, 0 before any request
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

/// State guarded by the breaker mutex
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    stats: CircuitBreakerStats,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_state_change: Instant,
}

impl BreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            stats: CircuitBreakerStats::new(config.timeout_seconds),
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_state_change: Instant::now(),
        }
    }

    fn seconds_in_state(&self) -> f64 {
        self.last_state_change.elapsed().as_secs_f64()
    }

    fn transition_to_open(&mut self, name: &str, config: &CircuitBreakerConfig) {
        if self.state == CircuitState::Open {
            return;
        }
        let old_state = self.state;
        self.state = CircuitState::Open;
        self.stats.state_changes += 1;
        self.last_state_change = Instant::now();
        self.stats.current_timeout_seconds = config.timeout_seconds;

        error!(
            name,
            from = %old_state,
            consecutive_failures = self.consecutive_failures,
            timeout_seconds = self.stats.current_timeout_seconds,
            "Circuit breaker opened"
        );
    }

    fn transition_to_half_open(&mut self, name: &str) {
        if self.state == CircuitState::HalfOpen {
            return;
        }
        let old_state = self.state;
        self.state = CircuitState::HalfOpen;
        self.stats.state_changes += 1;
        self.last_state_change = Instant::now();
        self.consecutive_successes = 0;

        info!(name, from = %old_state, "Circuit breaker half-open, admitting trial calls");
    }

    fn transition_to_closed(&mut self, name: &str, config: &CircuitBreakerConfig) {
        if self.state == CircuitState::Closed {
            return;
        }
        let old_state = self.state;
        self.state = CircuitState::Closed;
        self.stats.state_changes += 1;
        self.last_state_change = Instant::now();
        self.consecutive_failures = 0;
        self.stats.current_timeout_seconds = config.timeout_seconds;

        info!(name, from = %old_state, "Circuit breaker closed");
    }

    /// OPEN becomes HALF_OPEN once the current timeout has elapsed
    fn check_timeout(&mut self, name: &str) {
        if self.state == CircuitState::Open
            && self.seconds_in_state() >= self.stats.current_timeout_seconds
        {
            self.transition_to_half_open(name);
        }
    }

    fn retry_after(&self) -> Duration {
        if self.state != CircuitState::Open {
            return Duration::ZERO;
        }
        saturating_duration(self.stats.current_timeout_seconds - self.seconds_in_state())
    }
}

/// Named CLOSED / OPEN / HALF_OPEN state machine guarding one operation
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!(name = %name, ?config, "Initialized circuit breaker");
        Self {
            inner: Mutex::new(BreakerInner::new(&config)),
            name,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Lock the breaker state, recovering from poison. A poisoned lock can
    /// only leave slightly stale counters behind.
    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!(name = %self.name, "Circuit breaker mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run `f` through the breaker.
    ///
    /// Returns [`SyncError::CircuitOpen`] without calling `f` while the
    /// breaker is OPEN. Otherwise `f`'s own result is returned unchanged
    /// after its outcome has been recorded.
    pub fn call<F, T>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce() -> SyncResult<T>,
    {
        self.admit()?;

        match f() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    fn admit(&self) -> SyncResult<()> {
        let mut inner = self.lock();
        // Rejections count as requests too
        inner.stats.total_requests += 1;
        inner.check_timeout(&self.name);

        if inner.state == CircuitState::Open {
            inner.stats.rejected_requests += 1;
            let retry_after = inner.retry_after();
            warn!(
                name = %self.name,
                retry_after_ms = retry_after.as_millis() as u64,
                "Circuit breaker is open, rejecting request"
            );
            return Err(SyncError::CircuitOpen {
                name: self.name.clone(),
                retry_after,
            });
        }

        Ok(())
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        inner.stats.successful_requests += 1;
        inner.stats.last_success_time = Some(Utc::now());
        // A success breaks any failure streak
        inner.consecutive_failures = 0;
        inner.consecutive_successes += 1;

        debug!(
            name = %self.name,
            state = %inner.state,
            consecutive_successes = inner.consecutive_successes,
            "Circuit breaker recorded success"
        );

        if inner.state == CircuitState::HalfOpen
            && inner.consecutive_successes >= self.config.success_threshold
        {
            inner.transition_to_closed(&self.name, &self.config);
        }
    }

    fn record_failure(&self, err: &SyncError) {
        let mut inner = self.lock();
        inner.stats.failed_requests += 1;
        inner.stats.last_failure_time = Some(Utc::now());
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;

        debug!(
            name = %self.name,
            state = %inner.state,
            consecutive_failures = inner.consecutive_failures,
            error = %err,
            "Circuit breaker recorded failure"
        );

        // Any failed trial call reopens; CLOSED waits for the threshold
        match inner.state {
            CircuitState::HalfOpen => inner.transition_to_open(&self.name, &self.config),
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                inner.transition_to_open(&self.name, &self.config)
            }
            _ => {}
        }
    }

    /// Current state, after applying any due OPEN -> HALF_OPEN transition
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        inner.check_timeout(&self.name);
        inner.state
    }

    /// Snapshot of the breaker statistics
    pub fn stats(&self) -> CircuitBreakerStats {
        self.lock().stats.clone()
    }

    /// How long until an OPEN breaker admits a trial call
    pub fn retry_after(&self) -> Duration {
        self.lock().retry_after()
    }

    /// Back to CLOSED with zeroed statistics
    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = BreakerInner::new(&self.config);
        info!(name = %self.name, "Circuit breaker has been reset");
    }

    /// Force OPEN, for maintenance and tests
    pub fn force_open(&self) {
        let mut inner = self.lock();
        inner.transition_to_open(&self.name, &self.config);
        warn!(name = %self.name, "Circuit breaker was forced open");
    }

    /// Force CLOSED, for maintenance and tests
    pub fn force_closed(&self) {
        let mut inner = self.lock();
        inner.transition_to_closed(&self.name, &self.config);
        info!(name = %self.name, "Circuit breaker was forced closed");
    }
}
