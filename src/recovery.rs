use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{saturating_duration, CircuitBreakerConfig};
use crate::classifier::{Classification, ErrorClassifier, RecoveryAction, StrategyDescriptor};
use crate::error::{errors, ErrorCategory, ErrorSeverity, OperationContext, SyncError, SyncResult};
use crate::registry::{CircuitBreakerRegistry, HealthSummary};

const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_RETRY_DELAY_SECONDS: f64 = 2.0;
const DEFAULT_MAX_RETRY_DELAY_SECONDS: f64 = 60.0;
const DEFAULT_JITTER_FACTOR: f64 = 0.1;
const DEFAULT_CB_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_CB_TIMEOUT_SECONDS: f64 = 60.0;

/// Floor applied to a jittered delay
const MIN_JITTERED_DELAY_SECONDS: f64 = 0.1;

/// Retry and circuit-breaking behaviour of a [`RecoveryManager`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Attempts per operation, including the first
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_base_retry_delay")]
    pub base_retry_delay_seconds: f64,
    /// Caps a single wait between attempts
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_seconds: f64,
    /// Jitter spread as a fraction of the computed delay
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    #[serde(default = "default_circuit_breaker_enabled")]
    pub circuit_breaker_enabled: bool,
    #[serde(default = "default_cb_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_cb_timeout")]
    pub circuit_breaker_timeout_seconds: f64,
    #[serde(default = "default_exponential_backoff")]
    pub enable_exponential_backoff: bool,
    #[serde(default = "default_jitter")]
    pub enable_jitter: bool,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

fn default_max_retry_attempts() -> u32 {
    env_or("CONTACT_SYNC_MAX_RETRY_ATTEMPTS", DEFAULT_MAX_RETRY_ATTEMPTS)
}

fn default_base_retry_delay() -> f64 {
    env_or("CONTACT_SYNC_BASE_RETRY_DELAY", DEFAULT_BASE_RETRY_DELAY_SECONDS)
}

fn default_max_retry_delay() -> f64 {
    env_or("CONTACT_SYNC_MAX_RETRY_DELAY", DEFAULT_MAX_RETRY_DELAY_SECONDS)
}

fn default_jitter_factor() -> f64 {
    env_or("CONTACT_SYNC_JITTER_FACTOR", DEFAULT_JITTER_FACTOR)
}

fn default_circuit_breaker_enabled() -> bool {
    env_or("CONTACT_SYNC_CIRCUIT_BREAKER_ENABLED", true)
}

fn default_cb_failure_threshold() -> u32 {
    env_or("CONTACT_SYNC_CB_FAILURE_THRESHOLD", DEFAULT_CB_FAILURE_THRESHOLD)
}

fn default_cb_timeout() -> f64 {
    env_or("CONTACT_SYNC_CB_TIMEOUT", DEFAULT_CB_TIMEOUT_SECONDS)
}

fn default_exponential_backoff() -> bool {
    env_or("CONTACT_SYNC_EXPONENTIAL_BACKOFF", true)
}

fn default_jitter() -> bool {
    env_or("CONTACT_SYNC_JITTER", true)
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_max_retry_attempts(),
            base_retry_delay_seconds: default_base_retry_delay(),
            max_retry_delay_seconds: default_max_retry_delay(),
            jitter_factor: default_jitter_factor(),
            circuit_breaker_enabled: default_circuit_breaker_enabled(),
            circuit_breaker_failure_threshold: default_cb_failure_threshold(),
            circuit_breaker_timeout_seconds: default_cb_timeout(),
            enable_exponential_backoff: default_exponential_backoff(),
            enable_jitter: default_jitter(),
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> SyncResult<()> {
        if self.max_retry_attempts == 0 {
            return Err(errors::invalid_input("max_retry_attempts must be at least 1"));
        }
        if !(self.base_retry_delay_seconds >= 0.0) {
            return Err(errors::invalid_input("base_retry_delay_seconds must not be negative"));
        }
        if !(self.max_retry_delay_seconds >= self.base_retry_delay_seconds) {
            return Err(errors::invalid_input(
                "max_retry_delay_seconds must not be below base_retry_delay_seconds",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(errors::invalid_input("jitter_factor must be within [0, 1]"));
        }
        self.breaker_config().validate()
    }

    /// Overlay this config's failure threshold and open timeout on `base`
    pub fn breaker_config_from(&self, base: &CircuitBreakerConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            timeout_seconds: self.circuit_breaker_timeout_seconds,
            max_timeout_seconds: base.max_timeout_seconds.max(self.circuit_breaker_timeout_seconds),
            ..base.clone()
        }
    }

    /// Breaker configuration over the breaker defaults
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        self.breaker_config_from(&CircuitBreakerConfig::default())
    }
}

/// How an execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    DirectSuccess,
    RetrySuccess,
    RetryExhausted,
    CircuitBreakerBlocked,
    PrimarySuccess,
    FallbackSuccess,
    BothFailed,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::DirectSuccess => "direct_success",
            RecoveryStrategy::RetrySuccess => "retry_success",
            RecoveryStrategy::RetryExhausted => "retry_exhausted",
            RecoveryStrategy::CircuitBreakerBlocked => "circuit_breaker_blocked",
            RecoveryStrategy::PrimarySuccess => "primary_success",
            RecoveryStrategy::FallbackSuccess => "fallback_success",
            RecoveryStrategy::BothFailed => "both_failed",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn serialize_error<S: Serializer>(error: &Option<SyncError>, serializer: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(err) => serializer.serialize_some(&err.to_string()),
        None => serializer.serialize_none(),
    }
}

/// One try of an operation
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAttempt {
    /// 1-based
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<SyncError>,
    pub success: bool,
    /// On a failed attempt, the wait scheduled before the next one. A
    /// successful retry repeats the wait that preceded it.
    pub delay_before_attempt: Duration,
    pub recovery_action: Option<RecoveryAction>,
}

impl RecoveryAttempt {
    fn succeeded(attempt_number: u32, delay_before_attempt: Duration) -> Self {
        Self {
            attempt_number,
            timestamp: Utc::now(),
            error: None,
            success: true,
            delay_before_attempt,
            recovery_action: None,
        }
    }

    fn failed(attempt_number: u32, error: SyncError, recovery_action: RecoveryAction) -> Self {
        Self {
            attempt_number,
            timestamp: Utc::now(),
            error: Some(error),
            success: false,
            delay_before_attempt: Duration::ZERO,
            recovery_action: Some(recovery_action),
        }
    }
}

/// Outcome of a recovery-managed execution, with every attempt made
#[derive(Debug, Clone)]
pub struct RecoveryResult<T> {
    pub success: bool,
    pub result: Option<T>,
    /// Last error raised when `success` is false
    pub error: Option<SyncError>,
    pub attempts: Vec<RecoveryAttempt>,
    pub total_duration: Duration,
    pub recovery_strategy: RecoveryStrategy,
}

impl<T> RecoveryResult<T> {
    fn succeeded(value: T, attempts: Vec<RecoveryAttempt>, started: Instant, strategy: RecoveryStrategy) -> Self {
        Self {
            success: true,
            result: Some(value),
            error: None,
            attempts,
            total_duration: started.elapsed(),
            recovery_strategy: strategy,
        }
    }

    fn failed(error: SyncError, attempts: Vec<RecoveryAttempt>, started: Instant, strategy: RecoveryStrategy) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
            attempts,
            total_duration: started.elapsed(),
            recovery_strategy: strategy,
        }
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// Collapse into a plain result, surfacing the final error on failure
    pub fn into_result(self) -> SyncResult<T> {
        match (self.result, self.error) {
            (Some(value), _) if self.success => Ok(value),
            (_, Some(err)) => Err(err),
            _ => Err(errors::internal(format!(
                "execution ended as {} without a result",
                self.recovery_strategy
            ))),
        }
    }
}

/// Classification-derived guidance for a single error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryRecommendations {
    pub error_category: ErrorCategory,
    pub error_severity: ErrorSeverity,
    pub is_retryable: bool,
    pub should_circuit_break: bool,
    pub recovery_strategy: StrategyDescriptor,
    pub user_message: Option<String>,
    pub recommended_actions: Vec<String>,
}

/// Health report for a recovery manager
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerHealth {
    pub status: String,
    pub max_retry_attempts: u32,
    pub circuit_breaker_enabled: bool,
    pub exponential_backoff_enabled: bool,
    pub circuit_breakers: HealthSummary,
}

fn recommended_actions(category: ErrorCategory) -> &'static [&'static str] {
    match category {
        ErrorCategory::Permission => &[
            "Check IAM permissions for the service account",
            "Verify account is not in the exclusion list",
            "Ensure cross-account trust relationships are configured",
        ],
        ErrorCategory::RateLimit => &[
            "Implement exponential backoff with jitter",
            "Consider reducing request rate",
            "Check if API quotas need to be increased",
        ],
        ErrorCategory::Network => &[
            "Check network connectivity",
            "Verify DNS resolution",
            "Consider increasing timeout values",
        ],
        ErrorCategory::Configuration => &[
            "Validate configuration parameters",
            "Check resource existence and accessibility",
            "Review input data format and values",
        ],
        ErrorCategory::Transient => &[
            "Retry with exponential backoff",
            "Monitor service health status",
            "Consider circuit breaker activation",
        ],
        ErrorCategory::Permanent | ErrorCategory::Unknown => &[],
    }
}

/// Blocking wait used between attempts
pub type SleepFn = Arc<dyn Fn(Duration) + Send + Sync>;

/// Runs operations with classification-driven retries, backoff and
/// per-operation circuit breakers
pub struct RecoveryManager {
    config: RecoveryConfig,
    classifier: Arc<ErrorClassifier>,
    breakers: Arc<CircuitBreakerRegistry>,
    sleep: SleepFn,
}

impl Clone for RecoveryManager {
    fn clone(&self) -> Self {
        // Clones share the classifier, breakers and sleeper
        Self {
            config: self.config.clone(),
            classifier: Arc::clone(&self.classifier),
            breakers: Arc::clone(&self.breakers),
            sleep: Arc::clone(&self.sleep),
        }
    }
}

impl fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("config", &self.config)
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}

impl RecoveryManager {
    /// Create a manager that uses `breakers` for every circuit it needs
    pub fn new(config: RecoveryConfig, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        info!(?config, "Initialized recovery manager");
        Self {
            config,
            classifier: Arc::new(ErrorClassifier::new()),
            breakers,
            sleep: Arc::new(std::thread::sleep),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Replace the blocking sleep between attempts
    pub fn with_sleep<S>(mut self, sleep: S) -> Self
    where
        S: Fn(Duration) + Send + Sync + 'static,
    {
        self.sleep = Arc::new(sleep);
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn circuit_breakers(&self) -> Arc<CircuitBreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    /// Execute `f` with retries, backoff and circuit breaking.
    ///
    /// Never fails itself: every outcome, including breaker rejection and
    /// exhausted retries, is described by the returned [`RecoveryResult`].
    pub fn execute_with_recovery<F, T>(
        &self,
        operation_name: &str,
        mut f: F,
        context: Option<&OperationContext>,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> SyncResult<T>,
    {
        let started = Instant::now();
        let max_attempts = self.config.max_retry_attempts.max(1);
        let mut attempts = Vec::with_capacity(max_attempts as usize);
        let mut last_error = None;

        debug!(operation = operation_name, max_attempts, "Starting recovery-enabled execution");

        // One breaker per operation name, shared by every caller of it
        let breaker = self
            .config
            .circuit_breaker_enabled
            .then(|| self.breakers.get_or_create(operation_name, Some(self.breaker_config())));

        for attempt_number in 1..=max_attempts {
            // Rejections come back as CircuitOpen without running f
            let outcome = match &breaker {
                Some(breaker) => breaker.call(&mut f),
                None => f(),
            };

            match outcome {
                Ok(value) => {
                    // Repeat the wait scheduled by the previous failure
                    let waited = attempts
                        .last()
                        .map(|previous: &RecoveryAttempt| previous.delay_before_attempt)
                        .unwrap_or(Duration::ZERO);
                    attempts.push(RecoveryAttempt::succeeded(attempt_number, waited));
                    let strategy = if attempt_number == 1 {
                        RecoveryStrategy::DirectSuccess
                    } else {
                        info!(
                            operation = operation_name,
                            attempt = attempt_number,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Operation succeeded after retries"
                        );
                        RecoveryStrategy::RetrySuccess
                    };
                    return RecoveryResult::succeeded(value, attempts, started, strategy);
                }
                Err(err) if err.is_circuit_open() => {
                    error!(operation = operation_name, error = %err, "Circuit breaker is open, not retrying");
                    attempts.push(RecoveryAttempt::failed(
                        attempt_number,
                        err.clone(),
                        RecoveryAction::CircuitBreaker,
                    ));
                    return RecoveryResult::failed(
                        err,
                        attempts,
                        started,
                        RecoveryStrategy::CircuitBreakerBlocked,
                    );
                }
                Err(err) => {
                    let classification = self.classifier.classify(&err, context);

                    warn!(
                        operation = operation_name,
                        attempt = attempt_number,
                        error = %err,
                        category = %classification.category,
                        retryable = classification.is_retryable,
                        "Operation attempt failed"
                    );

                    attempts.push(RecoveryAttempt::failed(
                        attempt_number,
                        err.clone(),
                        classification.recovery_action,
                    ));
                    last_error = Some(err);

                    // Stop on the first non-retryable error or the last attempt
                    if !classification.is_retryable {
                        error!(
                            operation = operation_name,
                            reason = classification.user_message.as_deref().unwrap_or("non-retryable"),
                            "Non-retryable error"
                        );
                        break;
                    }

                    if attempt_number >= max_attempts {
                        error!(operation = operation_name, "All retry attempts exhausted");
                        break;
                    }

                    // The failed attempt records the wait before the next one
                    let delay = self.retry_delay(attempt_number, &classification);
                    if let Some(failed) = attempts.last_mut() {
                        failed.delay_before_attempt = delay;
                    }
                    info!(
                        operation = operation_name,
                        retry_in_ms = delay.as_millis() as u64,
                        next_attempt = attempt_number + 1,
                        max_attempts,
                        "Retrying operation"
                    );
                    (self.sleep)(delay);
                }
            }
        }

        let total_duration = started.elapsed();
        error!(
            operation = operation_name,
            attempts = attempts.len(),
            elapsed_ms = total_duration.as_millis() as u64,
            "Operation failed"
        );

        RecoveryResult {
            success: false,
            result: None,
            error: last_error,
            attempts,
            total_duration,
            recovery_strategy: RecoveryStrategy::RetryExhausted,
        }
    }

    /// Run `primary`; if it ultimately fails, run `fallback`. Each gets its
    /// own retry budget and circuit breaker.
    pub fn execute_with_fallback<P, B, T>(
        &self,
        primary: P,
        fallback: B,
        operation_name: &str,
        context: Option<&OperationContext>,
    ) -> RecoveryResult<T>
    where
        P: FnMut() -> SyncResult<T>,
        B: FnMut() -> SyncResult<T>,
    {
        debug!(operation = operation_name, "Executing with fallback");

        let mut primary_result =
            self.execute_with_recovery(&format!("{}_primary", operation_name), primary, context);
        if primary_result.success {
            primary_result.recovery_strategy = RecoveryStrategy::PrimarySuccess;
            return primary_result;
        }

        warn!(operation = operation_name, "Primary operation failed, trying fallback");

        let mut fallback_result =
            self.execute_with_recovery(&format!("{}_fallback", operation_name), fallback, context);
        if fallback_result.success {
            info!(operation = operation_name, "Fallback operation succeeded");
            fallback_result.recovery_strategy = RecoveryStrategy::FallbackSuccess;
        } else {
            error!(operation = operation_name, "Both primary and fallback operations failed");
            fallback_result.recovery_strategy = RecoveryStrategy::BothFailed;
        }
        fallback_result
    }

    /// Un-jittered delay in seconds before the attempt after `attempt_number`
    pub fn backoff_seconds(&self, attempt_number: u32, multiplier: f64) -> f64 {
        let base = self.config.base_retry_delay_seconds;
        let attempt = attempt_number.max(1);

        let delay = if self.config.enable_exponential_backoff {
            base * multiplier.powi(attempt as i32 - 1)
        } else {
            base * multiplier * f64::from(attempt)
        };

        delay.min(self.config.max_retry_delay_seconds)
    }

    /// Delay to wait after a failed attempt, jittered when enabled
    pub fn retry_delay(&self, attempt_number: u32, classification: &Classification) -> Duration {
        let mut delay = self.backoff_seconds(attempt_number, classification.retry_delay_multiplier);

        if self.config.enable_jitter {
            let spread = delay * self.config.jitter_factor;
            let jitter = (fastrand::f64() * 2.0 - 1.0) * spread;
            delay = (delay + jitter).max(MIN_JITTERED_DELAY_SECONDS);
        }

        // Delays beyond Duration's range saturate rather than vanish
        saturating_duration(delay)
    }

    /// Breaker config for an operation: this manager's threshold and
    /// timeout over the registry's defaults
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        self.config.breaker_config_from(self.breakers.default_config())
    }

    /// Classify `error` and describe how to recover, without running anything
    pub fn recovery_recommendations(
        &self,
        error: &SyncError,
        context: Option<&OperationContext>,
    ) -> RecoveryRecommendations {
        let classification = self.classifier.classify(error, context);
        let recovery_strategy = self.classifier.recovery_strategy_for(&classification);

        RecoveryRecommendations {
            error_category: classification.category,
            error_severity: classification.severity,
            is_retryable: classification.is_retryable,
            should_circuit_break: classification.should_circuit_break,
            recovery_strategy,
            recommended_actions: recommended_actions(classification.category)
                .iter()
                .map(|action| action.to_string())
                .collect(),
            user_message: classification.user_message,
        }
    }

    pub fn health_status(&self) -> ManagerHealth {
        ManagerHealth {
            status: "healthy".to_string(),
            max_retry_attempts: self.config.max_retry_attempts,
            circuit_breaker_enabled: self.config.circuit_breaker_enabled,
            exponential_backoff_enabled: self.config.enable_exponential_backoff,
            circuit_breakers: self.breakers.health_summary(),
        }
    }
}

/// Components whose outbound calls go through a shared [`RecoveryManager`]
pub trait Recoverable {
    fn recovery_manager(&self) -> &RecoveryManager;

    /// Run `f` under recovery and collapse the outcome to a plain result
    fn protected_operation<F, T>(
        &self,
        operation_name: &str,
        f: F,
        context: &OperationContext,
    ) -> SyncResult<T>
    where
        F: FnMut() -> SyncResult<T>,
    {
        let result = self
            .recovery_manager()
            .execute_with_recovery(operation_name, f, Some(context));

        if !result.success {
            error!(
                operation = operation_name,
                strategy = %result.recovery_strategy,
                attempts = result.attempt_count(),
                context = %context,
                "Protected operation failed"
            );
        }
        result.into_result()
    }
}
