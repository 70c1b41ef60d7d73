use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorCategory, ErrorSeverity, OperationContext, SyncError};

/// What the caller should do once an error has been classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    ExponentialBackoff,
    CircuitBreaker,
    SkipAccount,
    LogAndSkip,
    AbortOperation,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::ExponentialBackoff => "exponential_backoff",
            RecoveryAction::CircuitBreaker => "circuit_breaker",
            RecoveryAction::SkipAccount => "skip_account",
            RecoveryAction::LogAndSkip => "log_and_skip",
            RecoveryAction::AbortOperation => "abort_operation",
        }
    }

    /// Parse an action name; unknown names map to `LogAndSkip`
    pub fn from_name(name: &str) -> Self {
        match name {
            "retry" => RecoveryAction::Retry,
            "exponential_backoff" => RecoveryAction::ExponentialBackoff,
            "circuit_breaker" => RecoveryAction::CircuitBreaker,
            "skip_account" => RecoveryAction::SkipAccount,
            "abort_operation" => RecoveryAction::AbortOperation,
            _ => RecoveryAction::LogAndSkip,
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying a single error. Produced fresh per call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub is_retryable: bool,
    pub should_circuit_break: bool,
    /// Scales the base retry delay; never negative
    pub retry_delay_multiplier: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retry_attempts: Option<u32>,
    pub recovery_action: RecoveryAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
}

impl Classification {
    /// Start a non-retryable classification that logs and skips
    pub fn new(category: ErrorCategory, severity: ErrorSeverity) -> Self {
        Self {
            category,
            severity,
            is_retryable: false,
            should_circuit_break: false,
            retry_delay_multiplier: 1.0,
            max_retry_attempts: None,
            recovery_action: RecoveryAction::LogAndSkip,
            user_message: None,
        }
    }

    /// Mark retryable with an attempt cap
    pub fn retryable(mut self, max_attempts: u32) -> Self {
        self.is_retryable = true;
        self.max_retry_attempts = Some(max_attempts);
        self
    }

    pub fn circuit_break(mut self) -> Self {
        self.should_circuit_break = true;
        self
    }

    pub fn delay_multiplier(mut self, multiplier: f64) -> Self {
        self.retry_delay_multiplier = multiplier.max(0.0);
        self
    }

    pub fn action(mut self, action: RecoveryAction) -> Self {
        self.recovery_action = action;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.user_message = Some(message.into());
        self
    }

    /// Safe fallback used when classification itself fails
    pub fn unclassified() -> Self {
        Self::new(ErrorCategory::Unknown, ErrorSeverity::Medium)
            .action(RecoveryAction::LogAndSkip)
            .message("Unclassified error occurred")
    }
}

/// Coarse kind of a recovery strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Retry,
    CircuitBreak,
    Skip,
    Abort,
}

/// Human-facing description of how to recover from a classified error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDescriptor {
    pub action: StrategyKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<f64>,
    pub description: String,
}

/// Breaker cooldown advertised by the circuit_breaker strategy
const CIRCUIT_BREAKER_COOLDOWN_SECS: f64 = 300.0;

/// Medium-severity errors notify only once they repeat this often
const MEDIUM_SEVERITY_NOTIFY_THRESHOLD: u32 = 3;

/// Maps errors to classifications.
///
/// Known remote codes are looked up exactly; anything else falls through
/// to substring heuristics on the code. The table is per instance so
/// callers can register extra codes with [`ErrorClassifier::with_mapping`].
#[derive(Clone)]
pub struct ErrorClassifier {
    known_codes: HashMap<String, Classification>,
    rules: Vec<ClassificationRule>,
}

/// Caller-supplied rule consulted before the code table; `None` passes
pub type ClassificationRule =
    Arc<dyn Fn(&SyncError, Option<&OperationContext>) -> Option<Classification> + Send + Sync>;

impl fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorClassifier")
            .field("known_codes", &self.known_codes.len())
            .field("rules", &self.rules.len())
            .finish()
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    pub fn new() -> Self {
        let mut known_codes = HashMap::new();

        let rate_limited = |msg: &str| {
            Classification::new(ErrorCategory::RateLimit, ErrorSeverity::Medium)
                .retryable(5)
                .delay_multiplier(2.0)
                .action(RecoveryAction::ExponentialBackoff)
                .message(msg)
        };
        let unavailable = |msg: &str| {
            Classification::new(ErrorCategory::Transient, ErrorSeverity::High)
                .retryable(3)
                .circuit_break()
                .delay_multiplier(1.5)
                .action(RecoveryAction::CircuitBreaker)
                .message(msg)
        };
        let timed_out = |msg: &str| {
            Classification::new(ErrorCategory::Network, ErrorSeverity::Medium)
                .retryable(3)
                .action(RecoveryAction::Retry)
                .message(msg)
        };
        let denied = |msg: &str| {
            Classification::new(ErrorCategory::Permission, ErrorSeverity::High)
                .action(RecoveryAction::SkipAccount)
                .message(msg)
        };
        let invalid = |action: RecoveryAction, msg: &str| {
            Classification::new(ErrorCategory::Configuration, ErrorSeverity::Medium)
                .action(action)
                .message(msg)
        };
        let org_missing = |msg: &str| {
            Classification::new(ErrorCategory::Configuration, ErrorSeverity::Critical)
                .circuit_break()
                .action(RecoveryAction::AbortOperation)
                .message(msg)
        };

        let entries = [
            ("ThrottlingException", rate_limited("Request was throttled, retrying with backoff")),
            ("Throttling", rate_limited("Request was throttled, retrying with backoff")),
            ("TooManyRequestsException", rate_limited("Too many requests, retrying with backoff")),
            ("RequestLimitExceeded", rate_limited("Request limit exceeded, retrying with backoff")),
            ("ServiceUnavailableException", unavailable("AWS service temporarily unavailable")),
            ("ServiceUnavailable", unavailable("AWS service temporarily unavailable")),
            ("InternalServerError", unavailable("AWS internal server error")),
            ("InternalError", unavailable("AWS internal server error")),
            ("InternalFailure", unavailable("AWS internal server error")),
            ("RequestTimeout", timed_out("Request timed out")),
            ("RequestTimeoutException", timed_out("Request timed out")),
            ("AccessDeniedException", denied("Insufficient permissions to access account")),
            ("AccessDenied", denied("Insufficient permissions to access account")),
            ("UnauthorizedOperation", denied("Operation not authorized")),
            ("ForbiddenException", denied("Access forbidden")),
            ("ValidationException", invalid(RecoveryAction::LogAndSkip, "Invalid request parameters")),
            ("InvalidParameterValue", invalid(RecoveryAction::LogAndSkip, "Invalid parameter value")),
            ("InvalidParameterException", invalid(RecoveryAction::LogAndSkip, "Invalid parameter value")),
            ("InvalidInputException", invalid(RecoveryAction::LogAndSkip, "Invalid input")),
            ("ConflictException", invalid(RecoveryAction::LogAndSkip, "Resource conflict")),
            ("ResourceNotFoundException", invalid(RecoveryAction::SkipAccount, "Resource not found")),
            ("AccountNotFoundException", invalid(RecoveryAction::SkipAccount, "Account not found")),
            ("AWSOrganizationsNotInUseException", org_missing("AWS Organizations is not enabled")),
            ("OrganizationNotFoundException", org_missing("Organization not found")),
        ];

        for (code, classification) in entries {
            known_codes.insert(code.to_string(), classification);
        }

        Self {
            known_codes,
            rules: Vec::new(),
        }
    }

    /// Register or replace the classification for an exact error code
    pub fn with_mapping(mut self, code: impl Into<String>, classification: Classification) -> Self {
        self.known_codes.insert(code.into(), classification);
        self
    }

    /// Add a rule evaluated, in registration order, before any built-in
    /// classification
    pub fn with_rule<R>(mut self, rule: R) -> Self
    where
        R: Fn(&SyncError, Option<&OperationContext>) -> Option<Classification> + Send + Sync + 'static,
    {
        self.rules.push(Arc::new(rule));
        self
    }

    /// Classify an error. Never panics; internal failures yield
    /// [`Classification::unclassified`].
    pub fn classify(&self, error: &SyncError, context: Option<&OperationContext>) -> Classification {
        match panic::catch_unwind(AssertUnwindSafe(|| self.classify_inner(error, context))) {
            Ok(classification) => classification,
            Err(_) => {
                error!(error = %error, "Error during error classification, using default");
                Classification::unclassified()
            }
        }
    }

    fn classify_inner(&self, error: &SyncError, context: Option<&OperationContext>) -> Classification {
        // Caller rules win over the table and heuristics
        if let Some(classification) = self.rules.iter().find_map(|rule| rule(error, context)) {
            debug!(code = error.code(), category = %classification.category, "Classified by custom rule");
            return classification;
        }

        let ctx = context.map(ToString::to_string).unwrap_or_default();

        match error {
            SyncError::Service { code, message } => self.classify_code(code, message, &ctx),
            SyncError::Network { kind, .. } => {
                debug!(kind = %kind, context = %ctx, "Classified transport failure as network");
                Classification::new(ErrorCategory::Network, ErrorSeverity::Medium)
                    .retryable(3)
                    .action(RecoveryAction::Retry)
                    .message(format!("Network connectivity issue: {}", kind))
            }
            SyncError::InvalidInput(_) => {
                Classification::new(ErrorCategory::Configuration, ErrorSeverity::Medium)
                    .action(RecoveryAction::LogAndSkip)
                    .message("Invalid data format")
            }
            SyncError::CircuitOpen { name, .. } => {
                Classification::new(ErrorCategory::Transient, ErrorSeverity::Medium)
                    .circuit_break()
                    .action(RecoveryAction::CircuitBreaker)
                    .message(format!("Circuit breaker '{}' is protecting a failing dependency", name))
            }
            SyncError::Internal(reason) => {
                warn!(reason = %reason, context = %ctx, "Classifying unknown error");
                Classification::new(ErrorCategory::Unknown, ErrorSeverity::Medium)
                    .action(RecoveryAction::LogAndSkip)
                    .message("Unknown error")
            }
        }
    }

    fn classify_code(&self, code: &str, message: &str, ctx: &str) -> Classification {
        if let Some(known) = self.known_codes.get(code) {
            info!(code, category = %known.category, "Classified AWS error");
            return known.clone();
        }

        warn!(code, error_message = message, context = %ctx, "Unknown AWS error code");

        let lowered = code.to_lowercase();
        let has_any = |needles: &[&str]| needles.iter().any(|n| lowered.contains(n));

        if has_any(&["throttl", "limit"]) {
            Classification::new(ErrorCategory::RateLimit, ErrorSeverity::Medium)
                .retryable(5)
                .delay_multiplier(2.0)
                .action(RecoveryAction::ExponentialBackoff)
                .message(format!("Rate limiting error: {}", code))
        } else if has_any(&["access", "denied", "unauthorized"]) {
            Classification::new(ErrorCategory::Permission, ErrorSeverity::High)
                .action(RecoveryAction::SkipAccount)
                .message(format!("Permission error: {}", code))
        } else if has_any(&["invalid", "validation"]) {
            Classification::new(ErrorCategory::Configuration, ErrorSeverity::Medium)
                .action(RecoveryAction::LogAndSkip)
                .message(format!("Configuration error: {}", code))
        } else {
            Classification::new(ErrorCategory::Unknown, ErrorSeverity::Medium)
                .retryable(2)
                .action(RecoveryAction::Retry)
                .message(format!("Unknown AWS error: {}", code))
        }
    }

    /// Whether a remote error code is worth retrying, from the same table
    /// and heuristics `classify` uses
    pub fn is_retryable_code(&self, code: &str) -> bool {
        let error = SyncError::Service {
            code: code.to_string(),
            message: String::new(),
        };
        self.classify(&error, None).is_retryable
    }

    /// Decide whether an error should reach a human
    pub fn should_notify(&self, classification: &Classification, occurrence_count: u32) -> bool {
        match classification.severity {
            ErrorSeverity::Critical | ErrorSeverity::High => true,
            ErrorSeverity::Medium => occurrence_count >= MEDIUM_SEVERITY_NOTIFY_THRESHOLD,
            ErrorSeverity::Low => false,
        }
    }

    /// Strategy descriptor for a classification's recovery action
    pub fn recovery_strategy_for(&self, classification: &Classification) -> StrategyDescriptor {
        match classification.recovery_action {
            RecoveryAction::Retry => StrategyDescriptor {
                action: StrategyKind::Retry,
                max_attempts: Some(classification.max_retry_attempts.unwrap_or(3)),
                delay_multiplier: Some(classification.retry_delay_multiplier),
                cooldown_seconds: None,
                description: "Retry the operation with standard backoff".to_string(),
            },
            RecoveryAction::ExponentialBackoff => StrategyDescriptor {
                action: StrategyKind::Retry,
                max_attempts: Some(classification.max_retry_attempts.unwrap_or(5)),
                delay_multiplier: Some(classification.retry_delay_multiplier),
                cooldown_seconds: None,
                description: "Retry with exponential backoff for rate limiting".to_string(),
            },
            RecoveryAction::CircuitBreaker => StrategyDescriptor {
                action: StrategyKind::CircuitBreak,
                max_attempts: None,
                delay_multiplier: None,
                cooldown_seconds: Some(CIRCUIT_BREAKER_COOLDOWN_SECS),
                description: "Activate circuit breaker to prevent cascading failures".to_string(),
            },
            RecoveryAction::SkipAccount => StrategyDescriptor {
                action: StrategyKind::Skip,
                max_attempts: None,
                delay_multiplier: None,
                cooldown_seconds: None,
                description: "Skip this account and continue with others".to_string(),
            },
            RecoveryAction::LogAndSkip => Self::log_and_skip_strategy(),
            RecoveryAction::AbortOperation => StrategyDescriptor {
                action: StrategyKind::Abort,
                max_attempts: None,
                delay_multiplier: None,
                cooldown_seconds: None,
                description: "Abort the entire synchronization operation".to_string(),
            },
        }
    }

    /// Strategy descriptor for an action given by name; unknown names get
    /// the log-and-skip strategy
    pub fn recovery_strategy_for_action(&self, action: &str, classification: &Classification) -> StrategyDescriptor {
        let mut adjusted = classification.clone();
        adjusted.recovery_action = RecoveryAction::from_name(action);
        self.recovery_strategy_for(&adjusted)
    }

    fn log_and_skip_strategy() -> StrategyDescriptor {
        StrategyDescriptor {
            action: StrategyKind::Skip,
            max_attempts: None,
            delay_multiplier: None,
            cooldown_seconds: None,
            description: "Log the error and skip this operation".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{errors, NetworkErrorKind};

    #[test]
    fn test_known_codes_use_table() {
        let classifier = ErrorClassifier::new();

        let throttled = classifier.classify(&errors::throttled("Rate exceeded"), None);
        assert_eq!(throttled.category, ErrorCategory::RateLimit);
        assert!(throttled.is_retryable);
        assert_eq!(throttled.retry_delay_multiplier, 2.0);
        assert_eq!(throttled.max_retry_attempts, Some(5));
        assert_eq!(throttled.recovery_action, RecoveryAction::ExponentialBackoff);

        let denied = classifier.classify(&errors::access_denied("nope"), None);
        assert_eq!(denied.category, ErrorCategory::Permission);
        assert_eq!(denied.severity, ErrorSeverity::High);
        assert!(!denied.is_retryable);
        assert_eq!(denied.recovery_action, RecoveryAction::SkipAccount);

        let org = classifier.classify(
            &errors::service("AWSOrganizationsNotInUseException", "not in use"),
            None,
        );
        assert_eq!(org.severity, ErrorSeverity::Critical);
        assert!(org.should_circuit_break);
        assert_eq!(org.recovery_action, RecoveryAction::AbortOperation);
    }

    #[test]
    fn test_account_not_found_is_not_retryable() {
        let classifier = ErrorClassifier::new();
        assert!(!classifier.is_retryable_code("AccountNotFoundException"));
        assert!(classifier.is_retryable_code("RequestLimitExceeded"));
        assert!(classifier.is_retryable_code("InternalError"));
    }

    #[test]
    fn test_heuristics_for_unknown_codes() {
        let classifier = ErrorClassifier::new();

        let c = classifier.classify(&errors::service("SlowDownThrottled", ""), None);
        assert_eq!(c.category, ErrorCategory::RateLimit);
        assert!(c.is_retryable);

        let c = classifier.classify(&errors::service("QuotaLimitReached", ""), None);
        assert_eq!(c.category, ErrorCategory::RateLimit);

        let c = classifier.classify(&errors::service("CrossAccountAccessError", ""), None);
        assert_eq!(c.category, ErrorCategory::Permission);
        assert!(!c.is_retryable);

        let c = classifier.classify(&errors::service("InvalidContactFormat", ""), None);
        assert_eq!(c.category, ErrorCategory::Configuration);
        assert!(!c.is_retryable);

        let c = classifier.classify(&errors::service("SomethingOdd", ""), None);
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert!(c.is_retryable);
        assert_eq!(c.max_retry_attempts, Some(2));
        assert_eq!(c.recovery_action, RecoveryAction::Retry);
    }

    #[test]
    fn test_network_and_input_errors() {
        let classifier = ErrorClassifier::new();

        let c = classifier.classify(&errors::network(NetworkErrorKind::Timeout, "read timed out"), None);
        assert_eq!(c.category, ErrorCategory::Network);
        assert!(c.is_retryable);
        assert_eq!(c.max_retry_attempts, Some(3));

        let c = classifier.classify(&errors::invalid_input("missing City"), None);
        assert_eq!(c.category, ErrorCategory::Configuration);
        assert!(!c.is_retryable);
    }

    #[test]
    fn test_internal_errors_are_not_retried() {
        let classifier = ErrorClassifier::new();
        let c = classifier.classify(&errors::internal("boom"), None);
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert!(!c.is_retryable);
        assert_eq!(c.recovery_action, RecoveryAction::LogAndSkip);
    }

    #[test]
    fn test_should_notify_thresholds() {
        let classifier = ErrorClassifier::new();
        let critical = Classification::new(ErrorCategory::Configuration, ErrorSeverity::Critical);
        let high = Classification::new(ErrorCategory::Permission, ErrorSeverity::High);
        let medium = Classification::new(ErrorCategory::RateLimit, ErrorSeverity::Medium);
        let low = Classification::new(ErrorCategory::Unknown, ErrorSeverity::Low);

        assert!(classifier.should_notify(&critical, 1));
        assert!(classifier.should_notify(&high, 1));
        assert!(!classifier.should_notify(&medium, 2));
        assert!(classifier.should_notify(&medium, 3));
        assert!(!classifier.should_notify(&low, 100));
    }

    #[test]
    fn test_strategy_descriptors() {
        let classifier = ErrorClassifier::new();

        let throttled = classifier.classify(&errors::throttled(""), None);
        let strategy = classifier.recovery_strategy_for(&throttled);
        assert_eq!(strategy.action, StrategyKind::Retry);
        assert_eq!(strategy.max_attempts, Some(5));
        assert_eq!(strategy.delay_multiplier, Some(2.0));

        let unavailable = classifier.classify(&errors::service("ServiceUnavailableException", ""), None);
        let strategy = classifier.recovery_strategy_for(&unavailable);
        assert_eq!(strategy.action, StrategyKind::CircuitBreak);
        assert_eq!(strategy.cooldown_seconds, Some(300.0));

        let fallback = classifier.recovery_strategy_for_action("reboot_the_world", &throttled);
        assert_eq!(fallback.action, StrategyKind::Skip);
        assert_eq!(fallback.description, "Log the error and skip this operation");
    }

    #[test]
    fn test_custom_mapping_overrides_table() {
        let classifier = ErrorClassifier::new().with_mapping(
            "ConflictException",
            Classification::new(ErrorCategory::Transient, ErrorSeverity::Low)
                .retryable(4)
                .action(RecoveryAction::Retry),
        );
        let c = classifier.classify(&errors::service("ConflictException", ""), None);
        assert_eq!(c.category, ErrorCategory::Transient);
        assert!(c.is_retryable);
    }

    #[test]
    fn test_rules_run_before_table() {
        let classifier = ErrorClassifier::new().with_rule(|error, context| {
            let is_sandbox = context.and_then(|c| c.get("account_id")) == Some("000000000000");
            (is_sandbox && error.code() == "AccessDeniedException").then(|| {
                Classification::new(ErrorCategory::Permission, ErrorSeverity::Low)
                    .action(RecoveryAction::LogAndSkip)
            })
        });
        let sandbox = OperationContext::new().with("account_id", "000000000000");

        let c = classifier.classify(&errors::access_denied("nope"), Some(&sandbox));
        assert_eq!(c.severity, ErrorSeverity::Low);

        // Rule passes, table applies
        let c = classifier.classify(&errors::access_denied("nope"), None);
        assert_eq!(c.severity, ErrorSeverity::High);
        assert_eq!(c.recovery_action, RecoveryAction::SkipAccount);
    }

    #[test]
    fn test_panicking_rule_yields_safe_default() {
        let classifier = ErrorClassifier::new().with_rule(|error, _| {
            if error.code() == "ThrottlingException" {
                panic!("rule blew up");
            }
            None
        });

        let c = classifier.classify(&errors::throttled("Rate exceeded"), None);
        assert_eq!(c, Classification::unclassified());
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert_eq!(c.severity, ErrorSeverity::Medium);
        assert!(!c.is_retryable);
        assert_eq!(c.recovery_action, RecoveryAction::LogAndSkip);

        // The classifier stays usable afterwards
        let c = classifier.classify(&errors::access_denied("nope"), None);
        assert_eq!(c.category, ErrorCategory::Permission);
    }
}
