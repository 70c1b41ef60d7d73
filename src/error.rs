use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Transport-level failure kinds surfaced by an SDK before any remote
/// error code is available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    ConnectionRefused,
    ConnectionReset,
    Timeout,
    Dns,
    Other,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkErrorKind::ConnectionRefused => write!(f, "connection refused"),
            NetworkErrorKind::ConnectionReset => write!(f, "connection reset"),
            NetworkErrorKind::Timeout => write!(f, "timed out"),
            NetworkErrorKind::Dns => write!(f, "dns resolution failed"),
            NetworkErrorKind::Other => write!(f, "network failure"),
        }
    }
}

/// Error type for every outbound operation guarded by the recovery core.
///
/// Each variant is a stable tag the classifier matches on; remote API
/// failures keep the service's own error code verbatim.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Remote API rejected the call with an error code
    #[error("{code}: {message}")]
    Service { code: String, message: String },

    /// The request never produced a remote response
    #[error("Network error ({kind}): {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    /// Malformed data or an invalid argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A circuit breaker refused to admit the call
    #[error("Circuit breaker '{name}' is open (retry after {retry_after:?})")]
    CircuitOpen { name: String, retry_after: Duration },

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Stable code string for logging and retryability lookups
    pub fn code(&self) -> &str {
        match self {
            SyncError::Service { code, .. } => code,
            SyncError::Network { .. } => "NetworkError",
            SyncError::InvalidInput(_) => "InvalidInput",
            SyncError::CircuitOpen { .. } => "CircuitBreakerOpen",
            SyncError::Internal(_) => "InternalError",
        }
    }

    /// Returns true if this error is a breaker rejection rather than an
    /// operation failure
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, SyncError::CircuitOpen { .. })
    }

    /// Seconds until the rejecting breaker will admit a trial call
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Result alias for guarded operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Helpers for building `SyncError` values
pub mod errors {
    use super::*;

    /// Remote API error with a service code
    pub fn service(code: impl Into<String>, message: impl Into<String>) -> SyncError {
        SyncError::Service {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn throttled(message: impl Into<String>) -> SyncError {
        service("ThrottlingException", message)
    }

    pub fn access_denied(message: impl Into<String>) -> SyncError {
        service("AccessDeniedException", message)
    }

    /// Transport failure of the given kind
    pub fn network(kind: NetworkErrorKind, message: impl fmt::Display) -> SyncError {
        SyncError::Network {
            kind,
            message: message.to_string(),
        }
    }

    pub fn invalid_input(reason: impl fmt::Display) -> SyncError {
        SyncError::InvalidInput(reason.to_string())
    }

    pub fn internal(reason: impl fmt::Display) -> SyncError {
        SyncError::Internal(reason.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::ConnectionRefused => NetworkErrorKind::ConnectionRefused,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                NetworkErrorKind::ConnectionReset
            }
            ErrorKind::TimedOut | ErrorKind::WouldBlock => NetworkErrorKind::Timeout,
            ErrorKind::NotConnected | ErrorKind::AddrNotAvailable => NetworkErrorKind::Other,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => {
                return SyncError::InvalidInput(err.to_string())
            }
            _ => return SyncError::Internal(err.to_string()),
        };

        SyncError::Network {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::InvalidInput(err.to_string())
    }
}

/// Severity levels for alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Minor issues, log only
    Low,
    /// Moderate issues that may need attention if they repeat
    Medium,
    /// Serious issues that need attention now
    High,
    /// The sync cannot proceed at all
    Critical,
}

/// Error categories driving retry and recovery decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Temporary service-side failures
    Transient,
    /// Failures that will not change on retry
    Permanent,
    /// Access denied or unauthorized
    Permission,
    /// Invalid parameters, missing resources, disabled features
    Configuration,
    /// Throttling
    RateLimit,
    /// Connectivity problems
    Network,
    /// Nothing better is known
    Unknown,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "low"),
            ErrorSeverity::Medium => write!(f, "medium"),
            ErrorSeverity::High => write!(f, "high"),
            ErrorSeverity::Critical => write!(f, "critical"),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
            ErrorCategory::Permission => write!(f, "permission"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::RateLimit => write!(f, "rate_limit"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}

/// Opaque key-value bag describing the operation being attempted.
///
/// Only used for log fields; the recovery core never interprets it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext(BTreeMap<String, String>);

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, replacing any previous value for the key
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}={}", key, value)?;
            first = false;
        }
        Ok(())
    }
}
