//! Resilient execution core for propagating account contact information
//! across an organization.
//!
//! Outbound calls are classified on failure, retried with backoff and
//! jitter, and guarded by per-operation circuit breakers shared through a
//! [`CircuitBreakerRegistry`].

pub mod accounts;
pub mod circuit_breaker;
pub mod classifier;
pub mod config;
pub mod error;
pub mod processor;
pub mod recovery;
pub mod registry;

pub use accounts::{
    AccountContactApi, AlternateContact, AlternateContactType, ContactDetails, ContactInformation, ContactType,
    ResilientAccountClient,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use classifier::{Classification, ErrorClassifier, RecoveryAction, StrategyDescriptor, StrategyKind};
pub use config::{load_config, SyncConfig};
pub use error::{
    errors, ErrorCategory, ErrorSeverity, NetworkErrorKind, OperationContext, SyncError, SyncResult,
};
pub use processor::{
    AccountProcessor, AccountSyncResult, AccountSyncStatus, AccountUpdateRequest, HandlerResponse,
    ProcessorConfig,
};
pub use recovery::{
    Recoverable, RecoveryAttempt, RecoveryConfig, RecoveryManager, RecoveryRecommendations,
    RecoveryResult, RecoveryStrategy,
};
pub use registry::{CircuitBreakerRegistry, HealthStatus, HealthSummary};

#[cfg(test)]
mod tests;
